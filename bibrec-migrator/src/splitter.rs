//! Stream splitter
//!
//! Turns a legacy export (plain, gzip-compressed, or a tar archive of plain or
//! compressed members) into a sequence of raw `<record>...</record>` blobs.
//!
//! Records may straddle input chunk boundaries anywhere, including inside a
//! tag; the splitter keeps the unconsumed tail as the seed of the next chunk.
//! Archive members are split independently.

use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{self, BufReader, Cursor, Read};
use std::ops::ControlFlow;
use std::path::Path;
use thiserror::Error;

const OPEN_TAG: &[u8] = b"<record";
const END_TAG: &[u8] = b"</record>";
const READ_CHUNK_SIZE: usize = 64 * 1024;
const SNIFF_LEN: usize = 512;

/// Splitter errors
#[derive(Debug, Error)]
pub enum SplitError {
    #[error("Cannot open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error while reading export: {0}")]
    Io(#[from] io::Error),
}

/// One legacy record, delimited by `<record` and `</record>` inclusive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord(Vec<u8>);

impl RawRecord {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Incremental record boundary detector
#[derive(Debug, Default)]
pub struct RecordSplitter {
    buffer: Vec<u8>,
    /// Offset before which the buffer is known to hold no end tag
    scan_from: usize,
}

impl RecordSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next input chunk and collect every record it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<RawRecord> {
        self.buffer.extend_from_slice(chunk);

        let mut records = Vec::new();
        let mut consumed = 0;

        loop {
            let search_from = self.scan_from.max(consumed);
            let Some(rel) = find(&self.buffer[search_from..], END_TAG) else {
                // An end tag may begin in the last few bytes; rescan those next time
                self.scan_from = self
                    .buffer
                    .len()
                    .saturating_sub(END_TAG.len() - 1)
                    .max(consumed);
                break;
            };

            let end = search_from + rel + END_TAG.len();
            match rfind_open_tag(&self.buffer[consumed..end]) {
                Some(start) => records.push(RawRecord(self.buffer[consumed + start..end].to_vec())),
                None => tracing::warn!(offset = end, "Closing </record> without opening tag, skipped"),
            }
            consumed = end;
        }

        if consumed > 0 {
            self.buffer.drain(..consumed);
            self.scan_from = self.scan_from.saturating_sub(consumed);
        }

        records
    }

    /// Finish the stream, returning the number of trailing bytes that held
    /// an unterminated record (zero when the tail is only markup/whitespace)
    pub fn finish(self) -> usize {
        match rfind_open_tag(&self.buffer) {
            Some(start) => self.buffer.len() - start,
            None => 0,
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Position of the last `<record` opening tag (not `<records`, `<recordset`, ...)
fn rfind_open_tag(haystack: &[u8]) -> Option<usize> {
    if haystack.len() <= OPEN_TAG.len() {
        return None;
    }
    (0..=haystack.len() - OPEN_TAG.len() - 1).rev().find(|&i| {
        &haystack[i..i + OPEN_TAG.len()] == OPEN_TAG
            && matches!(haystack[i + OPEN_TAG.len()], b'>' | b'/' | b' ' | b'\t' | b'\r' | b'\n')
    })
}

/// Lazy record iterator over a single plain byte stream
pub struct SplitReader<R> {
    reader: R,
    splitter: RecordSplitter,
    pending: std::collections::VecDeque<RawRecord>,
    buf: Vec<u8>,
    done: bool,
}

impl<R: Read> SplitReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_chunk_size(reader, READ_CHUNK_SIZE)
    }

    pub fn with_chunk_size(reader: R, chunk_size: usize) -> Self {
        Self {
            reader,
            splitter: RecordSplitter::new(),
            pending: std::collections::VecDeque::new(),
            buf: vec![0u8; chunk_size.max(1)],
            done: false,
        }
    }
}

impl<R: Read> Iterator for SplitReader<R> {
    type Item = io::Result<RawRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.pending.pop_front() {
                return Some(Ok(record));
            }
            if self.done {
                return None;
            }

            match self.reader.read(&mut self.buf) {
                Ok(0) => {
                    self.done = true;
                    let splitter = std::mem::take(&mut self.splitter);
                    let trailing = splitter.finish();
                    if trailing > 0 {
                        tracing::warn!(trailing_bytes = trailing, "Truncated record at end of stream, skipped");
                    }
                }
                Ok(n) => self.pending.extend(self.splitter.push(&self.buf[..n])),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Counters from one pass over an export
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SplitStats {
    /// Archive members read (1 for a non-archive source)
    pub members: usize,
    pub records: usize,
}

/// Split every record in the export at `path`, handing each one to `sink`.
///
/// `sink` returning `ControlFlow::Break` stops the pass early. The format is
/// sniffed from content, not from the file name.
pub fn for_each_record<F>(path: &Path, mut sink: F) -> Result<SplitStats, SplitError>
where
    F: FnMut(RawRecord) -> ControlFlow<()>,
{
    let file = File::open(path).map_err(|source| SplitError::Open {
        path: path.display().to_string(),
        source,
    })?;

    let mut stats = SplitStats::default();
    let (head, reader) = decode_layer(BufReader::new(file))?;

    if is_tar(&head) {
        tracing::info!(path = %path.display(), "Reading export as tar archive");
        let mut archive = tar::Archive::new(reader);
        for entry in archive.entries()? {
            let entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let member = entry.path()?.display().to_string();
            stats.members += 1;
            tracing::debug!(member = %member, "Splitting archive member");

            let (_, member_reader) = decode_layer(entry)?;
            if split_stream(member_reader, &mut sink, &mut stats)?.is_break() {
                break;
            }
        }
    } else {
        stats.members = 1;
        if split_stream(reader, &mut sink, &mut stats)?.is_break() {
            tracing::debug!(records = stats.records, "Record sink stopped the pass early");
        }
    }

    Ok(stats)
}

/// Read every record of an export into memory
pub fn read_records(path: &Path) -> Result<Vec<RawRecord>, SplitError> {
    let mut records = Vec::new();
    for_each_record(path, |record| {
        records.push(record);
        ControlFlow::Continue(())
    })?;
    Ok(records)
}

fn split_stream<R: Read, F>(
    reader: R,
    sink: &mut F,
    stats: &mut SplitStats,
) -> Result<ControlFlow<()>, SplitError>
where
    F: FnMut(RawRecord) -> ControlFlow<()>,
{
    for record in SplitReader::new(reader) {
        stats.records += 1;
        if sink(record?).is_break() {
            return Ok(ControlFlow::Break(()));
        }
    }
    Ok(ControlFlow::Continue(()))
}

/// Peel off gzip compression if present. Returns the first decoded bytes
/// (for format sniffing) and a reader that still yields them.
fn decode_layer<'a, R: Read + 'a>(reader: R) -> io::Result<(Vec<u8>, Box<dyn Read + 'a>)> {
    let (head, rest) = sniff(reader)?;
    let stream = Cursor::new(head.clone()).chain(rest);

    if is_gzip(&head) {
        let (decoded_head, decoded_rest) = sniff(MultiGzDecoder::new(stream))?;
        let decoded = Cursor::new(decoded_head.clone()).chain(decoded_rest);
        Ok((decoded_head, Box::new(decoded)))
    } else {
        Ok((head, Box::new(stream)))
    }
}

fn sniff<R: Read>(mut reader: R) -> io::Result<(Vec<u8>, R)> {
    let mut head = vec![0u8; SNIFF_LEN];
    let mut filled = 0;
    while filled < SNIFF_LEN {
        match reader.read(&mut head[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    head.truncate(filled);
    Ok((head, reader))
}

fn is_gzip(head: &[u8]) -> bool {
    head.starts_with(&[0x1f, 0x8b])
}

fn is_tar(head: &[u8]) -> bool {
    head.len() >= 262 && &head[257..262] == b"ustar"
}
