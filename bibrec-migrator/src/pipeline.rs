//! Migration pipeline
//!
//! Splitter and chunker run as a single blocking producer feeding a bounded
//! channel; each chunk becomes one spawned task, admitted by a semaphore
//! sized `workers`. Within a chunk records are applied in stream order, each
//! in its own unit of work, and the chunk's written records are bulk-indexed
//! at the end.
//!
//! Cancelling stops dispatch of new chunks. Chunks already running always
//! finish. A resource-level failure inside a chunk cancels the run.

use crate::chunker::{ChunkBuffer, Chunker};
use crate::converter::Converter;
use crate::db::mirror::{self, MirrorSelection};
use crate::error::{PipelineError, PipelineResult};
use crate::index::{IndexReport, IndexerBridge, SearchIndex};
use crate::marcxml::MarcRecord;
use crate::splitter::{for_each_record, RawRecord, SplitError, SplitStats};
use crate::upsert::UpsertEngine;
use crate::utils::{retry_on_conflict, RetryPolicy};
use bibrec_common::config::{MigratorConfig, TomlConfig};
use bibrec_common::CanonicalRecord;
use sqlx::SqlitePool;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How the caller waits for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Return once every chunk is scheduled
    Detached,
    /// Return once every chunk has finished
    Join,
}

/// What a run reads from
#[derive(Debug, Clone)]
pub enum Source {
    /// Legacy export file; `mirror_only` stages mirror rows without converting
    File { path: PathBuf, mirror_only: bool },
    /// Previously staged mirror rows
    Mirror(MirrorSelection),
}

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub dispatch: Dispatch,
    /// Run even when the configuration is not production-safe
    pub force: bool,
}

enum WorkItem {
    Raw(RawRecord),
    Mirrored(u64),
}

/// Per-chunk counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkSummary {
    pub records: usize,
    /// No recid could be recovered; nothing was written
    pub parse_failures: usize,
    /// Mirror rows written by a `mirror_only` run
    pub staged: usize,
    pub migrated: usize,
    pub failed: usize,
    pub index: IndexReport,
}

/// Aggregate counters for a whole run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub chunks: usize,
    pub records: usize,
    pub parse_failures: usize,
    pub staged: usize,
    pub migrated: usize,
    pub failed: usize,
    pub index: IndexReport,
    /// Splitter counters, for file runs
    pub split: Option<SplitStats>,
    /// Dispatch stopped before the source was exhausted
    pub cancelled: bool,
}

impl RunSummary {
    fn absorb(&mut self, chunk: &ChunkSummary) {
        self.records += chunk.records;
        self.parse_failures += chunk.parse_failures;
        self.staged += chunk.staged;
        self.migrated += chunk.migrated;
        self.failed += chunk.failed;
        self.index.merge(chunk.index);
    }
}

/// A run whose chunks are scheduled
pub struct RunHandle {
    tasks: JoinSet<PipelineResult<ChunkSummary>>,
    permits: Arc<Semaphore>,
    scheduled: usize,
    split: Option<SplitStats>,
    cancel: CancellationToken,
    started: Instant,
}

impl RunHandle {
    fn new(workers: usize, cancel: CancellationToken) -> Self {
        Self {
            tasks: JoinSet::new(),
            permits: Arc::new(Semaphore::new(workers.max(1))),
            scheduled: 0,
            split: None,
            cancel,
            started: Instant::now(),
        }
    }

    pub fn scheduled_chunks(&self) -> usize {
        self.scheduled
    }

    pub fn split_stats(&self) -> Option<SplitStats> {
        self.split
    }

    /// Wait for every scheduled chunk
    ///
    /// The first resource-level failure cancels the run and is returned once
    /// the remaining chunks have drained.
    pub async fn join(mut self) -> PipelineResult<RunSummary> {
        let mut summary = RunSummary {
            chunks: self.scheduled,
            split: self.split,
            ..Default::default()
        };
        let mut first_error = None;
        let mut finished = 0usize;

        while let Some(joined) = self.tasks.join_next().await {
            finished += 1;
            match joined {
                Ok(Ok(chunk)) => summary.absorb(&chunk),
                Ok(Err(err)) => {
                    error!(error = %err, "Chunk stopped on resource failure, cancelling run");
                    self.cancel.cancel();
                    first_error.get_or_insert(err);
                }
                Err(join_err) => {
                    error!(error = %join_err, "Chunk task failed, cancelling run");
                    self.cancel.cancel();
                    first_error.get_or_insert(PipelineError::Worker(join_err.to_string()));
                }
            }

            if finished % 10 == 0 || finished == self.scheduled {
                info!(
                    progress = format!("{}/{}", finished, self.scheduled),
                    migrated = summary.migrated,
                    failed = summary.failed,
                    "Migration progress update"
                );
            }
        }

        summary.cancelled = self.cancel.is_cancelled();

        if let Some(err) = first_error {
            return Err(err);
        }

        info!(
            chunks = summary.chunks,
            records = summary.records,
            migrated = summary.migrated,
            failed = summary.failed,
            parse_failures = summary.parse_failures,
            staged = summary.staged,
            indexed = summary.index.indexed,
            elapsed_ms = self.started.elapsed().as_millis(),
            "Migration run completed"
        );

        Ok(summary)
    }
}

pub enum RunOutcome {
    Detached(RunHandle),
    Completed(RunSummary),
}

/// Processes one chunk; shared by every chunk task of a run
struct ChunkWorker {
    pool: SqlitePool,
    converter: Arc<dyn Converter>,
    engine: UpsertEngine,
    bridge: IndexerBridge,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl ChunkWorker {
    async fn process_chunk(
        &self,
        chunk_no: usize,
        items: Vec<WorkItem>,
        mirror_only: bool,
    ) -> PipelineResult<ChunkSummary> {
        let start = Instant::now();
        let mut summary = ChunkSummary::default();
        let mut written: Vec<CanonicalRecord> = Vec::new();

        debug!(chunk = chunk_no, records = items.len(), "Chunk started");

        for item in items {
            if let Err(err) = self.process_item(item, mirror_only, &mut written, &mut summary).await {
                self.cancel.cancel();
                return Err(err);
            }
        }

        if !written.is_empty() {
            summary.index = self.bridge.index_records(written.iter()).await?;
        }

        debug!(
            chunk = chunk_no,
            migrated = summary.migrated,
            failed = summary.failed,
            elapsed_ms = start.elapsed().as_millis(),
            "Chunk finished"
        );

        Ok(summary)
    }

    async fn process_item(
        &self,
        item: WorkItem,
        mirror_only: bool,
        written: &mut Vec<CanonicalRecord>,
        summary: &mut ChunkSummary,
    ) -> PipelineResult<()> {
        let (raw, mirrored) = match item {
            WorkItem::Raw(record) => (record.into_bytes(), None),
            WorkItem::Mirrored(recid) => match mirror::load_raw(&self.pool, recid).await? {
                Some(raw) => (raw, Some(recid)),
                None => {
                    warn!(recid, "Mirror row disappeared before re-migration");
                    return Ok(());
                }
            },
        };
        summary.records += 1;

        let parsed = MarcRecord::parse(&raw).and_then(|marc| marc.recid().map(|recid| (marc, recid)));
        let (marc, recid) = match parsed {
            Ok(parsed) => parsed,
            Err(err) => {
                summary.parse_failures += 1;
                match mirrored {
                    Some(recid) => {
                        warn!(recid, error = %err, "Mirrored record no longer parses");
                        self.mark(recid, false, Some(&err.to_string())).await?;
                    }
                    None => warn!(error = %err, bytes = raw.len(), "Skipping unparseable record"),
                }
                return Ok(());
            }
        };

        if mirrored.is_none() {
            let collection = marc.collections().into_iter().next();
            retry_on_conflict("mirror::stage", &self.retry, || {
                mirror::stage(&self.pool, recid, &raw, collection.as_deref())
            })
            .await?;
        }

        if mirror_only {
            summary.staged += 1;
            return Ok(());
        }

        let outcome = match self.converter.convert(&raw) {
            Err(err) => Err(format!("Conversion failed: {}", err)),
            Ok(json) => match self.engine.upsert(json).await {
                Ok(upserted) => {
                    written.extend(upserted.written().cloned());
                    Ok(())
                }
                Err(err) if err.is_resource_failure() => return Err(PipelineError::Upsert(err)),
                Err(err) => Err(err.to_string()),
            },
        };

        match outcome {
            Ok(()) => {
                self.mark(recid, true, None).await?;
                summary.migrated += 1;
            }
            Err(message) => {
                warn!(recid, error = %message, "Record migration failed");
                self.mark(recid, false, Some(&message)).await?;
                summary.failed += 1;
            }
        }

        Ok(())
    }

    async fn mark(&self, recid: u64, valid: bool, error: Option<&str>) -> PipelineResult<()> {
        retry_on_conflict("mirror::mark", &self.retry, || {
            mirror::mark(&self.pool, recid, valid, error)
        })
        .await?;
        Ok(())
    }
}

/// Migration pipeline over one store and one index
pub struct MigrationPipeline {
    worker: Arc<ChunkWorker>,
    config: MigratorConfig,
}

impl MigrationPipeline {
    pub fn new(
        pool: SqlitePool,
        converter: Arc<dyn Converter>,
        index: Arc<dyn SearchIndex>,
        config: &TomlConfig,
    ) -> Self {
        let retry = RetryPolicy::from(&config.migrator);
        let engine = UpsertEngine::new(pool.clone(), retry, config.records.base_url.clone());

        Self {
            worker: Arc::new(ChunkWorker {
                pool,
                converter,
                engine,
                bridge: IndexerBridge::new(index),
                retry,
                cancel: CancellationToken::new(),
            }),
            config: config.migrator.clone(),
        }
    }

    pub fn engine(&self) -> &UpsertEngine {
        &self.worker.engine
    }

    pub fn bridge(&self) -> &IndexerBridge {
        &self.worker.bridge
    }

    /// Token that stops dispatch of new chunks when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.worker.cancel.clone()
    }

    /// Refuse to migrate in a non-production-safe configuration unless forced
    pub fn check_safety(&self, force: bool) -> PipelineResult<()> {
        if self.config.debug && !force {
            return Err(PipelineError::SafetyCheck(
                "migrator.debug is enabled; pass --force to migrate anyway".to_string(),
            ));
        }
        if self.config.debug {
            warn!("Running with migrator.debug enabled (forced)");
        }
        Ok(())
    }

    pub async fn run(&self, source: Source, options: RunOptions) -> PipelineResult<RunOutcome> {
        self.check_safety(options.force)?;

        let handle = match source {
            Source::File { path, mirror_only } => self.schedule_file(path, mirror_only).await?,
            Source::Mirror(selection) => self.schedule_mirror(selection).await?,
        };

        info!(chunks = handle.scheduled_chunks(), "All chunks scheduled");

        match options.dispatch {
            Dispatch::Detached => Ok(RunOutcome::Detached(handle)),
            Dispatch::Join => Ok(RunOutcome::Completed(handle.join().await?)),
        }
    }

    async fn spawn_chunk(
        &self,
        handle: &mut RunHandle,
        items: Vec<WorkItem>,
        mirror_only: bool,
    ) -> PipelineResult<()> {
        let permit = handle
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| PipelineError::Worker(e.to_string()))?;

        let worker = self.worker.clone();
        let chunk_no = handle.scheduled;
        handle.scheduled += 1;

        handle.tasks.spawn(async move {
            let result = worker.process_chunk(chunk_no, items, mirror_only).await;
            drop(permit);
            result
        });

        Ok(())
    }

    async fn schedule_file(&self, path: PathBuf, mirror_only: bool) -> PipelineResult<RunHandle> {
        info!(path = %path.display(), mirror_only, "Migrating legacy export");

        let cancel = self.worker.cancel.clone();
        let mut handle = RunHandle::new(self.config.workers, cancel.clone());
        let (tx, mut rx) = mpsc::channel::<Vec<WorkItem>>(self.config.workers.max(1));
        let chunk_size = self.config.chunk_size;

        let producer = tokio::task::spawn_blocking(move || {
            let mut buffer = ChunkBuffer::new(chunk_size);
            let mut receiver_gone = false;

            let stats = for_each_record(&path, |record| {
                if cancel.is_cancelled() {
                    return ControlFlow::Break(());
                }
                if let Some(chunk) = buffer.push(WorkItem::Raw(record)) {
                    if tx.blocking_send(chunk).is_err() {
                        receiver_gone = true;
                        return ControlFlow::Break(());
                    }
                }
                ControlFlow::Continue(())
            })?;

            if !receiver_gone && !cancel.is_cancelled() {
                if let Some(chunk) = buffer.finish() {
                    // Receiver only goes away on cancellation
                    let _ = tx.blocking_send(chunk);
                }
            }

            Ok::<SplitStats, SplitError>(stats)
        });

        let mut dispatch_error = None;
        while let Some(chunk) = rx.recv().await {
            if self.worker.cancel.is_cancelled() {
                info!("Run cancelled, no further chunks dispatched");
                break;
            }
            if let Err(err) = self.spawn_chunk(&mut handle, chunk, mirror_only).await {
                dispatch_error = Some(err);
                break;
            }
        }
        drop(rx);

        let produced = match producer.await {
            Ok(result) => result.map_err(PipelineError::from),
            Err(join_err) => Err(PipelineError::Worker(join_err.to_string())),
        };

        match (produced, dispatch_error) {
            (Ok(stats), None) => {
                info!(members = stats.members, records = stats.records, "Export fully split");
                handle.split = Some(stats);
                Ok(handle)
            }
            (Err(err), _) | (Ok(_), Some(err)) => {
                // Chunks already running still finish before the error surfaces
                self.worker.cancel.cancel();
                if let Err(chunk_err) = handle.join().await {
                    warn!(error = %chunk_err, "Chunk failure while draining aborted run");
                }
                Err(err)
            }
        }
    }

    async fn schedule_mirror(&self, selection: MirrorSelection) -> PipelineResult<RunHandle> {
        let recids = mirror::select_recids(&self.worker.pool, selection).await?;
        info!(records = recids.len(), ?selection, "Re-migrating mirror rows");

        let mut handle = RunHandle::new(self.config.workers, self.worker.cancel.clone());
        let items = recids.into_iter().map(WorkItem::Mirrored);

        for chunk in Chunker::new(items, self.config.mirror_chunk_size) {
            if self.worker.cancel.is_cancelled() {
                info!("Run cancelled, no further chunks dispatched");
                break;
            }
            self.spawn_chunk(&mut handle, chunk, false).await?;
        }

        Ok(handle)
    }
}

/// Write the raw bytes of every still-broken mirror row as one `<collection>`
pub async fn write_broken_output(pool: &SqlitePool, path: &Path) -> bibrec_common::Result<usize> {
    let rows = mirror::broken(pool).await?;
    let mut out = BufWriter::new(File::create(path)?);

    writeln!(out, "<collection>")?;
    for row in &rows {
        if let Some(raw) = mirror::load_raw(pool, row.recid).await? {
            out.write_all(&raw)?;
            writeln!(out)?;
        }
    }
    writeln!(out, "</collection>")?;
    out.flush()?;

    info!(path = %path.display(), records = rows.len(), "Broken records written");
    Ok(rows.len())
}
