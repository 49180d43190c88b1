//! Fixed-size batching of records into units of work

/// Groups an iterator into `Vec`s of at most `size` items. The final chunk
/// may be shorter; an empty input yields no chunks.
pub struct Chunker<I> {
    inner: I,
    size: usize,
}

impl<I: Iterator> Chunker<I> {
    pub fn new(inner: I, size: usize) -> Self {
        Self {
            inner,
            size: size.max(1),
        }
    }
}

impl<I: Iterator> Iterator for Chunker<I> {
    type Item = Vec<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk: Vec<I::Item> = self.inner.by_ref().take(self.size).collect();
        if chunk.is_empty() {
            None
        } else {
            Some(chunk)
        }
    }
}

/// Push-style accumulator for producers that receive items one at a time
#[derive(Debug)]
pub struct ChunkBuffer<T> {
    items: Vec<T>,
    size: usize,
}

impl<T> ChunkBuffer<T> {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            items: Vec::with_capacity(size),
            size,
        }
    }

    /// Add an item; returns a full chunk when one is ready
    pub fn push(&mut self, item: T) -> Option<Vec<T>> {
        self.items.push(item);
        if self.items.len() >= self.size {
            Some(std::mem::replace(&mut self.items, Vec::with_capacity(self.size)))
        } else {
            None
        }
    }

    /// Flush the final, possibly shorter, chunk
    pub fn finish(self) -> Option<Vec<T>> {
        if self.items.is_empty() {
            None
        } else {
            Some(self.items)
        }
    }
}
