//! Work-unit splitting: fixed-size, ordered, non-overlapping chunks over a record slice.

use crate::record::Record;
use std::iter::Enumerate;
use std::slice;

/// One bounded batch of records sent to the analyzer as a single prompt.
#[derive(Clone, Copy, Debug)]
pub struct Chunk<'a> {
    /// Zero-based position within the run's chunk sequence.
    pub index: usize,
    pub records: &'a [Record],
}

impl<'a> Chunk<'a> {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn first_id(&self) -> Option<u64> {
        self.records.first().map(|r| r.id)
    }

    pub fn last_id(&self) -> Option<u64> {
        self.records.last().map(|r| r.id)
    }

    pub fn ids(&self) -> impl Iterator<Item = u64> + 'a {
        self.records.iter().map(|r| r.id)
    }

    /// Record texts joined by newlines, in chunk order.
    pub fn prompt_body(&self) -> String {
        let cap = self.records.iter().map(|r| r.text.len() + 1).sum();
        let mut body = String::with_capacity(cap);
        for (i, r) in self.records.iter().enumerate() {
            if i > 0 {
                body.push('\n');
            }
            body.push_str(&r.text);
        }
        body
    }
}

/// Lazy chunk plan. Cheap to copy; every iteration restarts from the first chunk.
#[derive(Clone, Copy, Debug)]
pub struct Chunks<'a> {
    records: &'a [Record],
    size: usize,
}

/// Split `records` into chunks of `chunk_size` (the last may be shorter).
/// A `chunk_size` of zero is treated as one.
pub fn split(records: &[Record], chunk_size: usize) -> Chunks<'_> {
    Chunks { records, size: chunk_size.max(1) }
}

impl<'a> Chunks<'a> {
    /// Number of chunks: `ceil(records / chunk_size)`.
    pub fn len(&self) -> usize {
        self.records.len().div_ceil(self.size)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn chunk_size(&self) -> usize {
        self.size
    }

    pub fn iter(&self) -> ChunkIter<'a> {
        ChunkIter { inner: self.records.chunks(self.size).enumerate() }
    }
}

impl<'a> IntoIterator for Chunks<'a> {
    type Item = Chunk<'a>;
    type IntoIter = ChunkIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct ChunkIter<'a> {
    inner: Enumerate<slice::Chunks<'a, Record>>,
}

impl<'a> Iterator for ChunkIter<'a> {
    type Item = Chunk<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(index, records)| Chunk { index, records })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for ChunkIter<'_> {}
