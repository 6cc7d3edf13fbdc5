//! The on-disk chunk abstraction: a random-access, append-mostly sequence of
//! `(ts, payload)` entries with an in-memory binary-searchable timestamp
//! index. Two variants share one contract (`ChunkFile`) so `Series` can hold
//! either behind a `Box<dyn ChunkFile>` — mirrors the teacher's `Compressor`
//! trait dispatching over `Store`/`Zstd`.

pub(crate) mod gzip;
pub(crate) mod normal;

use crate::error::{AppendOutcome, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AccessMode {
    Mmap,
    Descriptor,
}

pub(crate) trait ChunkFile: Send {
    fn len(&self) -> usize;
    fn min_ts(&self) -> u64;
    fn max_ts(&self) -> u64;
    fn get(&self, i: usize) -> Result<(u64, Vec<u8>)>;
    fn find_left(&self, ts: u64) -> usize;
    fn find_right(&self, ts: u64) -> usize;
    fn append(&mut self, ts: u64, payload: &[u8]) -> Result<AppendOutcome<()>>;
    fn sync(&mut self) -> Result<()>;
    fn close(self: Box<Self>) -> Result<()>;
    fn physical_size(&self) -> u64;
    fn is_mmap(&self) -> bool;
}

/// In-memory, sorted timestamp directory over one chunk's entries.
///
/// `find_left` is lower_bound, `find_right` is upper_bound — ties resolve to
/// the leftmost equal index for `find_left` and just past the last equal
/// index for `find_right`.
#[derive(Debug, Default, Clone)]
pub(crate) struct ChunkIndex {
    timestamps: Vec<u64>,
}

impl ChunkIndex {
    pub fn new() -> Self {
        Self {
            timestamps: Vec::new(),
        }
    }

    pub fn push(&mut self, ts: u64) {
        self.timestamps.push(ts);
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn min_ts(&self) -> u64 {
        *self.timestamps.first().unwrap_or(&0)
    }

    pub fn max_ts(&self) -> u64 {
        *self.timestamps.last().unwrap_or(&0)
    }

    pub fn find_left(&self, ts: u64) -> usize {
        self.timestamps.partition_point(|&x| x < ts)
    }

    pub fn find_right(&self, ts: u64) -> usize {
        self.timestamps.partition_point(|&x| x <= ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_left_find_right_ties() {
        let mut idx = ChunkIndex::new();
        for ts in [0u64, 1, 1, 4, 4, 4, 5] {
            idx.push(ts);
        }
        assert_eq!(idx.find_left(3), 3);
        assert_eq!(idx.find_right(3), 3);
        assert_eq!(idx.find_left(4), 3);
        assert_eq!(idx.find_right(4), 6);
        assert_eq!(idx.find_left(10), idx.len());
        assert_eq!(idx.find_right(10), idx.len());
        assert_eq!(idx.find_left(0), 0);
    }
}
