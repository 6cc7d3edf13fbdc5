//! Ordered collection of chunks for one series: owns the write-target (last)
//! chunk, lazily opens older chunks, and manages trim/delete/sync and mmap
//! mode transitions. Grounded on the teacher's `CrudArchive`
//! (`crud/mod.rs`) — one type owning several on-disk pieces behind a small
//! set of CRUD-shaped operations — and on `pack/writer.rs`'s roll-to-a-new-
//! output-on-capacity logic, generalized here to rolling to a new chunk.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::chunk::gzip::GzipChunk;
use crate::chunk::normal::NormalChunk;
use crate::chunk::{AccessMode, ChunkFile};
use crate::error::{AppendOutcome, Error, Result};
use crate::metadata::{self, SeriesMetadata, METADATA_FILE};
use crate::range::{RangeIterator, Segment};

const DEFAULT_PAGE_SIZE: u32 = 4096;

struct ChunkSlot {
    first_ts: u64,
    handle: Option<Box<dyn ChunkFile>>,
    finalized: bool,
    pins: Arc<AtomicU64>,
    tombstoned: Arc<AtomicBool>,
}

struct SeriesState {
    chunks: Vec<ChunkSlot>,
    last_entry_ts: Option<u64>,
}

pub struct Series {
    dir: PathBuf,
    meta: SeriesMetadata,
    state: RwLock<SeriesState>,
}

impl Series {
    pub fn create(
        dir: &Path,
        block_size: u32,
        max_entries_per_chunk: u64,
        page_size: Option<u32>,
        gzip_level: u32,
    ) -> Result<Self> {
        if dir.exists() {
            return Err(Error::AlreadyExists(dir.display().to_string()));
        }
        if block_size == 0 || max_entries_per_chunk == 0 {
            return Err(Error::InvalidArgument(
                "block_size and max_entries_per_chunk must be positive".into(),
            ));
        }
        fs::create_dir_all(dir)?;
        let meta = SeriesMetadata {
            block_size,
            max_entries_per_chunk,
            last_entry_synced: None,
            page_size: page_size.unwrap_or(DEFAULT_PAGE_SIZE),
            gzip_level,
        };
        metadata::write_json_atomic(&dir.join(METADATA_FILE), &meta)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            meta,
            state: RwLock::new(SeriesState {
                chunks: Vec::new(),
                last_entry_ts: None,
            }),
        })
    }

    pub fn open(dir: &Path) -> Result<Self> {
        if !dir.exists() {
            return Err(Error::DoesNotExist(dir.display().to_string()));
        }
        let meta: SeriesMetadata = metadata::read_json(&dir.join(METADATA_FILE))?;
        let names = Self::list_chunk_names(dir)?;
        let mut chunks = Vec::with_capacity(names.len());
        let mut last_entry_ts = None;
        let n = names.len();
        for (idx, first_ts) in names.into_iter().enumerate() {
            let is_last = idx + 1 == n;
            if is_last {
                let handle = Self::open_chunk_handle(dir, first_ts, &meta, AccessMode::Mmap)?;
                last_entry_ts = Some(handle.max_ts());
                chunks.push(ChunkSlot {
                    first_ts,
                    handle: Some(handle),
                    finalized: false,
                    pins: Arc::new(AtomicU64::new(0)),
                    tombstoned: Arc::new(AtomicBool::new(false)),
                });
            } else {
                chunks.push(ChunkSlot {
                    first_ts,
                    handle: None,
                    finalized: true,
                    pins: Arc::new(AtomicU64::new(0)),
                    tombstoned: Arc::new(AtomicBool::new(false)),
                });
            }
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            meta,
            state: RwLock::new(SeriesState {
                chunks,
                last_entry_ts,
            }),
        })
    }

    fn list_chunk_names(dir: &Path) -> Result<Vec<u64>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == METADATA_FILE {
                continue;
            }
            if let Ok(n) = name.parse::<u64>() {
                out.push(n);
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    fn chunk_path(dir: &Path, first_ts: u64) -> PathBuf {
        dir.join(first_ts.to_string())
    }

    fn open_chunk_handle(
        dir: &Path,
        first_ts: u64,
        meta: &SeriesMetadata,
        mode: AccessMode,
    ) -> Result<Box<dyn ChunkFile>> {
        let path = Self::chunk_path(dir, first_ts);
        if meta.gzip_level > 0 {
            Ok(Box::new(GzipChunk::open(
                &path,
                meta.max_entries_per_chunk,
                meta.gzip_level,
            )?))
        } else {
            Ok(Box::new(NormalChunk::open(
                &path,
                meta.page_size,
                meta.max_entries_per_chunk,
                mode,
            )?))
        }
    }

    fn create_chunk_handle(
        dir: &Path,
        first_ts: u64,
        first_payload: &[u8],
        meta: &SeriesMetadata,
        mode: AccessMode,
    ) -> Result<Box<dyn ChunkFile>> {
        let path = Self::chunk_path(dir, first_ts);
        if meta.gzip_level > 0 {
            Ok(Box::new(GzipChunk::create(
                &path,
                first_ts,
                first_payload,
                meta.max_entries_per_chunk,
                meta.gzip_level,
            )?))
        } else {
            Ok(Box::new(NormalChunk::create(
                &path,
                first_ts,
                first_payload,
                meta.page_size,
                meta.max_entries_per_chunk,
                mode,
            )?))
        }
    }

    pub fn append(&self, ts: u64, payload: &[u8]) -> Result<()> {
        if payload.len() as u32 != self.meta.block_size {
            return Err(Error::InvalidArgument(format!(
                "payload length {} != block_size {}",
                payload.len(),
                self.meta.block_size
            )));
        }
        let mut state = self.state.write().unwrap();
        if let Some(last) = state.last_entry_ts {
            if ts < last {
                return Err(Error::InvalidArgument(format!(
                    "timestamp {ts} precedes last_entry_ts {last}"
                )));
            }
        }
        if state.chunks.is_empty() {
            let handle =
                Self::create_chunk_handle(&self.dir, ts, payload, &self.meta, AccessMode::Mmap)?;
            state.chunks.push(ChunkSlot {
                first_ts: ts,
                handle: Some(handle),
                finalized: false,
                pins: Arc::new(AtomicU64::new(0)),
                tombstoned: Arc::new(AtomicBool::new(false)),
            });
            state.last_entry_ts = Some(ts);
            return Ok(());
        }

        let idx = state.chunks.len() - 1;
        if state.chunks[idx].handle.is_none() {
            let first_ts = state.chunks[idx].first_ts;
            let handle = Self::open_chunk_handle(&self.dir, first_ts, &self.meta, AccessMode::Mmap)?;
            state.chunks[idx].handle = Some(handle);
        }
        let outcome = state.chunks[idx].handle.as_mut().unwrap().append(ts, payload)?;
        match outcome {
            AppendOutcome::Ok(()) => {
                state.last_entry_ts = Some(ts);
                Ok(())
            }
            AppendOutcome::Full => {
                debug!(dir = %self.dir.display(), ts, "chunk full, rolling to a new chunk");
                state.chunks[idx].finalized = true;
                let handle =
                    Self::create_chunk_handle(&self.dir, ts, payload, &self.meta, AccessMode::Mmap)?;
                state.chunks.push(ChunkSlot {
                    first_ts: ts,
                    handle: Some(handle),
                    finalized: false,
                    pins: Arc::new(AtomicU64::new(0)),
                    tombstoned: Arc::new(AtomicBool::new(false)),
                });
                state.last_entry_ts = Some(ts);
                Ok(())
            }
        }
    }

    pub fn get_current_value(&self) -> Result<(u64, Vec<u8>)> {
        let state = self.state.read().unwrap();
        let last = state.chunks.last().ok_or(Error::NoData)?;
        let handle = last.handle.as_ref().ok_or(Error::NoData)?;
        if handle.len() == 0 {
            return Err(Error::NoData);
        }
        handle.get(handle.len() - 1)
    }

    pub fn last_entry_ts(&self) -> Option<u64> {
        self.state.read().unwrap().last_entry_ts
    }

    pub fn iterate_range(self: &Arc<Self>, ts_from: u64, ts_to: u64) -> Result<RangeIterator> {
        if ts_from > ts_to {
            return Err(Error::InvalidArgument(format!(
                "ts_from {ts_from} > ts_to {ts_to}"
            )));
        }
        let mut state = self.state.write().unwrap();
        let n = state.chunks.len();
        if n == 0 {
            return Ok(RangeIterator::empty());
        }
        let mut start = n - 1;
        for i in 0..n {
            if i + 1 == n || state.chunks[i + 1].first_ts > ts_from {
                start = i;
                break;
            }
        }
        let mut segments = Vec::new();
        for i in start..n {
            if state.chunks[i].first_ts > ts_to {
                break;
            }
            if state.chunks[i].handle.is_none() {
                let first_ts = state.chunks[i].first_ts;
                let handle =
                    Self::open_chunk_handle(&self.dir, first_ts, &self.meta, AccessMode::Mmap)?;
                state.chunks[i].handle = Some(handle);
            }
            state.chunks[i].pins.fetch_add(1, Ordering::SeqCst);
            let handle_ref = state.chunks[i].handle.as_ref().unwrap();
            let lo = handle_ref.find_left(ts_from);
            let hi = handle_ref.find_right(ts_to);
            segments.push(Segment {
                first_ts: state.chunks[i].first_ts,
                lo,
                hi,
                is_last: i == n - 1,
            });
        }
        drop(state);
        Ok(RangeIterator::new(Arc::clone(self), ts_to, segments))
    }

    pub fn trim(&self, ts: u64) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let n = state.chunks.len();
        if n == 0 {
            return Ok(());
        }
        let mut keep = Vec::with_capacity(n);
        for i in 0..n {
            let removable =
                i + 1 < n && state.chunks[i].finalized && state.chunks[i + 1].first_ts <= ts;
            if !removable {
                keep.push(true);
                continue;
            }
            if state.chunks[i].pins.load(Ordering::SeqCst) == 0 {
                keep.push(false);
            } else {
                state.chunks[i].tombstoned.store(true, Ordering::SeqCst);
                keep.push(true);
            }
        }
        let mut kept = Vec::with_capacity(n);
        for (i, slot) in state.chunks.drain(..).enumerate() {
            if keep[i] {
                kept.push(slot);
            } else {
                let first_ts = slot.first_ts;
                if let Some(handle) = slot.handle {
                    handle.close()?;
                }
                fs::remove_file(Self::chunk_path(&self.dir, first_ts))?;
            }
        }
        state.chunks = kept;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        let mut state = self.state.write().unwrap();
        if let Some(last) = state.chunks.last_mut() {
            if let Some(handle) = last.handle.as_mut() {
                handle.sync()?;
            }
        }
        let last_ts = state.last_entry_ts;
        drop(state);
        let mut meta = self.meta.clone();
        meta.last_entry_synced = last_ts;
        metadata::write_json_atomic(&self.dir.join(METADATA_FILE), &meta)
    }

    pub fn close_chunks(&self) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let n = state.chunks.len();
        for slot in state.chunks.iter_mut().take(n.saturating_sub(1)) {
            if slot.pins.load(Ordering::SeqCst) == 0 {
                if let Some(handle) = slot.handle.take() {
                    handle.close()?;
                }
            }
        }
        Ok(())
    }

    pub fn open_chunks_mmap_size(&self) -> u64 {
        let state = self.state.read().unwrap();
        state
            .chunks
            .iter()
            .filter_map(|c| c.handle.as_deref())
            .filter(|h| h.is_mmap())
            .map(|h| h.physical_size())
            .sum()
    }

    fn set_mmap_mode(&self, mode: AccessMode) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let n = state.chunks.len();
        for slot in state.chunks.iter().take(n.saturating_sub(1)) {
            if slot.pins.load(Ordering::SeqCst) != 0 {
                return Err(Error::Busy(format!("chunk {} has active pins", slot.first_ts)));
            }
        }
        if self.meta.gzip_level > 0 {
            return Ok(());
        }
        for i in 0..n.saturating_sub(1) {
            let first_ts = state.chunks[i].first_ts;
            if let Some(handle) = state.chunks[i].handle.take() {
                handle.close()?;
            }
            state.chunks[i].handle =
                Some(Self::open_chunk_handle(&self.dir, first_ts, &self.meta, mode)?);
        }
        Ok(())
    }

    pub fn enable_mmap(&self) -> Result<()> {
        self.set_mmap_mode(AccessMode::Mmap)
    }

    pub fn disable_mmap(&self) -> Result<()> {
        self.set_mmap_mode(AccessMode::Descriptor)
    }

    pub fn close(&self) -> Result<()> {
        self.sync()?;
        let mut state = self.state.write().unwrap();
        for slot in state.chunks.iter_mut() {
            if let Some(handle) = slot.handle.take() {
                handle.close()?;
            }
        }
        Ok(())
    }

    pub fn delete(self) -> Result<()> {
        let mut state = self.state.into_inner().unwrap();
        for slot in state.chunks.drain(..) {
            if let Some(handle) = slot.handle {
                handle.close()?;
            }
        }
        fs::remove_dir_all(&self.dir)?;
        Ok(())
    }

    pub(crate) fn read_entry(&self, first_ts: u64, idx: usize) -> Result<(u64, Vec<u8>)> {
        let state = self.state.read().unwrap();
        let slot = state
            .chunks
            .iter()
            .find(|c| c.first_ts == first_ts)
            .ok_or_else(|| Error::Corruption("pinned chunk went missing".into()))?;
        let handle = slot
            .handle
            .as_ref()
            .ok_or_else(|| Error::Corruption("pinned chunk is not open".into()))?;
        handle.get(idx)
    }

    pub(crate) fn chunk_find_right(&self, first_ts: u64, ts: u64) -> Result<usize> {
        let state = self.state.read().unwrap();
        let slot = state
            .chunks
            .iter()
            .find(|c| c.first_ts == first_ts)
            .ok_or_else(|| Error::Corruption("pinned chunk went missing".into()))?;
        let handle = slot
            .handle
            .as_ref()
            .ok_or_else(|| Error::Corruption("pinned chunk is not open".into()))?;
        Ok(handle.find_right(ts))
    }

    pub(crate) fn release_pin(&self, first_ts: u64) {
        let mut state = self.state.write().unwrap();
        if let Some(pos) = state.chunks.iter().position(|c| c.first_ts == first_ts) {
            let remaining = state.chunks[pos].pins.fetch_sub(1, Ordering::SeqCst) - 1;
            if remaining == 0 && state.chunks[pos].tombstoned.load(Ordering::SeqCst) {
                let slot = state.chunks.remove(pos);
                if let Some(handle) = slot.handle {
                    let _ = handle.close();
                }
                let _ = fs::remove_file(Self::chunk_path(&self.dir, first_ts));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn trim_never_deletes_last_chunk() {
        let dir = tempdir().unwrap();
        let series = Arc::new(Series::create(&dir.path().join("s"), 1, 4, None, 0).unwrap());
        for i in 0..4u64 {
            series.append(i, &[0]).unwrap();
        }
        series.trim(1_000_000).unwrap();
        assert!(series.get_current_value().is_ok());
    }
}
