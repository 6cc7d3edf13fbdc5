use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};
use tracing::trace;

use crate::chunk::{AccessMode, ChunkFile, ChunkIndex};
use crate::error::{AppendOutcome, Error, Result};

const HEADER_LEN: u64 = 4;

enum Backend {
    Mmap(MmapMut),
    Descriptor,
}

/// Uncompressed chunk variant: mmap- or descriptor-backed, growable in
/// `page_size` increments up to `max_entries_per_chunk`.
pub(crate) struct NormalChunk {
    file: File,
    block_size: u32,
    page_size: u32,
    max_entries_per_chunk: u64,
    index: ChunkIndex,
    backend: Backend,
    physical_len: u64,
}

impl NormalChunk {
    fn entry_size(&self) -> u64 {
        8 + self.block_size as u64
    }

    pub fn create(
        path: &Path,
        first_ts: u64,
        first_payload: &[u8],
        page_size: u32,
        max_entries_per_chunk: u64,
        mode: AccessMode,
    ) -> Result<Self> {
        let block_size = first_payload.len() as u32;
        if HEADER_LEN + 8 + block_size as u64 > page_size as u64 {
            return Err(Error::InvalidArgument(
                "block_size leaves no room in a single page".into(),
            ));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    Error::AlreadyExists(path.display().to_string())
                } else {
                    Error::Io(e)
                }
            })?;
        file.set_len(page_size as u64)?;
        file.write_at(&block_size.to_le_bytes(), 0)?;
        // payload before timestamp: the timestamp field is the commit marker
        // a torn append leaves zeroed, recovered as "not yet written" on open.
        file.write_at(first_payload, HEADER_LEN + 8)?;
        file.write_at(&first_ts.to_le_bytes(), HEADER_LEN)?;
        file.sync_all()?;

        let mut index = ChunkIndex::new();
        index.push(first_ts);
        let backend = Self::open_backend(&file, page_size as u64, mode)?;
        Ok(Self {
            file,
            block_size,
            page_size,
            max_entries_per_chunk,
            index,
            backend,
            physical_len: page_size as u64,
        })
    }

    pub fn open(
        path: &Path,
        page_size: u32,
        max_entries_per_chunk: u64,
        mode: AccessMode,
    ) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::DoesNotExist(path.display().to_string())
            } else {
                Error::Io(e)
            }
        })?;
        let physical_len = file.metadata()?.len();
        if physical_len < HEADER_LEN + 8 {
            return Err(Error::Corruption(format!(
                "{}: file too small for a chunk header",
                path.display()
            )));
        }
        file.seek(SeekFrom::Start(0))?;
        let mut hdr = [0u8; 4];
        file.read_exact(&mut hdr)?;
        let block_size = u32::from_le_bytes(hdr);
        let entry_size = 8 + block_size as u64;
        let max_possible = (physical_len - HEADER_LEN) / entry_size;

        let mut count: u64 = 0;
        let mut ts_buf = [0u8; 8];
        for slot in (0..max_possible).rev() {
            let off = HEADER_LEN + slot * entry_size;
            file.read_exact_at(&mut ts_buf, off)?;
            if slot == 0 || ts_buf != [0u8; 8] {
                count = slot + 1;
                break;
            }
        }
        trace!(path = %path.display(), recovered = count, max_possible, "tail-scan recovery");

        let mut index = ChunkIndex::new();
        let mut prev_ts: Option<u64> = None;
        for slot in 0..count {
            let off = HEADER_LEN + slot * entry_size;
            file.read_exact_at(&mut ts_buf, off)?;
            let ts = u64::from_le_bytes(ts_buf);
            if let Some(p) = prev_ts {
                if ts < p {
                    return Err(Error::Corruption(format!(
                        "{}: recovered tail is non-monotonic at slot {slot}",
                        path.display()
                    )));
                }
            }
            prev_ts = Some(ts);
            index.push(ts);
        }

        let backend = Self::open_backend(&file, physical_len, mode)?;
        Ok(Self {
            file,
            block_size,
            page_size,
            max_entries_per_chunk,
            index,
            backend,
            physical_len,
        })
    }

    fn open_backend(file: &File, len: u64, mode: AccessMode) -> Result<Backend> {
        match mode {
            AccessMode::Mmap => {
                // SAFETY: the file is exclusively owned by this chunk handle
                // for the lifetime of the mapping; no other writer touches it
                // concurrently (single-writer-per-series discipline, §5).
                let mmap = unsafe { MmapOptions::new().len(len as usize).map_mut(file)? };
                Ok(Backend::Mmap(mmap))
            }
            AccessMode::Descriptor => Ok(Backend::Descriptor),
        }
    }

    fn grow_to(&mut self, needed: u64) -> Result<()> {
        if needed <= self.physical_len {
            return Ok(());
        }
        let page = self.page_size as u64;
        let new_physical = needed.div_ceil(page) * page;
        let was_mmap = matches!(self.backend, Backend::Mmap(_));
        if was_mmap {
            self.backend = Backend::Descriptor;
        }
        self.file.set_len(new_physical)?;
        if was_mmap {
            self.backend = Self::open_backend(&self.file, new_physical, AccessMode::Mmap)?;
        }
        self.physical_len = new_physical;
        Ok(())
    }
}

impl ChunkFile for NormalChunk {
    fn len(&self) -> usize {
        self.index.len()
    }

    fn min_ts(&self) -> u64 {
        self.index.min_ts()
    }

    fn max_ts(&self) -> u64 {
        self.index.max_ts()
    }

    fn get(&self, i: usize) -> Result<(u64, Vec<u8>)> {
        if i >= self.index.len() {
            return Err(Error::InvalidArgument(format!("index {i} out of range")));
        }
        let off = HEADER_LEN + (i as u64) * self.entry_size();
        match &self.backend {
            Backend::Mmap(mmap) => {
                let start = off as usize;
                let ts = u64::from_le_bytes(mmap[start..start + 8].try_into().unwrap());
                let payload = mmap[start + 8..start + 8 + self.block_size as usize].to_vec();
                Ok((ts, payload))
            }
            Backend::Descriptor => {
                let mut ts_buf = [0u8; 8];
                self.file.read_exact_at(&mut ts_buf, off)?;
                let mut payload = vec![0u8; self.block_size as usize];
                self.file.read_exact_at(&mut payload, off + 8)?;
                Ok((u64::from_le_bytes(ts_buf), payload))
            }
        }
    }

    fn find_left(&self, ts: u64) -> usize {
        self.index.find_left(ts)
    }

    fn find_right(&self, ts: u64) -> usize {
        self.index.find_right(ts)
    }

    fn append(&mut self, ts: u64, payload: &[u8]) -> Result<AppendOutcome<()>> {
        if payload.len() as u32 != self.block_size {
            return Err(Error::InvalidArgument(format!(
                "payload length {} != block_size {}",
                payload.len(),
                self.block_size
            )));
        }
        if !self.index.is_empty() && ts < self.index.max_ts() {
            return Err(Error::InvalidArgument(format!(
                "timestamp {ts} precedes max_ts {}",
                self.index.max_ts()
            )));
        }
        let next_index = self.index.len() as u64;
        if next_index >= self.max_entries_per_chunk {
            return Ok(AppendOutcome::Full);
        }
        let entry_size = self.entry_size();
        let needed = HEADER_LEN + (next_index + 1) * entry_size;
        if needed > self.physical_len {
            self.grow_to(needed)?;
        }
        let off = HEADER_LEN + next_index * entry_size;
        match &mut self.backend {
            Backend::Mmap(mmap) => {
                let start = off as usize;
                // payload first, timestamp last: preserves the crash-safety
                // write order the tail-scan in `open` relies on.
                mmap[start + 8..start + 8 + payload.len()].copy_from_slice(payload);
                mmap[start..start + 8].copy_from_slice(&ts.to_le_bytes());
            }
            Backend::Descriptor => {
                self.file.write_at(payload, off + 8)?;
                self.file.write_at(&ts.to_le_bytes(), off)?;
            }
        }
        self.index.push(ts);
        Ok(AppendOutcome::Ok(()))
    }

    fn sync(&mut self) -> Result<()> {
        match &self.backend {
            Backend::Mmap(mmap) => mmap.flush()?,
            Backend::Descriptor => self.file.sync_data()?,
        }
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.sync()?;
        let target = self.physical_len.div_ceil(self.page_size as u64) * self.page_size as u64;
        if target > self.physical_len {
            self.grow_to(target)?;
        }
        Ok(())
    }

    fn physical_size(&self) -> u64 {
        self.physical_len
    }

    fn is_mmap(&self) -> bool {
        matches!(self.backend, Backend::Mmap(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn scenario_1_literal_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chunk.db");
        let mut chunk =
            NormalChunk::create(&path, 0, b"ala ", 4096, 4096, AccessMode::Mmap).unwrap();
        assert!(matches!(chunk.append(1, b"ma  ").unwrap(), AppendOutcome::Ok(())));
        assert!(matches!(chunk.append(4, b"kota").unwrap(), AppendOutcome::Ok(())));
        assert!(matches!(chunk.append(5, b"test").unwrap(), AppendOutcome::Ok(())));

        assert_eq!(chunk.min_ts(), 0);
        assert_eq!(chunk.max_ts(), 5);
        assert_eq!(chunk.block_size, 4);
        assert_eq!(chunk.len(), 4);
        assert_eq!(chunk.get(0).unwrap(), (0, b"ala ".to_vec()));
        assert_eq!(chunk.get(1).unwrap(), (1, b"ma  ".to_vec()));
        assert_eq!(chunk.get(2).unwrap(), (4, b"kota".to_vec()));
        assert_eq!(chunk.get(3).unwrap(), (5, b"test".to_vec()));

        assert_eq!(chunk.find_left(3), 2);
        assert_eq!(chunk.find_right(3), 2);
        assert_eq!(chunk.find_left(4), 2);
        assert_eq!(chunk.find_right(4), 3);

        let boxed: Box<dyn ChunkFile> = Box::new(chunk);
        boxed.close().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);
    }

    #[test]
    fn recovers_after_reopen_in_descriptor_mode() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chunk.db");
        {
            let mut chunk =
                NormalChunk::create(&path, 0, b"aa", 4096, 4096, AccessMode::Mmap).unwrap();
            chunk.append(1, b"bb").unwrap();
            chunk.append(2, b"cc").unwrap();
            let boxed: Box<dyn ChunkFile> = Box::new(chunk);
            boxed.close().unwrap();
        }
        let reopened =
            NormalChunk::open(&path, 4096, 4096, AccessMode::Descriptor).unwrap();
        assert_eq!(reopened.len(), 3);
        assert_eq!(reopened.get(2).unwrap(), (2, b"cc".to_vec()));
    }
}
