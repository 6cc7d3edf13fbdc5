use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tracing::debug;

use crate::chunk::{ChunkFile, ChunkIndex};
use crate::error::{AppendOutcome, Error, Result};

const HEADER_LEN: usize = 4;

/// Compressed chunk variant: descriptor-only, fully buffered in memory
/// between open and the next `sync`/`close`, which re-deflates the whole
/// stream to a tempfile and renames it over the chunk path.
pub(crate) struct GzipChunk {
    path: PathBuf,
    block_size: u32,
    max_entries_per_chunk: u64,
    gzip_level: u32,
    index: ChunkIndex,
    entries: Vec<u8>,
    dirty: bool,
}

impl GzipChunk {
    fn entry_size(&self) -> usize {
        8 + self.block_size as usize
    }

    pub fn create(
        path: &Path,
        first_ts: u64,
        first_payload: &[u8],
        max_entries_per_chunk: u64,
        gzip_level: u32,
    ) -> Result<Self> {
        if path.exists() {
            return Err(Error::AlreadyExists(path.display().to_string()));
        }
        let block_size = first_payload.len() as u32;
        let mut index = ChunkIndex::new();
        index.push(first_ts);
        let mut entries = Vec::with_capacity(8 + first_payload.len());
        entries.extend_from_slice(&first_ts.to_le_bytes());
        entries.extend_from_slice(first_payload);
        let chunk = Self {
            path: path.to_path_buf(),
            block_size,
            max_entries_per_chunk,
            gzip_level,
            index,
            entries,
            dirty: true,
        };
        chunk.flush_to_disk()?;
        Ok(Self { dirty: false, ..chunk })
    }

    pub fn open(path: &Path, max_entries_per_chunk: u64, gzip_level: u32) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::DoesNotExist(path.display().to_string())
            } else {
                Error::Io(e)
            }
        })?;
        let mut decoder = GzDecoder::new(file);
        let mut buf = Vec::new();
        decoder
            .read_to_end(&mut buf)
            .map_err(|_| Error::Corruption(format!("{}: not a valid gzip stream", path.display())))?;
        if buf.len() < HEADER_LEN {
            return Err(Error::Corruption(format!(
                "{}: truncated chunk header",
                path.display()
            )));
        }
        let block_size = u32::from_le_bytes(buf[0..HEADER_LEN].try_into().unwrap());
        let entry_size = 8 + block_size as usize;
        let body = buf.split_off(HEADER_LEN);
        if entry_size == 0 || body.len() % entry_size != 0 {
            return Err(Error::Corruption(format!(
                "{}: body is not a whole number of entries",
                path.display()
            )));
        }
        let mut index = ChunkIndex::new();
        let mut prev_ts: Option<u64> = None;
        for record in body.chunks_exact(entry_size) {
            let ts = u64::from_le_bytes(record[0..8].try_into().unwrap());
            if let Some(p) = prev_ts {
                if ts < p {
                    return Err(Error::Corruption(format!(
                        "{}: non-monotonic timestamps",
                        path.display()
                    )));
                }
            }
            prev_ts = Some(ts);
            index.push(ts);
        }
        Ok(Self {
            path: path.to_path_buf(),
            block_size,
            max_entries_per_chunk,
            gzip_level,
            index,
            entries: body,
            dirty: false,
        })
    }

    fn flush_to_disk(&self) -> Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| Error::InvalidArgument("chunk path has no parent directory".into()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        {
            let level = Compression::new(self.gzip_level.clamp(1, 9));
            let mut encoder = GzEncoder::new(tmp.as_file_mut(), level);
            encoder.write_all(&self.block_size.to_le_bytes())?;
            encoder.write_all(&self.entries)?;
            encoder.finish()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| Error::Io(e.error))?;
        debug!(path = %self.path.display(), entries = self.index.len(), "rewrote gzip chunk");
        Ok(())
    }
}

impl ChunkFile for GzipChunk {
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
        let entry_size = self.entry_size();
        let off = i * entry_size;
        let ts = u64::from_le_bytes(self.entries[off..off + 8].try_into().unwrap());
        let payload = self.entries[off + 8..off + entry_size].to_vec();
        Ok((ts, payload))
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
        if self.index.len() as u64 >= self.max_entries_per_chunk {
            return Ok(AppendOutcome::Full);
        }
        self.entries.extend_from_slice(&ts.to_le_bytes());
        self.entries.extend_from_slice(payload);
        self.index.push(ts);
        self.dirty = true;
        Ok(AppendOutcome::Ok(()))
    }

    fn sync(&mut self) -> Result<()> {
        if self.dirty {
            self.flush_to_disk()?;
            self.dirty = false;
        }
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.sync()
    }

    fn physical_size(&self) -> u64 {
        (HEADER_LEN + self.entries.len()) as u64
    }

    fn is_mmap(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_through_rewrite_on_close() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0");
        let mut chunk = GzipChunk::create(&path, 0, b"ala ", 10, 6).unwrap();
        chunk.append(1, b"ma  ").unwrap();
        chunk.append(4, b"kota").unwrap();
        let boxed: Box<dyn ChunkFile> = Box::new(chunk);
        boxed.close().unwrap();

        let reopened = GzipChunk::open(&path, 10, 6).unwrap();
        assert_eq!(reopened.len(), 3);
        assert_eq!(reopened.min_ts(), 0);
        assert_eq!(reopened.max_ts(), 4);
        assert_eq!(reopened.get(1).unwrap(), (1, b"ma  ".to_vec()));
    }
}
