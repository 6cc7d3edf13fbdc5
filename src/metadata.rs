//! Atomic JSON read/write for the three on-disk metadata documents, and the
//! document shapes themselves. Generalizes the teacher's CBOR
//! manifest/superblock read-write helpers to the JSON format this engine's
//! metadata files use.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const METADATA_FILE: &str = "metadata.txt";

fn default_page_size() -> u32 {
    4096
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesMetadata {
    pub block_size: u32,
    pub max_entries_per_chunk: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_entry_synced: Option<u64>,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default)]
    pub gzip_level: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VarlenMetadata {
    pub length_profile: Vec<u32>,
    pub max_entries_per_chunk: u64,
    pub temp_file_for_varlen: u64,
    #[serde(default)]
    pub gzip_level: u32,
}

/// The database-level `metadata.txt` is opaque to the engine: callers set
/// and read back whatever JSON object they like.
pub type DatabaseMetadata = serde_json::Map<String, serde_json::Value>;

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = std::fs::read(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::DoesNotExist(path.display().to_string())
        } else {
            Error::Io(e)
        }
    })?;
    serde_json::from_slice(&data)
        .map_err(|e| Error::Corruption(format!("{}: {e}", path.display())))
}

/// Write `value` to `path` atomically: serialize to a tempfile in the same
/// directory, fsync it, then rename over the target. Mirrors the teacher's
/// own tempfile-then-rename compaction step in `crud::sync_to_base`.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::InvalidArgument("metadata path has no parent directory".into()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(tmp.as_file_mut(), value)
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn corrupted_metadata_is_corruption_not_panic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(METADATA_FILE);
        std::fs::write(&path, b"{}").unwrap();
        let err = read_json::<SeriesMetadata>(&path).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }

    #[test]
    fn round_trips_series_metadata() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(METADATA_FILE);
        let meta = SeriesMetadata {
            block_size: 10,
            max_entries_per_chunk: 4096,
            last_entry_synced: Some(42),
            page_size: 4096,
            gzip_level: 0,
        };
        write_json_atomic(&path, &meta).unwrap();
        let loaded: SeriesMetadata = read_json(&path).unwrap();
        assert_eq!(loaded.block_size, 10);
        assert_eq!(loaded.last_entry_synced, Some(42));
    }
}
