//! Top-level handle grouping a directory's series and varlen series under
//! one opaque JSON metadata document. Grounded on the teacher's top-level
//! `repo_fs.rs`, which owns a directory of named archives behind a
//! `Mutex<HashMap<...>>` cache of open handles.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::metadata::{self, DatabaseMetadata, METADATA_FILE};
use crate::series::Series;
use crate::varlen::VarlenSeries;

const SERIES_DIR: &str = "series";
const VARLEN_DIR: &str = "varlen";

pub struct Database {
    dir: PathBuf,
    metadata: Mutex<DatabaseMetadata>,
    series: Mutex<HashMap<String, Arc<Series>>>,
    varlen: Mutex<HashMap<String, Arc<VarlenSeries>>>,
}

impl Database {
    pub fn create(dir: &Path) -> Result<Self> {
        if dir.exists() {
            return Err(Error::AlreadyExists(dir.display().to_string()));
        }
        fs::create_dir_all(dir.join(SERIES_DIR))?;
        fs::create_dir_all(dir.join(VARLEN_DIR))?;
        let meta = DatabaseMetadata::new();
        metadata::write_json_atomic(&dir.join(METADATA_FILE), &meta)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            metadata: Mutex::new(meta),
            series: Mutex::new(HashMap::new()),
            varlen: Mutex::new(HashMap::new()),
        })
    }

    pub fn open(dir: &Path) -> Result<Self> {
        if !dir.exists() {
            return Err(Error::DoesNotExist(dir.display().to_string()));
        }
        let meta: DatabaseMetadata = metadata::read_json(&dir.join(METADATA_FILE))?;
        fs::create_dir_all(dir.join(SERIES_DIR))?;
        fs::create_dir_all(dir.join(VARLEN_DIR))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            metadata: Mutex::new(meta),
            series: Mutex::new(HashMap::new()),
            varlen: Mutex::new(HashMap::new()),
        })
    }

    fn series_path(&self, name: &str) -> PathBuf {
        self.dir.join(SERIES_DIR).join(name)
    }

    fn varlen_path(&self, name: &str) -> PathBuf {
        self.dir.join(VARLEN_DIR).join(name)
    }

    pub fn create_series(
        &self,
        name: &str,
        block_size: u32,
        max_entries_per_chunk: u64,
        page_size: Option<u32>,
        gzip_level: u32,
    ) -> Result<Arc<Series>> {
        let mut open = self.series.lock().unwrap();
        if open.contains_key(name) {
            return Err(Error::AlreadyExists(name.to_string()));
        }
        let series = Arc::new(Series::create(
            &self.series_path(name),
            block_size,
            max_entries_per_chunk,
            page_size,
            gzip_level,
        )?);
        open.insert(name.to_string(), Arc::clone(&series));
        Ok(series)
    }

    pub fn get_series(&self, name: &str) -> Result<Arc<Series>> {
        let mut open = self.series.lock().unwrap();
        if let Some(series) = open.get(name) {
            return Ok(Arc::clone(series));
        }
        let path = self.series_path(name);
        if !path.exists() {
            return Err(Error::DoesNotExist(name.to_string()));
        }
        let series = Arc::new(Series::open(&path)?);
        open.insert(name.to_string(), Arc::clone(&series));
        Ok(series)
    }

    pub fn delete_series(&self, name: &str) -> Result<()> {
        let mut open = self.series.lock().unwrap();
        let series = match open.remove(name) {
            Some(series) => series,
            None => {
                let path = self.series_path(name);
                if !path.exists() {
                    return Err(Error::DoesNotExist(name.to_string()));
                }
                Arc::new(Series::open(&path)?)
            }
        };
        match Arc::try_unwrap(series) {
            Ok(series) => series.delete(),
            Err(series) => {
                series.close()?;
                fs::remove_dir_all(self.series_path(name))?;
                Ok(())
            }
        }
    }

    pub fn create_varlen_series(
        &self,
        name: &str,
        length_profile: Vec<u32>,
        max_entries_per_chunk: u64,
        page_size: u64,
        gzip_level: u32,
    ) -> Result<Arc<VarlenSeries>> {
        let mut open = self.varlen.lock().unwrap();
        if open.contains_key(name) {
            return Err(Error::AlreadyExists(name.to_string()));
        }
        let series = Arc::new(VarlenSeries::create(
            &self.varlen_path(name),
            length_profile,
            max_entries_per_chunk,
            page_size,
            gzip_level,
        )?);
        open.insert(name.to_string(), Arc::clone(&series));
        Ok(series)
    }

    pub fn get_varlen_series(&self, name: &str) -> Result<Arc<VarlenSeries>> {
        let mut open = self.varlen.lock().unwrap();
        if let Some(series) = open.get(name) {
            return Ok(Arc::clone(series));
        }
        let path = self.varlen_path(name);
        if !path.exists() {
            return Err(Error::DoesNotExist(name.to_string()));
        }
        let series = Arc::new(VarlenSeries::open(&path)?);
        open.insert(name.to_string(), Arc::clone(&series));
        Ok(series)
    }

    pub fn delete_varlen_series(&self, name: &str) -> Result<()> {
        let mut open = self.varlen.lock().unwrap();
        let series = match open.remove(name) {
            Some(series) => series,
            None => {
                let path = self.varlen_path(name);
                if !path.exists() {
                    return Err(Error::DoesNotExist(name.to_string()));
                }
                Arc::new(VarlenSeries::open(&path)?)
            }
        };
        match Arc::try_unwrap(series) {
            Ok(series) => series.delete(),
            Err(series) => {
                series.close()?;
                fs::remove_dir_all(self.varlen_path(name))?;
                Ok(())
            }
        }
    }

    pub fn metadata(&self) -> DatabaseMetadata {
        self.metadata.lock().unwrap().clone()
    }

    pub fn set_metadata(&self, meta: DatabaseMetadata) -> Result<()> {
        metadata::write_json_atomic(&self.dir.join(METADATA_FILE), &meta)?;
        *self.metadata.lock().unwrap() = meta;
        Ok(())
    }

    pub fn reload_metadata(&self) -> Result<()> {
        let meta: DatabaseMetadata = metadata::read_json(&self.dir.join(METADATA_FILE))?;
        *self.metadata.lock().unwrap() = meta;
        Ok(())
    }

    pub fn get_open_series(&self) -> Vec<String> {
        self.series.lock().unwrap().keys().cloned().collect()
    }

    pub fn get_open_varlen_series(&self) -> Vec<String> {
        self.varlen.lock().unwrap().keys().cloned().collect()
    }

    /// Syncs every currently-open series and varlen series to disk.
    pub fn checkpoint(&self) -> Result<()> {
        for series in self.series.lock().unwrap().values() {
            series.sync()?;
        }
        for series in self.varlen.lock().unwrap().values() {
            series.sync()?;
        }
        Ok(())
    }

    pub fn close_all_open_series(&self) -> Result<()> {
        for series in self.series.lock().unwrap().drain().map(|(_, v)| v) {
            series.close()?;
        }
        for series in self.varlen.lock().unwrap().drain().map(|(_, v)| v) {
            series.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_open_delete_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let db = Database::create(&path).unwrap();
        let series = db.create_series("temps", 8, 1024, None, 0).unwrap();
        series.append(0, &0u64.to_le_bytes()).unwrap();
        db.checkpoint().unwrap();
        db.close_all_open_series().unwrap();

        let db = Database::open(&path).unwrap();
        let series = db.get_series("temps").unwrap();
        assert_eq!(series.last_entry_ts(), Some(0));
        db.delete_series("temps").unwrap();
        assert!(db.get_series("temps").is_err());
    }

    #[test]
    fn opening_missing_database_is_does_not_exist() {
        let dir = tempdir().unwrap();
        let err = Database::open(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, Error::DoesNotExist(_)));
    }
}
