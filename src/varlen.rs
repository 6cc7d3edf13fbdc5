//! Cascading variable-length series: a payload too long for one fixed-width
//! slot spills into successively-opened "tier" sub-series, each a plain
//! [`Series`] in its own numbered subdirectory. Tier directories are created
//! lazily, the first time an append actually needs them — mirrors the
//! teacher's lazy shard-directory creation in `repo_fs.rs`.

use std::collections::HashMap;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::metadata::{self, VarlenMetadata, METADATA_FILE};
use crate::range::RangeIterator;
use crate::series::Series;

const RECORD_HEADER_LEN: usize = 3;

/// An owned byte buffer for one reassembled varlen value, with a total
/// lexicographic ordering so callers can sort or dedupe results.
#[derive(Debug, Clone, Default, Eq)]
pub struct VarlenEntry(Vec<u8>);

impl VarlenEntry {
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.clone()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get_byte_at(&self, index: usize) -> Option<u8> {
        self.0.get(index).copied()
    }

    pub fn slice(&self, from: usize, to: usize) -> &[u8] {
        &self.0[from..to]
    }

    pub fn startswith(&self, prefix: &[u8]) -> bool {
        self.0.starts_with(prefix)
    }

    pub fn endswith(&self, suffix: &[u8]) -> bool {
        self.0.ends_with(suffix)
    }
}

impl PartialEq for VarlenEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl PartialOrd for VarlenEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VarlenEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl Hash for VarlenEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state)
    }
}

pub struct VarlenSeries {
    dir: PathBuf,
    meta: VarlenMetadata,
    tiers: Mutex<HashMap<usize, Arc<Series>>>,
}

impl VarlenSeries {
    pub fn create(
        dir: &Path,
        length_profile: Vec<u32>,
        max_entries_per_chunk: u64,
        page_size: u64,
        gzip_level: u32,
    ) -> Result<Self> {
        if dir.exists() {
            return Err(Error::AlreadyExists(dir.display().to_string()));
        }
        if length_profile.is_empty() {
            return Err(Error::InvalidArgument(
                "length_profile must name at least one tier".into(),
            ));
        }
        fs::create_dir_all(dir)?;
        let meta = VarlenMetadata {
            length_profile,
            max_entries_per_chunk,
            temp_file_for_varlen: page_size,
            gzip_level,
        };
        metadata::write_json_atomic(&dir.join(METADATA_FILE), &meta)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            meta,
            tiers: Mutex::new(HashMap::new()),
        })
    }

    pub fn open(dir: &Path) -> Result<Self> {
        if !dir.exists() {
            return Err(Error::DoesNotExist(dir.display().to_string()));
        }
        let meta: VarlenMetadata = metadata::read_json(&dir.join(METADATA_FILE))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            meta,
            tiers: Mutex::new(HashMap::new()),
        })
    }

    fn tier_block_size(&self, idx: usize) -> Option<u32> {
        self.meta.length_profile.get(idx).map(|&l| RECORD_HEADER_LEN as u32 + l)
    }

    fn get_or_create_tier(&self, idx: usize) -> Result<Arc<Series>> {
        let mut tiers = self.tiers.lock().unwrap();
        if let Some(series) = tiers.get(&idx) {
            return Ok(Arc::clone(series));
        }
        let block_size = self.tier_block_size(idx).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "payload exceeds the configured {}-tier cascade",
                self.meta.length_profile.len()
            ))
        })?;
        let path = self.dir.join(idx.to_string());
        let series = if path.exists() {
            Series::open(&path)?
        } else {
            Series::create(
                &path,
                block_size,
                self.meta.max_entries_per_chunk,
                Some(self.meta.temp_file_for_varlen as u32),
                self.meta.gzip_level,
            )?
        };
        let series = Arc::new(series);
        tiers.insert(idx, Arc::clone(&series));
        Ok(series)
    }

    fn existing_tier(&self, idx: usize) -> Option<Arc<Series>> {
        let mut tiers = self.tiers.lock().unwrap();
        if let Some(series) = tiers.get(&idx) {
            return Some(Arc::clone(series));
        }
        let path = self.dir.join(idx.to_string());
        if !path.exists() {
            return None;
        }
        let series = Arc::new(Series::open(&path).ok()?);
        tiers.insert(idx, Arc::clone(&series));
        Some(series)
    }

    /// Splits `payload` greedily across the cascade. Once tier `N-1` (the
    /// last configured tier) is reached, it is treated as a repeating tail:
    /// further pieces keep writing into that same sub-series, each a
    /// separate record sharing `ts`, until the payload is exhausted — per
    /// the "pieces in the tail sub-series repeat ... until exhausted" rule.
    pub fn append(&self, ts: u64, payload: &[u8]) -> Result<()> {
        let last_idx = self.meta.length_profile.len() - 1;
        let mut remaining = payload;
        let mut tier_idx = 0usize;
        loop {
            let storage_idx = tier_idx.min(last_idx);
            let profile_len = self.meta.length_profile[storage_idx] as usize;
            let take = remaining.len().min(profile_len);
            let piece = &remaining[..take];
            remaining = &remaining[take..];
            let continuation = !remaining.is_empty();

            let tier = self.get_or_create_tier(storage_idx)?;
            let mut record = Vec::with_capacity(RECORD_HEADER_LEN + profile_len);
            record.push(continuation as u8);
            record.extend_from_slice(&(take as u16).to_le_bytes());
            record.extend_from_slice(piece);
            record.resize(RECORD_HEADER_LEN + profile_len, 0);
            tier.append(ts, &record)?;

            if !continuation {
                break;
            }
            tier_idx += 1;
        }
        Ok(())
    }

    pub fn last_entry_ts(&self) -> Option<u64> {
        self.existing_tier(0)?.last_entry_ts()
    }

    pub fn iterate_range(self: &Arc<Self>, ts_from: u64, ts_to: u64) -> Result<VarlenRangeIterator> {
        if ts_from > ts_to {
            return Err(Error::InvalidArgument(format!(
                "ts_from {ts_from} > ts_to {ts_to}"
            )));
        }
        let Some(tier0) = self.existing_tier(0) else {
            return Ok(VarlenRangeIterator::empty());
        };
        let tier0_iter = tier0.iterate_range(0, ts_to)?;
        Ok(VarlenRangeIterator {
            varlen: Arc::clone(self),
            ts_from,
            tier0_iter: Some(tier0_iter),
            sub_iters: HashMap::new(),
            closed: false,
        })
    }

    pub fn sync(&self) -> Result<()> {
        let meta_path = self.dir.join(METADATA_FILE);
        metadata::write_json_atomic(&meta_path, &self.meta)?;
        for series in self.tiers.lock().unwrap().values() {
            series.sync()?;
        }
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.sync()?;
        for series in self.tiers.lock().unwrap().values() {
            series.close()?;
        }
        Ok(())
    }

    pub fn delete(self) -> Result<()> {
        fs::remove_dir_all(&self.dir)?;
        Ok(())
    }
}

/// Decodes one cascade record: `[continuation:1][used_len:u16 LE][data]`.
/// This three-byte header is not specified by the distilled spec or its
/// original test fixtures; it was added here so a partial final piece's
/// true length survives the fixed-width tier slot.
fn decode_piece(record: &[u8]) -> Result<(bool, &[u8])> {
    if record.len() < RECORD_HEADER_LEN {
        return Err(Error::Corruption("cascade record shorter than its header".into()));
    }
    let continuation = record[0] != 0;
    let used = u16::from_le_bytes([record[1], record[2]]) as usize;
    let data = record
        .get(RECORD_HEADER_LEN..RECORD_HEADER_LEN + used)
        .ok_or_else(|| Error::Corruption("cascade record used_len exceeds its slot".into()))?;
    Ok((continuation, data))
}

pub struct VarlenRangeIterator {
    varlen: Option<Arc<VarlenSeries>>,
    ts_from: u64,
    tier0_iter: Option<RangeIterator>,
    sub_iters: HashMap<usize, RangeIterator>,
    closed: bool,
}

impl VarlenRangeIterator {
    fn empty() -> Self {
        Self {
            varlen: None,
            ts_from: 0,
            tier0_iter: None,
            sub_iters: HashMap::new(),
            closed: true,
        }
    }

    fn next_from_tier(&mut self, tier_idx: usize) -> Option<Result<(u64, Vec<u8>)>> {
        if !self.sub_iters.contains_key(&tier_idx) {
            let varlen = self.varlen.as_ref()?;
            let tier = match varlen.get_or_create_tier(tier_idx) {
                Ok(t) => t,
                Err(e) => return Some(Err(e)),
            };
            let iter = match tier.iterate_range(0, u64::MAX) {
                Ok(it) => it,
                Err(e) => return Some(Err(e)),
            };
            self.sub_iters.insert(tier_idx, iter);
        }
        self.sub_iters.get_mut(&tier_idx).unwrap().next()
    }
}

impl Iterator for VarlenRangeIterator {
    type Item = Result<(u64, VarlenEntry)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.closed {
                return None;
            }
            let (ts, record0) = match self.tier0_iter.as_mut()?.next() {
                Some(Ok(v)) => v,
                Some(Err(e)) => {
                    self.closed = true;
                    return Some(Err(e));
                }
                None => {
                    self.closed = true;
                    return None;
                }
            };

            let mut bytes = Vec::new();
            let (mut continuation, data) = match decode_piece(&record0) {
                Ok(v) => v,
                Err(e) => {
                    self.closed = true;
                    return Some(Err(e));
                }
            };
            bytes.extend_from_slice(data);

            let last_idx = match &self.varlen {
                Some(v) => v.meta.length_profile.len() - 1,
                None => 0,
            };
            let mut tier_idx = 1usize;
            while continuation {
                let storage_idx = tier_idx.min(last_idx);
                let (ts2, record) = match self.next_from_tier(storage_idx) {
                    Some(Ok(v)) => v,
                    Some(Err(e)) => {
                        self.closed = true;
                        return Some(Err(e));
                    }
                    None => {
                        self.closed = true;
                        return Some(Err(Error::Corruption(
                            "cascade tier ran out of records mid-entry".into(),
                        )));
                    }
                };
                let _ = ts2;
                let (cont, data) = match decode_piece(&record) {
                    Ok(v) => v,
                    Err(e) => {
                        self.closed = true;
                        return Some(Err(e));
                    }
                };
                bytes.extend_from_slice(data);
                continuation = cont;
                tier_idx += 1;
            }

            if ts < self.ts_from {
                continue;
            }
            return Some(Ok((ts, VarlenEntry(bytes))));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varlen_entry_ordering_is_lexicographic() {
        let a = VarlenEntry(b"abc".to_vec());
        let b = VarlenEntry(b"abd".to_vec());
        assert!(a < b);
        assert!(a.startswith(b"ab"));
        assert!(b.endswith(b"bd"));
    }

    #[test]
    fn decode_piece_rejects_truncated_header() {
        let err = decode_piece(&[1, 0]).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }
}
