//! Forward iterator over a timestamp range spanning one or more chunks.
//!
//! Each chunk the range touches is pinned for the iterator's lifetime so a
//! concurrent `trim` cannot delete it out from under a reader (tombstone
//! instead, per `Series::release_pin`). Grounded on the teacher's
//! `read::stream` module, which holds a handle per still-open segment and
//! advances across segment boundaries the same way.

use std::sync::Arc;

use crate::error::Result;
use crate::series::Series;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Segment {
    pub first_ts: u64,
    pub lo: usize,
    pub hi: usize,
    pub is_last: bool,
}

/// Lazily yields `(timestamp, payload)` pairs in ascending order.
///
/// The final segment (the still-growing chunk) re-evaluates its upper bound
/// on every step via `Series::chunk_find_right`, so entries appended after
/// the iterator was created but before it reaches that chunk are included
/// up to `ts_to` — mirroring a plain linear scan over a live series.
pub struct RangeIterator {
    series: Option<Arc<Series>>,
    ts_to: u64,
    segments: Vec<Segment>,
    seg_idx: usize,
    cursor: usize,
    closed: bool,
}

impl RangeIterator {
    pub(crate) fn empty() -> Self {
        Self {
            series: None,
            ts_to: 0,
            segments: Vec::new(),
            seg_idx: 0,
            cursor: 0,
            closed: true,
        }
    }

    pub(crate) fn new(series: Arc<Series>, ts_to: u64, segments: Vec<Segment>) -> Self {
        let cursor = segments.first().map(|s| s.lo).unwrap_or(0);
        Self {
            series: Some(series),
            ts_to,
            segments,
            seg_idx: 0,
            cursor,
            closed: false,
        }
    }

    fn release_remaining_pins(&mut self) {
        if let Some(series) = &self.series {
            for seg in &self.segments[self.seg_idx..] {
                series.release_pin(seg.first_ts);
            }
        }
        self.seg_idx = self.segments.len();
    }

    /// Stop iterating and release all still-held pins early.
    pub fn close(mut self) {
        self.release_remaining_pins();
        self.closed = true;
    }
}

impl Iterator for RangeIterator {
    type Item = Result<(u64, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.closed {
            return None;
        }
        let series = self.series.clone()?;
        loop {
            if self.seg_idx >= self.segments.len() {
                self.closed = true;
                return None;
            }
            let seg = self.segments[self.seg_idx];
            let hi = if seg.is_last {
                match series.chunk_find_right(seg.first_ts, self.ts_to) {
                    Ok(hi) => hi,
                    Err(e) => {
                        self.closed = true;
                        return Some(Err(e));
                    }
                }
            } else {
                seg.hi
            };
            if self.cursor >= hi {
                series.release_pin(seg.first_ts);
                self.seg_idx += 1;
                self.cursor = self
                    .segments
                    .get(self.seg_idx)
                    .map(|s| s.lo)
                    .unwrap_or(0);
                continue;
            }
            let idx = self.cursor;
            self.cursor += 1;
            return Some(series.read_entry(seg.first_ts, idx));
        }
    }
}

impl Drop for RangeIterator {
    fn drop(&mut self) {
        self.release_remaining_pins();
    }
}
