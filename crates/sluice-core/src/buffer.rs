//! Buffer model
//!
//! Tracks which presentation time ranges are buffered, per content type:
//! - Sorted, non-overlapping `[start, end)` ranges
//! - Appends merge adjacent and overlapping ranges
//! - Removals split ranges and never leave zero-length entries
//! - "total" is the intersection of the audio and video partitions

use crate::types::ContentType;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Ranges closer than this are treated as contiguous (seconds)
const CONTIGUITY_TOLERANCE: f64 = 1e-3;

/// A single buffered interval
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BufferedRange {
    pub start: f64,
    pub end: f64,
}

impl BufferedRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    pub fn contains(&self, time: f64) -> bool {
        time >= self.start && time < self.end
    }
}

/// Sorted set of non-overlapping buffered ranges
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BufferedRanges {
    ranges: Vec<BufferedRange>,
}

impl BufferedRanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ranges(&self) -> &[BufferedRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Add `[start, end)`, merging with every range it touches
    pub fn append(&mut self, start: f64, end: f64) {
        if end - start <= 0.0 {
            return;
        }
        let mut merged = BufferedRange::new(start, end);
        let mut result = Vec::with_capacity(self.ranges.len() + 1);
        let mut inserted = false;

        for range in self.ranges.drain(..) {
            if range.end + CONTIGUITY_TOLERANCE < merged.start {
                result.push(range);
            } else if merged.end + CONTIGUITY_TOLERANCE < range.start {
                if !inserted {
                    result.push(merged);
                    inserted = true;
                }
                result.push(range);
            } else {
                merged.start = merged.start.min(range.start);
                merged.end = merged.end.max(range.end);
            }
        }
        if !inserted {
            result.push(merged);
        }
        self.ranges = result;
    }

    /// Remove `[start, end)`, splitting ranges that straddle it
    pub fn remove(&mut self, start: f64, end: f64) {
        if end - start <= 0.0 {
            return;
        }
        let mut result = Vec::with_capacity(self.ranges.len() + 1);
        for range in self.ranges.drain(..) {
            if range.end <= start || range.start >= end {
                result.push(range);
                continue;
            }
            if range.start < start {
                result.push(BufferedRange::new(range.start, start));
            }
            if range.end > end {
                result.push(BufferedRange::new(end, range.end));
            }
        }
        result.retain(|r| r.duration() > CONTIGUITY_TOLERANCE);
        self.ranges = result;
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// First buffered time, if any
    pub fn start(&self) -> Option<f64> {
        self.ranges.first().map(|r| r.start)
    }

    /// Last buffered time, if any
    pub fn end(&self) -> Option<f64> {
        self.ranges.last().map(|r| r.end)
    }

    /// Seconds buffered strictly ahead of `time`.
    ///
    /// With `include_gaps` the gaps between ranges ahead of `time` count as
    /// buffered; a gap between `time` and the first range never does.
    pub fn buffered_ahead_of(&self, time: f64, include_gaps: bool) -> f64 {
        if include_gaps {
            match (self.start(), self.end()) {
                (Some(start), Some(end)) => (end - time.max(start)).max(0.0),
                _ => 0.0,
            }
        } else {
            self.ranges
                .iter()
                .filter(|r| r.end > time)
                .map(|r| r.end - r.start.max(time))
                .sum()
        }
    }

    /// True if `time` is buffered, sits in a gap between ranges (with
    /// `include_gaps`), or lies within `small_gap_limit` of the next range.
    pub fn is_buffered(&self, time: f64, include_gaps: bool, small_gap_limit: f64) -> bool {
        if self.ranges.iter().any(|r| r.contains(time)) {
            return true;
        }
        if include_gaps {
            if let (Some(start), Some(end)) = (self.start(), self.end()) {
                if time >= start && time < end {
                    return true;
                }
            }
        }
        match self.next_range_after(time) {
            Some(next) => next.start - time <= small_gap_limit,
            None => false,
        }
    }

    /// Range containing `time`
    pub fn range_containing(&self, time: f64) -> Option<BufferedRange> {
        self.ranges.iter().copied().find(|r| r.contains(time))
    }

    /// First range starting after `time`
    pub fn next_range_after(&self, time: f64) -> Option<BufferedRange> {
        self.ranges.iter().copied().find(|r| r.start > time)
    }

    /// Intersection of two range sets
    pub fn intersect(&self, other: &BufferedRanges) -> BufferedRanges {
        let mut result = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.ranges.len() && j < other.ranges.len() {
            let a = self.ranges[i];
            let b = other.ranges[j];
            let start = a.start.max(b.start);
            let end = a.end.min(b.end);
            if end - start > CONTIGUITY_TOLERANCE {
                result.push(BufferedRange::new(start, end));
            }
            if a.end < b.end {
                i += 1;
            } else {
                j += 1;
            }
        }
        BufferedRanges { ranges: result }
    }

    /// Total buffered seconds
    pub fn total(&self) -> f64 {
        self.ranges.iter().map(|r| r.duration()).sum()
    }
}

/// Which partition a buffer query targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferPartition {
    Type(ContentType),
    Total,
}

impl From<ContentType> for BufferPartition {
    fn from(content_type: ContentType) -> Self {
        BufferPartition::Type(content_type)
    }
}

/// Buffer model shared between the streaming loops and the player.
///
/// Each content type appends only to its own partition.
#[derive(Debug, Default)]
pub struct BufferModel {
    partitions: RwLock<BTreeMap<ContentType, BufferedRanges>>,
}

impl BufferModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, content_type: ContentType, start: f64, end: f64) {
        let mut partitions = self.partitions.write();
        let ranges = partitions.entry(content_type).or_default();
        ranges.append(start, end);
        debug!(
            content_type = %content_type,
            start,
            end,
            ranges = ranges.ranges().len(),
            "Range appended"
        );
    }

    pub fn remove(&self, content_type: ContentType, start: f64, end: f64) {
        if let Some(ranges) = self.partitions.write().get_mut(&content_type) {
            ranges.remove(start, end);
        }
    }

    pub fn clear(&self, content_type: ContentType) {
        self.partitions.write().remove(&content_type);
    }

    pub fn clear_all(&self) {
        self.partitions.write().clear();
        debug!("Buffer model cleared");
    }

    /// Snapshot of one partition
    pub fn ranges(&self, partition: impl Into<BufferPartition>) -> BufferedRanges {
        let partitions = self.partitions.read();
        match partition.into() {
            BufferPartition::Type(content_type) => {
                partitions.get(&content_type).cloned().unwrap_or_default()
            }
            BufferPartition::Total => Self::total_of(&partitions),
        }
    }

    fn total_of(partitions: &BTreeMap<ContentType, BufferedRanges>) -> BufferedRanges {
        let mut media = [ContentType::Video, ContentType::Audio]
            .iter()
            .filter_map(|ct| partitions.get(ct))
            .filter(|r| !r.is_empty());
        match (media.next(), media.next()) {
            (Some(a), Some(b)) => a.intersect(b),
            (Some(a), None) => a.clone(),
            _ => BufferedRanges::new(),
        }
    }

    pub fn buffer_start(&self, partition: impl Into<BufferPartition>) -> Option<f64> {
        self.ranges(partition).start()
    }

    pub fn buffer_end(&self, partition: impl Into<BufferPartition>) -> Option<f64> {
        self.ranges(partition).end()
    }

    pub fn buffered_ahead_of(&self, partition: impl Into<BufferPartition>, time: f64, include_gaps: bool) -> f64 {
        self.ranges(partition).buffered_ahead_of(time, include_gaps)
    }

    pub fn is_buffered(
        &self,
        partition: impl Into<BufferPartition>,
        time: f64,
        include_gaps: bool,
        small_gap_limit: f64,
    ) -> bool {
        self.ranges(partition).is_buffered(time, include_gaps, small_gap_limit)
    }

    /// All partitions holding data, for stats
    pub fn snapshot(&self) -> BTreeMap<ContentType, Vec<BufferedRange>> {
        self.partitions
            .read()
            .iter()
            .map(|(ct, ranges)| (*ct, ranges.ranges().to_vec()))
            .collect()
    }
}
