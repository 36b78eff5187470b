//! Platform buffer sink seam

use crate::error::Result;
use crate::types::ContentType;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::trace;

/// Where segment bytes go once downloaded (a decoder's source buffers)
#[async_trait]
pub trait MediaSink: Send + Sync {
    /// Append one segment. `range` is `None` for initialization segments.
    async fn append(
        &self,
        content_type: ContentType,
        data: Bytes,
        timestamp_offset: f64,
        range: Option<(f64, f64)>,
    ) -> Result<()>;

    /// Evict [start, end) of a content type
    async fn remove(&self, content_type: ContentType, start: f64, end: f64) -> Result<()>;
}

/// Per content type counters kept by [`NullSink`]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SinkCounters {
    pub init_segments: u64,
    pub media_segments: u64,
    pub bytes: u64,
    pub removals: u64,
}

/// Sink that discards data and only counts it
#[derive(Debug, Default)]
pub struct NullSink {
    counters: Mutex<BTreeMap<ContentType, SinkCounters>>,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self, content_type: ContentType) -> SinkCounters {
        self.counters.lock().get(&content_type).copied().unwrap_or_default()
    }

    pub fn total_bytes(&self) -> u64 {
        self.counters.lock().values().map(|c| c.bytes).sum()
    }
}

#[async_trait]
impl MediaSink for NullSink {
    async fn append(
        &self,
        content_type: ContentType,
        data: Bytes,
        _timestamp_offset: f64,
        range: Option<(f64, f64)>,
    ) -> Result<()> {
        let mut counters = self.counters.lock();
        let entry = counters.entry(content_type).or_default();
        entry.bytes += data.len() as u64;
        match range {
            Some(_) => entry.media_segments += 1,
            None => entry.init_segments += 1,
        }
        trace!(content_type = %content_type, bytes = data.len(), ?range, "Discarded appended data");
        Ok(())
    }

    async fn remove(&self, content_type: ContentType, _start: f64, _end: f64) -> Result<()> {
        self.counters.lock().entry(content_type).or_default().removals += 1;
        Ok(())
    }
}
