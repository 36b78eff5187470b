//! Streaming - segment pull loops and playhead maintenance
//!
//! Provides:
//! - [`ManifestProvider`] / [`MediaSink`] seams to the manifest and decoder
//! - [`StreamingEngine`] running one fetch loop per content type
//! - Gap jumping, stall recovery and live-edge chasing helpers

mod engine;
pub mod gap;
pub mod live;
mod manifest;
mod playhead;
mod sink;

pub use engine::{StreamingContext, StreamingEngine};
pub use gap::{find_gap, Gap, GapJumper, StallDetector};
pub use live::{chase_action, ChaseAction, LiveEdgeChaser};
pub use manifest::{
    DrmDocument, ManifestProvider, RenditionDocument, SegmentListDocument, SegmentListManifest, TrackDocument,
};
pub use playhead::Playhead;
pub use sink::{MediaSink, NullSink, SinkCounters};
