//! Sluice Core - adaptive streaming client core
//!
//! This crate provides the playback-control side of an adaptive streaming
//! client:
//! - Network attempt engine with backoff, URI rotation and CDN fallback
//! - Buffered range model per content type
//! - Throughput-based ABR with switch hysteresis
//! - DRM license sessions (caching, renewals, key status tracking)
//! - Segment pull loops, gap jumping, stall recovery and live-edge chasing
//! - Player state machine with QoE statistics
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Sluice Core                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │   Manifest   │  │    Buffer    │  │     ABR      │           │
//! │  │   Provider   │  │    Model     │  │  Controller  │           │
//! │  └──────┬───────┘  └──────┬───────┘  └──────┬───────┘           │
//! │         │                 │                 │                   │
//! │         └─────────────────┼─────────────────┘                   │
//! │                           │                                     │
//! │                    ┌──────┴──────┐                              │
//! │                    │  Streaming  │                              │
//! │                    │   Engine    │                              │
//! │                    └──────┬──────┘                              │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────┴──────┐  ┌──────────────┐            │
//! │  │   Network    │  │   Player    │  │     DRM      │            │
//! │  │   Engine     │  │   + State   │  │   Sessions   │            │
//! │  └──────────────┘  └─────────────┘  └──────────────┘            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod types;
pub mod track;
pub mod config;
pub mod net;
pub mod buffer;
pub mod abr;
pub mod drm;
pub mod events;
pub mod streaming;
pub mod state;
pub mod stats;
pub mod player;

pub use error::{Category, Error, Result, Severity};
pub use types::*;
pub use track::{filters, Rendition, Track};
pub use config::{
    AbrConfiguration, AbrRestrictions, AdvancedDrmConfiguration, AttemptParameters, DrmConfiguration,
    PlayerConfiguration, StreamingConfiguration,
};
pub use net::{DownloadTrace, HttpTransport, NetworkingEngine, Request, RequestType, Response, Transport};
pub use buffer::{BufferModel, BufferPartition, BufferedRange, BufferedRanges};
pub use abr::{AbrAlgorithm, AbrController, AbrDecision};
pub use drm::{Cdm, ClearKeyCdm, DrmHooks, DrmSessionInfo, DrmSessionManager, DrmSessionState, KeyStatus};
pub use events::{EventBus, EventControl, ListenerId, PlayerEvent};
pub use streaming::{ManifestProvider, MediaSink, NullSink, SegmentListManifest, StreamingEngine};
pub use state::PlayerStateMachine;
pub use stats::{PlayerStats, QoeBreakdown, QoeCalculator};
pub use player::{Player, PlayerContext, PlayheadClock};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Log the library version; the host installs the subscriber
pub fn init() {
    tracing::info!(version = VERSION, "Sluice Core initialized");
}
