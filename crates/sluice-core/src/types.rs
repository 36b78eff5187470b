//! Core types for Sluice

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

/// Upper bound for every timer derived from configuration (about 136 years)
pub const MAX_DELAY: Duration = Duration::from_secs(u32::MAX as u64);

/// Seconds to a [`Duration`], saturating at [`MAX_DELAY`]; NaN and negative values give zero
pub fn saturating_secs(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).map_or(MAX_DELAY, |d| d.min(MAX_DELAY))
}

/// Unique identifier for a playback session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of media a track or buffer partition holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Video,
    Audio,
    Text,
    Metadata,
}

impl ContentType {
    /// Content types that get their own streaming loop
    pub const STREAMED: [ContentType; 3] = [ContentType::Video, ContentType::Audio, ContentType::Text];
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentType::Video => write!(f, "video"),
            ContentType::Audio => write!(f, "audio"),
            ContentType::Text => write!(f, "text"),
            ContentType::Metadata => write!(f, "metadata"),
        }
    }
}

/// Video resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Total pixel count
    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Returns quality tier name
    pub fn quality_name(&self) -> &'static str {
        match self.height {
            0..=240 => "240p",
            241..=360 => "360p",
            361..=480 => "480p",
            481..=720 => "720p",
            721..=1080 => "1080p",
            1081..=1440 => "1440p",
            _ => "4K",
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// DRM key systems
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeySystem {
    Widevine,
    FairPlay,
    PlayReady,
    ClearKey,
}

impl KeySystem {
    /// Returns the system ID (UUID) used in PSSH boxes
    pub fn system_id(&self) -> &'static str {
        match self {
            KeySystem::Widevine => "edef8ba9-79d6-4ace-a3c8-27dcd51d21ed",
            KeySystem::FairPlay => "94ce86fb-07ff-4f43-adb8-93d2fa968ca2",
            KeySystem::PlayReady => "9a04f079-9840-4286-ab92-e65be0885f95",
            KeySystem::ClearKey => "1077efec-c0b2-4d02-ace3-3c1e52e2fb4b",
        }
    }

    /// Returns the reverse-DNS key system name
    pub fn name(&self) -> &'static str {
        match self {
            KeySystem::Widevine => "com.widevine.alpha",
            KeySystem::FairPlay => "com.apple.fps",
            KeySystem::PlayReady => "com.microsoft.playready",
            KeySystem::ClearKey => "org.w3.clearkey",
        }
    }

    /// Parse a reverse-DNS key system name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "com.widevine.alpha" => Some(KeySystem::Widevine),
            "com.apple.fps" | "com.apple.fps.1_0" => Some(KeySystem::FairPlay),
            "com.microsoft.playready" | "com.microsoft.playready.recommendation" => {
                Some(KeySystem::PlayReady)
            }
            "org.w3.clearkey" => Some(KeySystem::ClearKey),
            _ => None,
        }
    }
}

impl std::fmt::Display for KeySystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Initialization data carried by an `encrypted` event or the manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitData {
    /// "cenc", "keyids", "webm", "sinf", "skd"
    pub init_data_type: String,
    pub data: Bytes,
}

impl InitData {
    pub fn new(init_data_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            init_data_type: init_data_type.into(),
            data: data.into(),
        }
    }

    /// FairPlay SKD init data
    pub fn is_skd(&self) -> bool {
        self.init_data_type == "skd" || self.init_data_type == "sinf"
    }
}

/// DRM description of a rendition
#[derive(Debug, Clone)]
pub struct DrmInfo {
    pub key_system: KeySystem,
    /// License server; falls back to the configured server for the key system
    pub license_server_uri: Option<Url>,
    /// Hex-encoded key ids
    pub key_ids: BTreeSet<String>,
    /// Init data from the manifest, used when the platform fires no `encrypted` event
    pub init_data: Vec<InitData>,
}

impl DrmInfo {
    pub fn new(key_system: KeySystem) -> Self {
        Self {
            key_system,
            license_server_uri: None,
            key_ids: BTreeSet::new(),
            init_data: Vec::new(),
        }
    }

    pub fn with_key_id(mut self, key_id: impl Into<String>) -> Self {
        self.key_ids.insert(key_id.into().to_lowercase());
        self
    }

    pub fn with_init_data(mut self, init_data: InitData) -> Self {
        self.init_data.push(init_data);
        self
    }

    pub fn with_license_server(mut self, uri: Url) -> Self {
        self.license_server_uri = Some(uri);
        self
    }
}

/// Byte range for partial segment requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub length: u64,
}

impl ByteRange {
    pub fn end(&self) -> u64 {
        self.start + self.length - 1
    }

    /// Value for an HTTP `Range` header
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end())
    }
}

/// Initialization segment shared by the media segments of a rendition
#[derive(Debug, Clone)]
pub struct InitSegmentReference {
    pub uris: Vec<Url>,
    pub byte_range: Option<ByteRange>,
}

/// A media segment supplied by the manifest collaborator
#[derive(Debug, Clone)]
pub struct SegmentReference {
    /// Presentation start (seconds)
    pub start: f64,
    /// Presentation end (seconds)
    pub end: f64,
    /// Candidate URIs, tried in order by the attempt engine
    pub uris: Vec<Url>,
    pub byte_range: Option<ByteRange>,
    /// Declared bandwidth of the owning rendition (bps)
    pub bandwidth: u64,
    pub resolution: Option<Resolution>,
    /// Id of the rendition this segment belongs to
    pub rendition_id: u32,
    pub init_segment: Option<Arc<InitSegmentReference>>,
    /// Offset applied by the sink when appending (seconds)
    pub timestamp_offset: f64,
}

impl SegmentReference {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    /// True if `time` falls within [start, end)
    pub fn contains(&self, time: f64) -> bool {
        time >= self.start && time < self.end
    }
}

/// Entry of the append-only switch history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenditionChoice {
    /// Seconds since the session started
    pub timestamp: f64,
    pub rendition_id: u32,
    pub track_id: u32,
    pub from_adaptation: bool,
    pub bandwidth: u64,
}

/// Player state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerState {
    /// Initial sentinel, never re-entered
    Unset,
    /// No content loaded
    Idle,
    /// Content loading, waiting for the first buffer fill
    Preparing,
    /// Buffer underrun
    Buffering,
    /// Content is playing
    Playing,
    /// Playback paused
    Paused,
    /// Playhead reached the end of content
    Ended,
    /// Unrecoverable error, terminal until the next load
    Error,
}

impl PlayerState {
    /// Check if transition to target state is valid
    pub fn can_transition_to(&self, target: PlayerState) -> bool {
        use PlayerState::*;
        if target == Unset || *self == target {
            return false;
        }
        matches!(
            (self, target),
            // Startup
            (Unset, Idle) |
            // Load and release are accepted from anywhere
            (_, Idle) | (_, Preparing) |
            // Errors are accepted from anywhere
            (_, Error) |
            // Pause is accepted from any running state
            (Preparing, Paused) | (Buffering, Paused) | (Playing, Paused) | (Ended, Paused) |
            // Buffer driven
            (Preparing, Playing) | (Preparing, Buffering) |
            (Playing, Buffering) | (Buffering, Playing) |
            // Resume
            (Paused, Playing) | (Paused, Buffering) | (Paused, Preparing) | (Paused, Ended) |
            // End of content
            (Playing, Ended) | (Buffering, Ended) |
            // Seek back after the end
            (Ended, Playing) | (Ended, Buffering)
        )
    }

    /// States in which the playhead is expected to advance or wait for data
    pub fn is_running(&self) -> bool {
        matches!(self, PlayerState::Preparing | PlayerState::Buffering | PlayerState::Playing)
    }
}

impl std::fmt::Display for PlayerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlayerState::Unset => write!(f, "unset"),
            PlayerState::Idle => write!(f, "idle"),
            PlayerState::Preparing => write!(f, "preparing"),
            PlayerState::Buffering => write!(f, "buffering"),
            PlayerState::Playing => write!(f, "playing"),
            PlayerState::Paused => write!(f, "paused"),
            PlayerState::Ended => write!(f, "ended"),
            PlayerState::Error => write!(f, "error"),
        }
    }
}

/// Entry of the state history log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateHistoryEntry {
    pub state: PlayerState,
    /// Wall-clock time the state was entered
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Seconds spent in the previous state
    pub previous_duration: f64,
}
