//! Manifest collaborator seam
//!
//! The streaming engine never parses manifests. It asks a
//! [`ManifestProvider`] for tracks and for the ordered segment references of
//! a rendition. [`SegmentListManifest`] is an in-memory provider that can be
//! built programmatically or from a JSON segment-list document.

use crate::config::AttemptParameters;
use crate::error::{Error, Result};
use crate::net::{NetworkingEngine, Request, RequestType};
use crate::track::{Rendition, Track};
use crate::types::{ContentType, DrmInfo, InitSegmentReference, KeySystem, SegmentReference};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use url::Url;

/// Source of tracks and segment references
#[async_trait]
pub trait ManifestProvider: Send + Sync {
    fn tracks(&self) -> Vec<Track>;

    /// Ordered segment references of a rendition
    fn segments(&self, rendition: &Rendition) -> Vec<SegmentReference>;

    fn is_live(&self) -> bool;

    /// Presentation duration in seconds, `None` while live
    fn duration(&self) -> Option<f64>;

    /// Latest available position of a live presentation
    fn live_edge(&self) -> Option<f64> {
        None
    }

    /// Longest segment duration, used to derive the live refresh period
    fn max_segment_duration(&self) -> Option<f64> {
        None
    }

    /// Re-read the manifest; live providers append renditions and segments
    async fn refresh(&self, _net: &NetworkingEngine, _retry: &AttemptParameters) -> Result<()> {
        Ok(())
    }
}

/// JSON segment-list document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SegmentListDocument {
    pub live: bool,
    pub duration: Option<f64>,
    pub live_edge: Option<f64>,
    /// Where a live document is re-fetched from
    pub refresh_uri: Option<Url>,
    pub tracks: Vec<TrackDocument>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackDocument {
    pub id: u32,
    pub kind: ContentType,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub renditions: Vec<RenditionDocument>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenditionDocument {
    pub id: u32,
    pub bandwidth: u64,
    #[serde(default)]
    pub codec: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    #[serde(default)]
    pub drm: Vec<DrmDocument>,
    pub init: Option<Url>,
    /// Segment URI with a `$Number$` placeholder
    pub segment_template: String,
    pub segment_duration: f64,
    pub segment_count: u32,
    #[serde(default)]
    pub start_number: u64,
    /// Presentation time of the first segment
    #[serde(default)]
    pub start_time: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrmDocument {
    pub key_system: String,
    pub license_server: Option<Url>,
    #[serde(default)]
    pub key_ids: Vec<String>,
}

impl RenditionDocument {
    fn rendition(&self, track: &TrackDocument) -> Result<Rendition> {
        let mut rendition = Rendition::new(self.id, track.id, track.kind, self.bandwidth).with_codec(&self.codec);
        if let (Some(width), Some(height)) = (self.width, self.height) {
            rendition = rendition.with_resolution(width, height);
        }
        for drm in &self.drm {
            let key_system = KeySystem::from_name(&drm.key_system)
                .ok_or_else(|| Error::InvalidManifest(format!("unknown key system {}", drm.key_system)))?;
            let mut info = DrmInfo::new(key_system);
            if let Some(uri) = &drm.license_server {
                info = info.with_license_server(uri.clone());
            }
            for key_id in &drm.key_ids {
                info = info.with_key_id(key_id);
            }
            rendition = rendition.with_drm_info(info);
        }
        Ok(rendition)
    }

    fn segments(&self, rendition: &Rendition) -> Result<Vec<SegmentReference>> {
        if self.segment_duration <= 0.0 {
            return Err(Error::InvalidManifest(format!(
                "rendition {} has a non-positive segment duration",
                self.id
            )));
        }
        let init_segment = self.init.as_ref().map(|uri| {
            Arc::new(InitSegmentReference {
                uris: vec![uri.clone()],
                byte_range: None,
            })
        });

        (0..self.segment_count)
            .map(|index| {
                let number = self.start_number + u64::from(index);
                let uri = self.segment_template.replace("$Number$", &number.to_string());
                let uri = Url::parse(&uri).map_err(|e| Error::InvalidManifest(format!("{uri}: {e}")))?;
                let start = self.start_time + f64::from(index) * self.segment_duration;
                Ok(SegmentReference {
                    start,
                    end: start + self.segment_duration,
                    uris: vec![uri],
                    byte_range: None,
                    bandwidth: rendition.bandwidth,
                    resolution: rendition.resolution,
                    rendition_id: rendition.id,
                    init_segment: init_segment.clone(),
                    timestamp_offset: 0.0,
                })
            })
            .collect()
    }
}

#[derive(Default)]
struct ManifestState {
    tracks: Vec<Track>,
    segments: HashMap<u32, Vec<SegmentReference>>,
    live: bool,
    duration: Option<f64>,
    live_edge: Option<f64>,
    refresh_uri: Option<Url>,
}

/// In-memory manifest holding explicit segment lists
#[derive(Default)]
pub struct SegmentListManifest {
    state: RwLock<ManifestState>,
}

impl SegmentListManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let document: SegmentListDocument =
            serde_json::from_str(json).map_err(|e| Error::InvalidManifest(e.to_string()))?;
        Self::from_document(document)
    }

    pub fn from_document(document: SegmentListDocument) -> Result<Self> {
        let manifest = Self::new();
        manifest.apply(document)?;
        Ok(manifest)
    }

    pub fn with_live(self, live: bool) -> Self {
        self.state.write().live = live;
        self
    }

    pub fn with_duration(self, duration: f64) -> Self {
        self.state.write().duration = Some(duration);
        self
    }

    /// Add a track and the segments of each of its renditions (keyed by rendition id)
    pub fn with_track(self, track: Track, mut segments: HashMap<u32, Vec<SegmentReference>>) -> Self {
        {
            let mut state = self.state.write();
            for rendition in track.renditions() {
                let list = segments.remove(&rendition.id).unwrap_or_default();
                state.segments.insert(rendition.id, list);
            }
            state.tracks.push(track);
        }
        self
    }

    /// Append live segments to a rendition, skipping ones already known
    pub fn append_segments(&self, rendition_id: u32, segments: Vec<SegmentReference>) -> usize {
        let mut state = self.state.write();
        let list = state.segments.entry(rendition_id).or_default();
        let last_end = list.last().map(|s| s.end).unwrap_or(f64::NEG_INFINITY);
        let before = list.len();
        list.extend(segments.into_iter().filter(|s| s.start >= last_end - 1e-3));
        let added = list.len() - before;
        if state.live {
            let edge = state.segments.values().filter_map(|l| l.last()).map(|s| s.end).fold(f64::NAN, f64::max);
            if edge.is_finite() {
                state.live_edge = Some(edge);
            }
        }
        added
    }

    pub fn set_live(&self, live: bool) {
        self.state.write().live = live;
    }

    pub fn set_live_edge(&self, live_edge: f64) {
        self.state.write().live_edge = Some(live_edge);
    }

    fn apply(&self, document: SegmentListDocument) -> Result<()> {
        let mut built = Vec::with_capacity(document.tracks.len());
        for track_doc in &document.tracks {
            let mut renditions = Vec::with_capacity(track_doc.renditions.len());
            for rendition_doc in &track_doc.renditions {
                let rendition = rendition_doc.rendition(track_doc)?;
                let segments = rendition_doc.segments(&rendition)?;
                renditions.push((rendition, segments));
            }
            built.push((track_doc, renditions));
        }

        let mut state = self.state.write();
        for (track_doc, renditions) in built {
            let index = match state.tracks.iter().position(|t| t.id == track_doc.id) {
                Some(index) => index,
                None => {
                    let mut track = Track::new(track_doc.id, track_doc.kind, track_doc.language.clone());
                    track.roles = track_doc.roles.clone();
                    state.tracks.push(track);
                    state.tracks.len() - 1
                }
            };
            let mut new_renditions = Vec::new();
            for (rendition, segments) in renditions {
                let list = state.segments.entry(rendition.id).or_default();
                let last_end = list.last().map(|s| s.end).unwrap_or(f64::NEG_INFINITY);
                list.extend(segments.into_iter().filter(|s| s.start >= last_end - 1e-3));
                new_renditions.push(rendition);
            }
            state.tracks[index].append_renditions(new_renditions);
        }

        state.live = document.live;
        state.refresh_uri = document.refresh_uri;
        state.duration = match document.duration {
            Some(duration) => Some(duration),
            None if !document.live => state
                .segments
                .values()
                .filter_map(|l| l.last())
                .map(|s| s.end)
                .reduce(f64::max),
            None => None,
        };
        state.live_edge = document.live_edge.or_else(|| {
            document
                .live
                .then(|| state.segments.values().filter_map(|l| l.last()).map(|s| s.end).reduce(f64::max))
                .flatten()
        });
        Ok(())
    }
}

#[async_trait]
impl ManifestProvider for SegmentListManifest {
    fn tracks(&self) -> Vec<Track> {
        self.state.read().tracks.clone()
    }

    fn segments(&self, rendition: &Rendition) -> Vec<SegmentReference> {
        self.state.read().segments.get(&rendition.id).cloned().unwrap_or_default()
    }

    fn is_live(&self) -> bool {
        self.state.read().live
    }

    fn duration(&self) -> Option<f64> {
        let state = self.state.read();
        if state.live {
            None
        } else {
            state.duration
        }
    }

    fn live_edge(&self) -> Option<f64> {
        self.state.read().live_edge
    }

    fn max_segment_duration(&self) -> Option<f64> {
        self.state
            .read()
            .segments
            .values()
            .flatten()
            .map(|s| s.duration())
            .reduce(f64::max)
    }

    #[instrument(skip(self, net, retry))]
    async fn refresh(&self, net: &NetworkingEngine, retry: &AttemptParameters) -> Result<()> {
        let Some(uri) = self.state.read().refresh_uri.clone() else {
            return Ok(());
        };
        let response = net
            .attempt(Request::new(RequestType::Manifest, vec![uri], retry.clone()))
            .await?;
        let document: SegmentListDocument =
            serde_json::from_slice(&response.data).map_err(|e| Error::InvalidManifest(e.to_string()))?;
        let live = document.live;
        self.apply(document)?;
        debug!(live, live_edge = ?self.live_edge(), "Segment list refreshed");
        if !live {
            info!("Presentation is no longer live");
        }
        Ok(())
    }
}
