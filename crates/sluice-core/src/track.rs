//! Track and rendition model
//!
//! Tracks are rebuilt when a manifest is parsed. On live refresh new renditions
//! may be appended to a track, but a rendition is never removed mid-period and
//! a constructed [`Rendition`] is never mutated; it is shared as
//! `Arc<Rendition>`.
//!
//! Queries over the model are plain predicate functions (see [`filters`]).

use crate::config::AbrRestrictions;
use crate::types::{ContentType, DrmInfo, Resolution};
use std::sync::Arc;
use tracing::debug;

/// One concrete encoding of a track
#[derive(Debug, Clone)]
pub struct Rendition {
    /// Player-assigned id, unique within a load
    pub id: u32,
    /// Id from the manifest (representation id / variant URI)
    pub original_id: Option<String>,
    /// Owning track
    pub track_id: u32,
    pub content_type: ContentType,
    /// Declared bandwidth in bits per second
    pub bandwidth: u64,
    pub codec: String,
    pub resolution: Option<Resolution>,
    pub frame_rate: Option<f32>,
    /// Empty for clear content
    pub drm_infos: Vec<DrmInfo>,
}

impl Rendition {
    pub fn new(id: u32, track_id: u32, content_type: ContentType, bandwidth: u64) -> Self {
        Self {
            id,
            original_id: None,
            track_id,
            content_type,
            bandwidth,
            codec: String::new(),
            resolution: None,
            frame_rate: None,
            drm_infos: Vec::new(),
        }
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Some(Resolution::new(width, height));
        self
    }

    pub fn with_codec(mut self, codec: impl Into<String>) -> Self {
        self.codec = codec.into();
        self
    }

    pub fn with_original_id(mut self, original_id: impl Into<String>) -> Self {
        self.original_id = Some(original_id.into());
        self
    }

    pub fn with_drm_info(mut self, drm_info: DrmInfo) -> Self {
        self.drm_infos.push(drm_info);
        self
    }

    pub fn is_encrypted(&self) -> bool {
        !self.drm_infos.is_empty()
    }

    /// All key ids referenced by this rendition
    pub fn key_ids(&self) -> impl Iterator<Item = &String> {
        self.drm_infos.iter().flat_map(|info| info.key_ids.iter())
    }
}

/// A selectable stream: a set of renditions of the same content
#[derive(Debug, Clone)]
pub struct Track {
    pub id: u32,
    pub kind: ContentType,
    /// BCP-47 language code, empty when unknown
    pub language: String,
    /// Manifest roles ("main", "alternate", "commentary", ...)
    pub roles: Vec<String>,
    pub label: Option<String>,
    /// Ordered by ascending bandwidth
    renditions: Vec<Arc<Rendition>>,
}

impl Track {
    pub fn new(id: u32, kind: ContentType, language: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            language: language.into(),
            roles: Vec::new(),
            label: None,
            renditions: Vec::new(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    pub fn with_rendition(mut self, rendition: Rendition) -> Self {
        self.append_renditions(vec![rendition]);
        self
    }

    /// Renditions ordered by ascending bandwidth
    pub fn renditions(&self) -> &[Arc<Rendition>] {
        &self.renditions
    }

    pub fn rendition(&self, id: u32) -> Option<&Arc<Rendition>> {
        self.renditions.iter().find(|r| r.id == id)
    }

    /// Append renditions discovered on a live refresh.
    ///
    /// Renditions whose id is already known are ignored; existing renditions
    /// are kept as they are. Returns the number of renditions added.
    pub fn append_renditions(&mut self, renditions: Vec<Rendition>) -> usize {
        let mut added = 0;
        for mut rendition in renditions {
            if self.rendition(rendition.id).is_some() {
                continue;
            }
            rendition.track_id = self.id;
            rendition.content_type = self.kind;
            self.renditions.push(Arc::new(rendition));
            added += 1;
        }
        self.renditions.sort_by_key(|r| r.bandwidth);
        if added > 0 {
            debug!(track = self.id, added, total = self.renditions.len(), "Renditions appended");
        }
        added
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Typed predicates over the track/rendition model
pub mod filters {
    use super::*;

    /// Tracks of one content type
    pub fn by_kind(kind: ContentType) -> impl Fn(&Track) -> bool {
        move |track| track.kind == kind
    }

    /// Tracks whose language matches exactly or by primary subtag ("en" matches "en-US")
    pub fn by_language(language: &str) -> impl Fn(&Track) -> bool + '_ {
        move |track| {
            let wanted = language.to_lowercase();
            let have = track.language.to_lowercase();
            have == wanted
                || have.split('-').next() == Some(wanted.as_str())
                || wanted.split('-').next() == Some(have.as_str())
        }
    }

    /// Tracks carrying the given role
    pub fn by_role(role: &str) -> impl Fn(&Track) -> bool + '_ {
        move |track| track.has_role(role)
    }

    /// Renditions satisfying the application restrictions
    pub fn within_restrictions(restrictions: &AbrRestrictions) -> impl Fn(&Rendition) -> bool + '_ {
        move |rendition| restrictions.allows(rendition)
    }

    /// Renditions that reference none of the given key ids
    pub fn without_key_ids<'a>(
        key_ids: &'a std::collections::HashSet<String>,
    ) -> impl Fn(&Rendition) -> bool + 'a {
        move |rendition| !rendition.key_ids().any(|k| key_ids.contains(k))
    }
}
