//! Player events
//!
//! Events are dispatched synchronously to observers in registration order.
//! Observers receive an [`EventControl`] and may call
//! [`EventControl::prevent_default`] on cancellable events (large gaps).
//! Async consumers can take an unbounded channel with
//! [`EventBus::subscribe_channel`].

use crate::error::{Category, Error, Severity};
use crate::net::DownloadTrace;
use crate::types::{ContentType, KeySystem, PlayerState, RenditionChoice, SessionId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Event emitted to the host application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlayerEvent {
    /// A load started
    Loading { session_id: SessionId },

    /// Tracks are known and the first renditions are chosen
    Loaded { session_id: SessionId, is_live: bool },

    /// The current session is being torn down
    Unloading { session_id: SessionId },

    StateChanged { from: PlayerState, to: PlayerState },

    BufferingStarted { position: f64 },

    BufferingEnded { position: f64, duration: f64 },

    /// ABR switched renditions
    Adaptation {
        choice: RenditionChoice,
        previous_rendition_id: Option<u32>,
    },

    /// The application switched renditions
    VariantChanged { choice: RenditionChoice },

    /// Audio or text track changed
    TrackChanged {
        content_type: ContentType,
        track_id: u32,
    },

    DownloadTrace(DownloadTrace),

    DrmSessionUpdate {
        session_id: String,
        key_system: KeySystem,
    },

    DrmSessionRenewed { session_id: String, renewals: u32 },

    DrmSessionExpired { session_id: String },

    /// Keys became output-restricted; renditions using them are no longer playable
    KeyStatusRestricted { key_ids: Vec<String> },

    /// The playhead sits in a gap larger than `smallGapLimit`; cancellable
    LargeGap { position: f64, gap_size: f64 },

    GapJumped { from: f64, to: f64 },

    StallDetected { position: f64, skip_to: f64 },

    /// The core moved the playhead; the host must seek its presentation
    SeekRequested { position: f64 },

    /// The host must apply this playback rate
    PlaybackRateChanged { rate: f64 },

    ManifestRefreshed { live_edge: Option<f64> },

    Error {
        code: String,
        category: Category,
        severity: Severity,
        message: String,
    },
}

impl PlayerEvent {
    pub fn error(err: &Error) -> Self {
        PlayerEvent::Error {
            code: err.code().to_string(),
            category: err.category(),
            severity: err.severity(),
            message: err.to_string(),
        }
    }

    /// Event name as used in serialized output
    pub fn name(&self) -> &'static str {
        match self {
            PlayerEvent::Loading { .. } => "loading",
            PlayerEvent::Loaded { .. } => "loaded",
            PlayerEvent::Unloading { .. } => "unloading",
            PlayerEvent::StateChanged { .. } => "state_changed",
            PlayerEvent::BufferingStarted { .. } => "buffering_started",
            PlayerEvent::BufferingEnded { .. } => "buffering_ended",
            PlayerEvent::Adaptation { .. } => "adaptation",
            PlayerEvent::VariantChanged { .. } => "variant_changed",
            PlayerEvent::TrackChanged { .. } => "track_changed",
            PlayerEvent::DownloadTrace(_) => "download_trace",
            PlayerEvent::DrmSessionUpdate { .. } => "drm_session_update",
            PlayerEvent::DrmSessionRenewed { .. } => "drm_session_renewed",
            PlayerEvent::DrmSessionExpired { .. } => "drm_session_expired",
            PlayerEvent::KeyStatusRestricted { .. } => "key_status_restricted",
            PlayerEvent::LargeGap { .. } => "large_gap",
            PlayerEvent::GapJumped { .. } => "gap_jumped",
            PlayerEvent::StallDetected { .. } => "stall_detected",
            PlayerEvent::SeekRequested { .. } => "seek_requested",
            PlayerEvent::PlaybackRateChanged { .. } => "playback_rate_changed",
            PlayerEvent::ManifestRefreshed { .. } => "manifest_refreshed",
            PlayerEvent::Error { .. } => "error",
        }
    }

    /// Only large gaps honour `prevent_default`
    pub fn is_cancelable(&self) -> bool {
        matches!(self, PlayerEvent::LargeGap { .. })
    }
}

/// Per-dispatch control handed to observers
#[derive(Debug, Default)]
pub struct EventControl {
    prevented: AtomicBool,
}

impl EventControl {
    pub fn prevent_default(&self) {
        self.prevented.store(true, Ordering::SeqCst);
    }

    pub fn default_prevented(&self) -> bool {
        self.prevented.load(Ordering::SeqCst)
    }
}

pub type Observer = Arc<dyn Fn(&PlayerEvent, &EventControl) + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Observer registry
#[derive(Default)]
pub struct EventBus {
    observers: RwLock<Vec<(ListenerId, Observer)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, observer: F) -> ListenerId
    where
        F: Fn(&PlayerEvent, &EventControl) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.write().push((id, Arc::new(observer)));
        id
    }

    /// Forward every event into an unbounded channel
    pub fn subscribe_channel(&self) -> (ListenerId, mpsc::UnboundedReceiver<PlayerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(move |event, _| {
            let _ = tx.send(event.clone());
        });
        (id, rx)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(listener, _)| *listener != id);
        observers.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.observers.read().len()
    }

    /// Dispatch to every observer; returns true if a cancellable event was prevented
    pub fn emit(&self, event: PlayerEvent) -> bool {
        let observers: Vec<Observer> = self.observers.read().iter().map(|(_, o)| o.clone()).collect();
        let control = EventControl::default();
        for observer in observers {
            observer(&event, &control);
        }
        if !matches!(event, PlayerEvent::DownloadTrace(_)) {
            debug!(event = event.name(), "Event dispatched");
        }
        event.is_cancelable() && control.default_prevented()
    }
}

/// Internal notifications from session components to the player's supervisor
#[derive(Debug)]
pub enum SessionSignal {
    /// An error raised off the caller's path; fatal ones end the session
    Error(Error),
    /// The set of output-restricted key ids changed
    RestrictionsChanged(HashSet<String>),
    /// Every stream appended its final segment
    StreamsExhausted,
}

/// Sender half used by session components
pub type SignalSender = mpsc::UnboundedSender<SessionSignal>;

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_dispatch_order_matches_registration() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let seen = seen.clone();
            bus.subscribe(move |_, _| seen.lock().push(i));
        }
        bus.emit(PlayerEvent::PlaybackRateChanged { rate: 1.0 });
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_prevent_default_only_applies_to_large_gap() {
        let bus = EventBus::new();
        bus.subscribe(|_, control| control.prevent_default());

        assert!(bus.emit(PlayerEvent::LargeGap { position: 3.0, gap_size: 2.0 }));
        assert!(!bus.emit(PlayerEvent::SeekRequested { position: 3.0 }));
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let id = bus.subscribe(|_, _| {});
        assert_eq!(bus.listener_count(), 1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_channel_subscription() {
        let bus = EventBus::new();
        let (_, mut rx) = bus.subscribe_channel();
        bus.emit(PlayerEvent::GapJumped { from: 1.0, to: 1.2 });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "gap_jumped");
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = PlayerEvent::StateChanged {
            from: PlayerState::Buffering,
            to: PlayerState::Playing,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "state_changed");
    }
}
