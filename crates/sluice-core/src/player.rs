//! Player - session orchestration and playback control
//!
//! Owns the long-lived components (attempt engine, ABR controller, buffer
//! model, state machine, event bus) and builds one session per `load`:
//!
//! ```text
//!   load(manifest)
//!        │
//!        ├── teardown previous session (cancel requests, timers, loops)
//!        ├── pick tracks and the initial rendition
//!        ├── StreamingEngine (one pull loop per content type)
//!        ├── supervisor  ◄── SessionSignal (errors, restrictions, end)
//!        └── ticker      ──► playhead, gaps, stalls, live edge, state
//! ```

use crate::abr::AbrController;
use crate::buffer::{BufferModel, BufferPartition};
use crate::config::PlayerConfiguration;
use crate::drm::{CertificateCache, Cdm, DrmHooks, DrmSessionInfo, DrmSessionManager, NoHooks};
use crate::error::{Error, Result};
use crate::events::{EventBus, PlayerEvent, SessionSignal};
use crate::net::{NetworkingEngine, Transport};
use crate::state::PlayerStateMachine;
use crate::stats::PlayerStats;
use crate::streaming::{
    ChaseAction, GapJumper, LiveEdgeChaser, ManifestProvider, MediaSink, Playhead, StallDetector,
    StreamingContext, StreamingEngine,
};
use crate::track::{filters, Rendition, Track};
use crate::types::{saturating_secs, ContentType, PlayerState, SessionId};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Slack allowed when deciding the playhead reached the end
const END_TOLERANCE: f64 = 0.05;

/// Who moves the playhead
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayheadClock {
    /// The player advances the playhead through buffered content while playing
    #[default]
    Internal,
    /// The host reports positions with [`Player::update_playhead`]
    Host,
}

/// Platform collaborators supplied by the hosting application
pub struct PlayerContext {
    pub transport: Arc<dyn Transport>,
    pub sink: Arc<dyn MediaSink>,
    /// Required for encrypted content
    pub cdm: Option<Arc<dyn Cdm>>,
    pub drm_hooks: Arc<dyn DrmHooks>,
    pub clock: PlayheadClock,
}

impl PlayerContext {
    pub fn new(transport: Arc<dyn Transport>, sink: Arc<dyn MediaSink>) -> Self {
        Self {
            transport,
            sink,
            cdm: None,
            drm_hooks: Arc::new(NoHooks),
            clock: PlayheadClock::default(),
        }
    }

    pub fn with_cdm(mut self, cdm: Arc<dyn Cdm>) -> Self {
        self.cdm = Some(cdm);
        self
    }

    pub fn with_drm_hooks(mut self, hooks: Arc<dyn DrmHooks>) -> Self {
        self.drm_hooks = hooks;
        self
    }

    pub fn with_clock(mut self, clock: PlayheadClock) -> Self {
        self.clock = clock;
        self
    }
}

/// Components that outlive a session
#[derive(Clone)]
struct Core {
    net: Arc<NetworkingEngine>,
    abr: Arc<AbrController>,
    buffer: Arc<BufferModel>,
    state: Arc<PlayerStateMachine>,
    events: Arc<EventBus>,
    sink: Arc<dyn MediaSink>,
}

#[derive(Debug, Default, Clone, Copy)]
struct TickCounters {
    stalls: u32,
    gaps_jumped: u32,
}

/// One loaded presentation
struct Session {
    id: SessionId,
    config: PlayerConfiguration,
    manifest: Arc<dyn ManifestProvider>,
    streaming: Arc<StreamingEngine>,
    drm: Option<Arc<DrmSessionManager>>,
    playhead: Arc<Playhead>,
    /// Track id per streamed content type
    tracks: Mutex<HashMap<ContentType, u32>>,
    cancel: CancellationToken,
    started: Instant,
    load_latency: Mutex<Option<f64>>,
    counters: Mutex<TickCounters>,
}

impl Session {
    fn restricted_key_ids(&self) -> HashSet<String> {
        self.drm.as_ref().map(|d| d.restricted_key_ids()).unwrap_or_default()
    }

    fn track(&self, content_type: ContentType) -> Option<Track> {
        let id = *self.tracks.lock().get(&content_type)?;
        self.manifest.tracks().into_iter().find(|t| t.kind == content_type && t.id == id)
    }

    /// Keep the playhead inside the presentation
    fn clamp(&self, position: f64) -> f64 {
        let upper = if self.manifest.is_live() {
            self.manifest.live_edge()
        } else {
            self.manifest.duration()
        };
        match upper {
            Some(upper) => position.clamp(0.0, upper.max(0.0)),
            None => position.max(0.0),
        }
    }

    /// Move the playhead; unbuffered targets flush the buffer first
    async fn seek(&self, core: &Core, position: f64) {
        let buffered = core
            .buffer
            .ranges(BufferPartition::Total)
            .range_containing(position)
            .is_some();
        self.playhead.seek(position);
        if !buffered {
            flush(core).await;
        }
        info!(session_id = %self.id, position, buffered, "Seek");
        core.events.emit(PlayerEvent::SeekRequested { position });
    }

    async fn on_error(&self, core: &Core, err: Error) {
        core.events.emit(PlayerEvent::error(&err));
        if err.is_recoverable() {
            warn!(session_id = %self.id, code = err.code(), error = %err, "Recoverable playback error");
            return;
        }
        error!(session_id = %self.id, code = err.code(), error = %err, "Fatal playback error");
        core.state.fail(self.playhead.position());
        self.streaming.stop();
        self.cancel.cancel();
        if let Some(drm) = &self.drm {
            drm.close_all().await;
        }
    }

    /// Drop renditions that use restricted keys and move off them
    fn apply_restrictions(&self, core: &Core, restricted: &HashSet<String>) -> Result<()> {
        let selected: Vec<ContentType> = self.tracks.lock().keys().copied().collect();
        for content_type in selected {
            let Some(track) = self.track(content_type) else {
                continue;
            };
            let playable = playable_renditions(&track, restricted);
            if playable.is_empty() {
                if content_type == ContentType::Text {
                    warn!(session_id = %self.id, track_id = track.id, "Text track restricted, disabling");
                    self.streaming.deselect(ContentType::Text);
                    continue;
                }
                return Err(Error::RestrictionsCannotBeMet);
            }

            let current = self.streaming.selection(content_type);
            let still_playable = current
                .as_ref()
                .is_some_and(|c| playable.iter().any(|r| r.id == c.id));

            if content_type == self.streaming.adaptive_type() {
                core.abr.set_renditions(playable.clone());
                if still_playable {
                    continue;
                }
                let choice = core.abr.choose_initial().ok_or(Error::RestrictionsCannotBeMet)?;
                let rendition = playable
                    .iter()
                    .find(|r| r.id == choice.rendition_id)
                    .cloned()
                    .ok_or(Error::RestrictionsCannotBeMet)?;
                info!(
                    session_id = %self.id,
                    from = ?current.as_ref().map(|r| r.id),
                    to = rendition.id,
                    "Leaving restricted rendition"
                );
                self.streaming.select(content_type, rendition);
                core.events.emit(PlayerEvent::Adaptation {
                    choice,
                    previous_rendition_id: current.map(|r| r.id),
                });
            } else if !still_playable {
                if let Some(rendition) = playable.last() {
                    self.streaming.select(content_type, rendition.clone());
                }
            }
        }
        Ok(())
    }
}

/// Renditions of a track that use none of the restricted keys, by bandwidth
fn playable_renditions(track: &Track, restricted: &HashSet<String>) -> Vec<Arc<Rendition>> {
    let usable = filters::without_key_ids(restricted);
    track
        .renditions()
        .iter()
        .filter(|r| usable(r.as_ref()))
        .cloned()
        .collect()
}

/// Pick one track per content type
fn choose_tracks(tracks: &[Track], config: &PlayerConfiguration) -> HashMap<ContentType, Track> {
    let mut chosen = HashMap::new();

    let video = filters::by_kind(ContentType::Video);
    if let Some(track) = tracks.iter().find(|t| video(*t)) {
        chosen.insert(ContentType::Video, track.clone());
    }

    let audio = filters::by_kind(ContentType::Audio);
    let main = filters::by_role("main");
    let candidates: Vec<&Track> = tracks.iter().filter(|t| audio(*t)).collect();
    let preferred = config.preferred_audio_language.as_deref().and_then(|language| {
        let matches = filters::by_language(language);
        candidates.iter().find(|t| matches(**t)).copied()
    });
    if let Some(track) = preferred
        .or_else(|| candidates.iter().find(|t| main(**t)).copied())
        .or_else(|| candidates.first().copied())
    {
        chosen.insert(ContentType::Audio, track.clone());
    }

    if let Some(language) = config.preferred_text_language.as_deref() {
        let text = filters::by_kind(ContentType::Text);
        let matches = filters::by_language(language);
        if let Some(track) = tracks.iter().find(|t| text(*t) && matches(*t)) {
            chosen.insert(ContentType::Text, track.clone());
        }
    }
    chosen
}

/// Remove everything from the sink and the buffer model
async fn flush(core: &Core) {
    for (content_type, ranges) in core.buffer.snapshot() {
        let (Some(first), Some(last)) = (ranges.first(), ranges.last()) else {
            continue;
        };
        if let Err(err) = core.sink.remove(content_type, first.start, last.end).await {
            warn!(content_type = %content_type, error = %err, "Sink flush failed");
        }
    }
    core.buffer.clear_all();
}

/// Adaptive streaming player
pub struct Player {
    core: Core,
    clock: PlayheadClock,
    cdm: Option<Arc<dyn Cdm>>,
    drm_hooks: Arc<dyn DrmHooks>,
    config: RwLock<PlayerConfiguration>,
    certificates: CertificateCache,
    load_lock: tokio::sync::Mutex<()>,
    load_generation: AtomicU64,
    session: RwLock<Option<Arc<Session>>>,
}

impl Player {
    pub fn new(ctx: PlayerContext, config: PlayerConfiguration) -> Result<Self> {
        config.validate()?;

        let events = Arc::new(EventBus::new());
        let net = Arc::new(NetworkingEngine::new(ctx.transport));
        let abr = Arc::new(AbrController::new(config.abr.clone()));

        {
            let abr = abr.clone();
            let events = events.clone();
            net.on_trace(Arc::new(move |trace| {
                abr.segment_downloaded(trace);
                if !trace.partial {
                    events.emit(PlayerEvent::DownloadTrace(trace.clone()));
                }
            }));
        }
        {
            let events = events.clone();
            net.on_recoverable_error(Arc::new(move |err| {
                events.emit(PlayerEvent::error(err));
            }));
        }

        let core = Core {
            net,
            abr,
            buffer: Arc::new(BufferModel::new()),
            state: Arc::new(PlayerStateMachine::new(events.clone())),
            events,
            sink: ctx.sink,
        };

        Ok(Self {
            core,
            clock: ctx.clock,
            cdm: ctx.cdm,
            drm_hooks: ctx.drm_hooks,
            config: RwLock::new(config),
            certificates: CertificateCache::new(),
            load_lock: tokio::sync::Mutex::new(()),
            load_generation: AtomicU64::new(0),
            session: RwLock::new(None),
        })
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.core.events
    }

    /// Attempt engine; register modifiers and the CDN fallback here
    pub fn networking_engine(&self) -> &Arc<NetworkingEngine> {
        &self.core.net
    }

    pub fn state(&self) -> PlayerState {
        self.core.state.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PlayerState> {
        self.core.state.subscribe()
    }

    pub fn configuration(&self) -> PlayerConfiguration {
        self.config.read().clone()
    }

    /// Merge a partial JSON document into the configuration; applies at the next `load`
    pub fn configure(&self, overrides: serde_json::Value) -> Result<()> {
        let merged = self.config.read().merged_with(overrides)?;
        *self.config.write() = merged;
        debug!("Configuration updated");
        Ok(())
    }

    pub fn position(&self) -> Option<f64> {
        self.session.read().as_ref().map(|s| s.playhead.position())
    }

    pub fn buffered(&self) -> crate::buffer::BufferedRanges {
        self.core.buffer.ranges(BufferPartition::Total)
    }

    pub fn tracks(&self) -> Vec<Track> {
        self.session
            .read()
            .as_ref()
            .map(|s| s.manifest.tracks())
            .unwrap_or_default()
    }

    pub fn drm_sessions(&self) -> Vec<DrmSessionInfo> {
        self.session
            .read()
            .as_ref()
            .and_then(|s| s.drm.as_ref())
            .map(|drm| drm.sessions().iter().map(|s| s.info()).collect())
            .unwrap_or_default()
    }

    fn current(&self) -> Result<Arc<Session>> {
        self.session.read().clone().ok_or(Error::NotLoaded)
    }

    /// Start a new session; a load superseded while waiting fails with `LOAD_INTERRUPTED`
    #[instrument(skip(self, manifest))]
    pub async fn load(&self, manifest: Arc<dyn ManifestProvider>, start_time: Option<f64>) -> Result<SessionId> {
        let generation = self.load_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = self.load_lock.lock().await;
        if self.load_generation.load(Ordering::SeqCst) != generation {
            return Err(Error::LoadInterrupted);
        }

        let config = self.config.read().clone();
        config.validate()?;
        self.teardown().await;
        self.core.state.reset();

        let id = SessionId::new();
        self.core.events.emit(PlayerEvent::Loading { session_id: id });
        self.core.state.transition(PlayerState::Preparing, start_time.unwrap_or(0.0))?;

        match self.start_session(id, manifest, start_time, config) {
            Ok(session) => {
                let is_live = session.manifest.is_live();
                *self.session.write() = Some(session);
                info!(session_id = %id, is_live, "Loaded");
                self.core.events.emit(PlayerEvent::Loaded { session_id: id, is_live });
                Ok(id)
            }
            Err(err) => {
                error!(session_id = %id, code = err.code(), error = %err, "Load failed");
                self.core.events.emit(PlayerEvent::error(&err));
                self.core.state.fail(start_time.unwrap_or(0.0));
                Err(err)
            }
        }
    }

    fn start_session(
        &self,
        id: SessionId,
        manifest: Arc<dyn ManifestProvider>,
        start_time: Option<f64>,
        config: PlayerConfiguration,
    ) -> Result<Arc<Session>> {
        let core = &self.core;
        core.abr.configure(config.abr.clone());
        core.abr.reset_abr();

        let tracks = choose_tracks(&manifest.tracks(), &config);
        let adaptive = if tracks.contains_key(&ContentType::Video) {
            ContentType::Video
        } else if tracks.contains_key(&ContentType::Audio) {
            ContentType::Audio
        } else {
            return Err(Error::NoRenditions);
        };

        let restricted = HashSet::new();
        let adaptive_renditions = tracks
            .get(&adaptive)
            .map(|t| playable_renditions(t, &restricted))
            .unwrap_or_default();
        core.abr.set_renditions(adaptive_renditions.clone());
        let choice = core.abr.choose_initial().ok_or(Error::NoRenditions)?;
        let initial = adaptive_renditions
            .iter()
            .find(|r| r.id == choice.rendition_id)
            .cloned()
            .ok_or(Error::NoRenditions)?;

        let (signals, signal_rx) = mpsc::unbounded_channel();
        let drm = self.cdm.as_ref().map(|cdm| {
            Arc::new(
                DrmSessionManager::new(
                    config.drm.clone(),
                    config.license_retry.clone(),
                    cdm.clone(),
                    core.net.clone(),
                    core.events.clone(),
                )
                .with_hooks(self.drm_hooks.clone())
                .with_signals(signals.clone())
                .with_certificate_cache(self.certificates.clone()),
            )
        });

        let start = match start_time {
            Some(start) => start.max(0.0),
            None if manifest.is_live() => manifest
                .live_edge()
                .map(|edge| (edge - config.streaming.safe_seek_offset).max(0.0))
                .unwrap_or(0.0),
            None => 0.0,
        };
        let playhead = Arc::new(Playhead::new(start));

        let cancel = CancellationToken::new();
        let streaming = StreamingEngine::new(
            StreamingContext {
                config: config.streaming.clone(),
                segment_retry: config.segment_retry.clone(),
                manifest_retry: config.manifest_retry.clone(),
                manifest: manifest.clone(),
                net: core.net.clone(),
                abr: core.abr.clone(),
                drm: drm.clone(),
                sink: core.sink.clone(),
                buffer: core.buffer.clone(),
                playhead: playhead.clone(),
                events: core.events.clone(),
                signals,
                state: core.state.subscribe(),
            },
            adaptive,
            cancel.child_token(),
        );

        streaming.select(adaptive, initial);
        for (content_type, track) in &tracks {
            if *content_type == adaptive {
                continue;
            }
            if let Some(rendition) = playable_renditions(track, &restricted).last() {
                streaming.select(*content_type, rendition.clone());
            }
        }
        core.events.emit(PlayerEvent::Adaptation {
            choice,
            previous_rendition_id: None,
        });

        let session = Arc::new(Session {
            id,
            manifest,
            streaming: streaming.clone(),
            drm,
            playhead,
            tracks: Mutex::new(tracks.iter().map(|(ct, t)| (*ct, t.id)).collect()),
            cancel,
            started: Instant::now(),
            load_latency: Mutex::new(None),
            counters: Mutex::new(TickCounters::default()),
            config,
        });

        streaming.start();
        tokio::spawn(supervise(core.clone(), session.clone(), signal_rx));
        tokio::spawn(Ticker::new(core.clone(), session.clone(), self.clock).run());

        info!(
            session_id = %id,
            adaptive = %adaptive,
            tracks = tracks.len(),
            start,
            "Session started"
        );
        Ok(session)
    }

    /// Cancel everything the current session owns
    async fn teardown(&self) {
        let session = self.session.write().take();
        let Some(session) = session else {
            return;
        };
        self.core.events.emit(PlayerEvent::Unloading { session_id: session.id });
        session.cancel.cancel();
        session.streaming.stop();
        self.core.net.abort_all();
        if let Some(drm) = &session.drm {
            drm.close_all().await;
        }
        flush(&self.core).await;
        info!(session_id = %session.id, "Session torn down");
    }

    /// Tear down the session and return to `Idle`
    pub async fn release(&self) {
        self.load_generation.fetch_add(1, Ordering::SeqCst);
        let _guard = self.load_lock.lock().await;
        self.teardown().await;
        self.core.abr.reset_abr();
        self.core.state.reset();
    }

    pub fn play(&self) -> Result<()> {
        let position = self.position().unwrap_or(0.0);
        self.core.state.play(position)
    }

    pub fn pause(&self) -> Result<()> {
        let position = self.position().unwrap_or(0.0);
        self.core.state.pause(position)
    }

    #[instrument(skip(self))]
    pub async fn seek(&self, position: f64) -> Result<()> {
        let session = self.current()?;
        let position = session.clamp(position);
        session.seek(&self.core, position).await;
        if self.core.state.state() == PlayerState::Ended {
            self.core.state.transition(PlayerState::Buffering, position)?;
        }
        Ok(())
    }

    /// Position reported by the host
    pub fn update_playhead(&self, position: f64) -> Result<()> {
        self.current()?.playhead.set_position(position);
        Ok(())
    }

    pub fn set_playback_rate(&self, rate: f64) -> Result<()> {
        if rate <= 0.0 {
            return Err(Error::InvalidConfig(format!("playback rate must be positive, got {rate}")));
        }
        self.current()?.playhead.set_rate(rate);
        self.core.events.emit(PlayerEvent::PlaybackRateChanged { rate });
        Ok(())
    }

    pub fn set_abr_enabled(&self, enabled: bool) {
        self.core.abr.set_enabled(enabled);
        info!(enabled, "ABR toggled");
    }

    /// Switch the adaptive stream to a rendition; disables ABR
    #[instrument(skip(self))]
    pub fn select_rendition(&self, rendition_id: u32) -> Result<()> {
        let session = self.current()?;
        let adaptive = session.streaming.adaptive_type();
        let track = session.track(adaptive).ok_or(Error::NoRenditions)?;
        let rendition = track.rendition(rendition_id).cloned().ok_or(Error::NoRenditions)?;

        let restricted = session.restricted_key_ids();
        if !filters::without_key_ids(&restricted)(rendition.as_ref()) {
            return Err(Error::RestrictionsCannotBeMet);
        }

        self.core.abr.set_enabled(false);
        let choice = self.core.abr.select_manual(rendition.clone());
        session.streaming.select(adaptive, rendition);
        self.core.events.emit(PlayerEvent::VariantChanged { choice });
        Ok(())
    }

    /// Switch to the audio track matching a language; new audio follows what is buffered
    #[instrument(skip(self))]
    pub fn select_audio_language(&self, language: &str) -> Result<()> {
        let session = self.current()?;
        let audio = filters::by_kind(ContentType::Audio);
        let matches = filters::by_language(language);
        let track = session
            .manifest
            .tracks()
            .into_iter()
            .find(|t| audio(t) && matches(t))
            .ok_or(Error::NoRenditions)?;

        let playable = playable_renditions(&track, &session.restricted_key_ids());
        let chosen = if session.streaming.adaptive_type() == ContentType::Audio {
            self.core.abr.set_renditions(playable.clone());
            let choice = self.core.abr.choose_initial().ok_or(Error::RestrictionsCannotBeMet)?;
            playable.iter().find(|r| r.id == choice.rendition_id).cloned()
        } else {
            playable.last().cloned()
        };
        let rendition = chosen.ok_or(Error::RestrictionsCannotBeMet)?;

        session.tracks.lock().insert(ContentType::Audio, track.id);
        session.streaming.select(ContentType::Audio, rendition);
        session.streaming.ensure_stream(ContentType::Audio);
        self.core.events.emit(PlayerEvent::TrackChanged {
            content_type: ContentType::Audio,
            track_id: track.id,
        });
        Ok(())
    }

    /// Enable a text track, or disable text with `None`
    #[instrument(skip(self))]
    pub fn select_text_track(&self, track_id: Option<u32>) -> Result<()> {
        let session = self.current()?;
        let Some(track_id) = track_id else {
            session.tracks.lock().remove(&ContentType::Text);
            session.streaming.deselect(ContentType::Text);
            self.core.buffer.clear(ContentType::Text);
            info!(session_id = %session.id, "Text disabled");
            return Ok(());
        };

        let text = filters::by_kind(ContentType::Text);
        let track = session
            .manifest
            .tracks()
            .into_iter()
            .find(|t| text(t) && t.id == track_id)
            .ok_or(Error::NoRenditions)?;
        let rendition = playable_renditions(&track, &session.restricted_key_ids())
            .first()
            .cloned()
            .ok_or_else(|| {
                if track.renditions().is_empty() {
                    Error::NoRenditions
                } else {
                    Error::RestrictionsCannotBeMet
                }
            })?;

        session.tracks.lock().insert(ContentType::Text, track.id);
        session.streaming.select(ContentType::Text, rendition);
        session.streaming.ensure_stream(ContentType::Text);
        self.core.events.emit(PlayerEvent::TrackChanged {
            content_type: ContentType::Text,
            track_id,
        });
        Ok(())
    }

    pub fn stats(&self) -> PlayerStats {
        let core = &self.core;
        let mut stats = PlayerStats {
            estimated_bandwidth: core.abr.bandwidth_estimate(),
            long_term_bandwidth: core.abr.long_term_estimate(),
            switch_history: core.abr.switch_history(),
            state_history: core.state.history(),
            time_in_states: core.state.time_in_states(),
            ..Default::default()
        };

        let session = self.session.read().clone();
        if let Some(session) = session {
            let current = session.streaming.selection(session.streaming.adaptive_type());
            stats.stream_bandwidth = current.as_ref().map(|r| r.bandwidth);
            stats.resolution = current.as_ref().and_then(|r| r.resolution);
            stats.position = session.playhead.position();
            stats.buffered_ahead = core
                .buffer
                .buffered_ahead_of(BufferPartition::Total, stats.position, false);
            stats.load_latency = *session.load_latency.lock();
            let counters = *session.counters.lock();
            stats.stall_count = counters.stalls;
            stats.gaps_jumped = counters.gaps_jumped;
            stats.drm_sessions = session
                .drm
                .as_ref()
                .map(|drm| drm.sessions().iter().map(|s| s.info()).collect())
                .unwrap_or_default();
        }
        stats.finish(core.abr.now())
    }
}

/// Handle signals raised by the session's components
async fn supervise(core: Core, session: Arc<Session>, mut signals: mpsc::UnboundedReceiver<SessionSignal>) {
    loop {
        let signal = tokio::select! {
            _ = session.cancel.cancelled() => break,
            signal = signals.recv() => match signal {
                Some(signal) => signal,
                None => break,
            },
        };

        match signal {
            SessionSignal::Error(err) => session.on_error(&core, err).await,
            SessionSignal::RestrictionsChanged(restricted) => {
                debug!(session_id = %session.id, restricted = restricted.len(), "Key restrictions changed");
                if let Err(err) = session.apply_restrictions(&core, &restricted) {
                    session.on_error(&core, err).await;
                }
            }
            SessionSignal::StreamsExhausted => {
                debug!(session_id = %session.id, "Streams exhausted");
            }
        }
    }
    debug!(session_id = %session.id, "Supervisor stopped");
}

/// Periodic playhead maintenance
struct Ticker {
    core: Core,
    session: Arc<Session>,
    clock: PlayheadClock,
    gaps: GapJumper,
    stalls: StallDetector,
    chaser: LiveEdgeChaser,
    last: Instant,
}

impl Ticker {
    fn new(core: Core, session: Arc<Session>, clock: PlayheadClock) -> Self {
        let config = &session.config.streaming;
        Self {
            gaps: GapJumper::new(config),
            stalls: StallDetector::new(config),
            chaser: LiveEdgeChaser::new(),
            last: Instant::now(),
            core,
            session,
            clock,
        }
    }

    async fn run(mut self) {
        let period = saturating_secs(self.session.config.streaming.tick_interval);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.session.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            self.tick(Instant::now()).await;
        }
    }

    async fn tick(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.last = now;

        let core = self.core.clone();
        let session = self.session.clone();
        let config = &session.config.streaming;
        let playhead = &session.playhead;
        let state = core.state.state();
        let total = core.buffer.ranges(BufferPartition::Total);

        if state == PlayerState::Playing && self.clock == PlayheadClock::Internal {
            let position = playhead.position();
            let limit = total.range_containing(position).map_or(position, |r| r.end);
            playhead.advance(elapsed, limit);
        }
        let mut position = playhead.position();

        if state.is_running() {
            if let Some(to) = self.gaps.evaluate(&total, position, &core.events) {
                playhead.set_position(to);
                core.events.emit(PlayerEvent::SeekRequested { position: to });
                position = to;
            }
        }

        let expect_progress =
            state == PlayerState::Playing && total.buffered_ahead_of(position, false) > 0.0;
        if let Some(skip_to) = self.stalls.poll(position, expect_progress, now) {
            playhead.set_position(skip_to);
            core.events.emit(PlayerEvent::StallDetected { position, skip_to });
            core.events.emit(PlayerEvent::SeekRequested { position: skip_to });
            core.events.emit(PlayerEvent::error(&Error::BufferStall {
                position,
                skipped: skip_to - position,
            }));
            position = skip_to;
        }

        *session.counters.lock() = TickCounters {
            stalls: self.stalls.stalls(),
            gaps_jumped: self.gaps.gaps_jumped(),
        };

        if session.manifest.is_live() && matches!(state, PlayerState::Playing | PlayerState::Buffering) {
            if let Some(live_edge) = session.manifest.live_edge() {
                match self.chaser.update(live_edge, position, config) {
                    ChaseAction::Seek(target) => {
                        session.seek(&core, target).await;
                        position = target;
                    }
                    ChaseAction::SetRate(rate) => {
                        playhead.set_rate(rate);
                        core.events.emit(PlayerEvent::PlaybackRateChanged { rate });
                    }
                    ChaseAction::RestoreRate => {
                        playhead.set_rate(1.0);
                        core.events.emit(PlayerEvent::PlaybackRateChanged { rate: 1.0 });
                    }
                    ChaseAction::None => {}
                }
            }
        }

        let exhausted = session.streaming.is_exhausted();
        let at_end = !session.manifest.is_live()
            && session
                .manifest
                .duration()
                .is_some_and(|duration| position >= duration - END_TOLERANCE);
        if exhausted && at_end && matches!(state, PlayerState::Playing | PlayerState::Buffering) {
            match core.state.end(position) {
                Ok(true) => {}
                Ok(false) => debug!(position, "End reached outside a running state"),
                Err(err) => warn!(error = %err, "Could not end playback"),
            }
            return;
        }

        let ahead = total.buffered_ahead_of(position, false);
        match core.state.on_buffer(ahead, config.rebuffering_goal, exhausted, position) {
            Ok(Some(PlayerState::Playing)) => {
                let mut latency = session.load_latency.lock();
                if latency.is_none() {
                    let elapsed = session.started.elapsed().as_secs_f64();
                    info!(session_id = %session.id, load_latency = elapsed, "Playback started");
                    *latency = Some(elapsed);
                }
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "Buffer state update rejected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::NullSink;

    fn track(id: u32, kind: ContentType, language: &str) -> Track {
        Track::new(id, kind, language).with_rendition(Rendition::new(id * 10, id, kind, 128_000))
    }

    #[test]
    fn test_choose_tracks_prefers_language_then_main_role() {
        let tracks = vec![
            track(1, ContentType::Video, "und"),
            track(2, ContentType::Audio, "en"),
            track(3, ContentType::Audio, "fr").with_role("main"),
            track(4, ContentType::Text, "de"),
        ];

        let config = PlayerConfiguration::default();
        let chosen = choose_tracks(&tracks, &config);
        assert_eq!(chosen[&ContentType::Audio].id, 3);
        assert!(!chosen.contains_key(&ContentType::Text));

        let config = PlayerConfiguration {
            preferred_audio_language: Some("en-US".into()),
            preferred_text_language: Some("de".into()),
            ..Default::default()
        };
        let chosen = choose_tracks(&tracks, &config);
        assert_eq!(chosen[&ContentType::Video].id, 1);
        assert_eq!(chosen[&ContentType::Audio].id, 2);
        assert_eq!(chosen[&ContentType::Text].id, 4);
    }

    #[test]
    fn test_playable_renditions_skip_restricted_keys() {
        use crate::types::{DrmInfo, KeySystem};

        let track = Track::new(1, ContentType::Video, "und")
            .with_rendition(
                Rendition::new(1, 1, ContentType::Video, 1_000_000)
                    .with_drm_info(DrmInfo::new(KeySystem::ClearKey).with_key_id("aa")),
            )
            .with_rendition(
                Rendition::new(2, 1, ContentType::Video, 4_000_000)
                    .with_drm_info(DrmInfo::new(KeySystem::ClearKey).with_key_id("bb")),
            );
        let restricted: HashSet<String> = ["bb".to_string()].into_iter().collect();
        let playable = playable_renditions(&track, &restricted);
        assert_eq!(playable.len(), 1);
        assert_eq!(playable[0].id, 1);
    }

    #[tokio::test]
    async fn test_commands_before_load() {
        struct NoTransport;

        #[async_trait::async_trait]
        impl Transport for NoTransport {
            async fn send(
                &self,
                _request: &crate::net::Request,
                _uri: &url::Url,
                _progress: crate::net::Progress<'_>,
            ) -> std::result::Result<crate::net::TransportResponse, crate::net::TransportError> {
                Err(crate::net::TransportError::Connection("offline".into()))
            }
        }

        let ctx = PlayerContext::new(Arc::new(NoTransport), Arc::new(NullSink::new()));
        let player = Player::new(ctx, PlayerConfiguration::default()).unwrap();
        assert_eq!(player.state(), PlayerState::Idle);
        assert_eq!(player.seek(3.0).await.unwrap_err().code(), "NOT_LOADED");
        assert_eq!(player.select_rendition(1).unwrap_err().code(), "NOT_LOADED");
        assert!(player.pause().is_err());
        assert!(player.tracks().is_empty());

        player.release().await;
        assert_eq!(player.state(), PlayerState::Idle);
    }

    #[test]
    fn test_invalid_configuration_rejected() {
        let config = PlayerConfiguration::merge(serde_json::json!({
            "streaming": { "rebufferingGoal": 20.0, "bufferingGoal": 10.0 }
        }));
        assert_eq!(config.unwrap_err().code(), "INVALID_CONFIG");
    }
}
