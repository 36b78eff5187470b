//! Integration tests for Sluice Core

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use sluice_core::config::AdvancedDrmConfiguration;
use sluice_core::drm::{clearkey, Cdm, CdmEvent, CdmEventSender, CdmSession, KeyStatus};
use sluice_core::net::{Progress, TransportError, TransportResponse};
use sluice_core::{
    AbrConfiguration, AbrController, AttemptParameters, Category, ClearKeyCdm, ContentType, DownloadTrace, DrmConfiguration,
    DrmInfo, DrmSessionManager, DrmSessionState, EventBus, KeySystem, NetworkingEngine, NullSink, Player,
    PlayerConfiguration, PlayerContext, PlayerEvent, PlayerState, Rendition, Request, RequestType,
    SegmentListManifest, SegmentReference, Severity, Track, Transport,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};
use url::Url;

const KID: &str = "00112233445566778899aabbccddeeff";
const KEY: &str = "0f0e0d0c0b0a09080706050403020100";

// =============================================================================
// Mocks
// =============================================================================

/// Origin serving segments and ClearKey licenses
struct MediaServer {
    requests: Mutex<Vec<(RequestType, Url, Instant)>>,
    /// Status returned for segment requests
    segment_status: u16,
    /// Delay per segment, overridden for URIs containing the given marker
    delay: Duration,
    slow: Option<(&'static str, Duration)>,
    /// Segment URIs containing this marker answer 404
    failing: Option<&'static str>,
}

impl MediaServer {
    fn new() -> Arc<Self> {
        Self::with(200, None)
    }

    fn with(segment_status: u16, slow: Option<(&'static str, Duration)>) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            segment_status,
            delay: Duration::from_millis(100),
            slow,
            failing: None,
        })
    }

    fn failing(marker: &'static str) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            segment_status: 200,
            delay: Duration::from_millis(100),
            slow: None,
            failing: Some(marker),
        })
    }

    fn count(&self, request_type: RequestType) -> usize {
        self.requests.lock().iter().filter(|(t, _, _)| *t == request_type).count()
    }

    fn times(&self) -> Vec<Instant> {
        self.requests.lock().iter().map(|(_, _, at)| *at).collect()
    }
}

#[async_trait]
impl Transport for MediaServer {
    async fn send(
        &self,
        request: &Request,
        uri: &Url,
        _progress: Progress<'_>,
    ) -> Result<TransportResponse, TransportError> {
        self.requests
            .lock()
            .push((request.request_type, uri.clone(), Instant::now()));

        let (status, data) = match request.request_type {
            RequestType::License => {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let mut keys = HashMap::new();
                keys.insert(KID.to_string(), KEY.to_string());
                let license = clearkey::license_from_keys(&keys)
                    .map_err(|e| TransportError::Transfer(e.to_string()))?;
                (200, license)
            }
            _ => {
                let delay = match self.slow {
                    Some((marker, delay)) if uri.as_str().contains(marker) => delay,
                    _ => self.delay,
                };
                tokio::time::sleep(delay).await;
                let status = match self.failing {
                    Some(marker) if uri.as_str().contains(marker) => 404,
                    _ => self.segment_status,
                };
                (status, Bytes::from(vec![0u8; 64_000]))
            }
        };

        Ok(TransportResponse {
            status,
            uri: uri.clone(),
            headers: Default::default(),
            data,
        })
    }
}

/// ClearKey CDM that keeps the event senders so tests can push key statuses
#[derive(Default)]
struct StatusCdm {
    inner: ClearKeyCdm,
    senders: Mutex<Vec<CdmEventSender>>,
}

impl StatusCdm {
    fn report(&self, key_id: &str, status: KeyStatus) {
        let statuses = BTreeMap::from([(key_id.to_string(), status)]);
        for sender in self.senders.lock().iter() {
            let _ = sender.send(CdmEvent::KeyStatusesChanged(statuses.clone()));
        }
    }
}

#[async_trait]
impl Cdm for StatusCdm {
    fn supports(&self, key_system: KeySystem) -> bool {
        self.inner.supports(key_system)
    }

    async fn set_server_certificate(&self, key_system: KeySystem, certificate: &[u8]) -> sluice_core::Result<()> {
        self.inner.set_server_certificate(key_system, certificate).await
    }

    async fn create_session(
        &self,
        key_system: KeySystem,
        session_type: &str,
        events: CdmEventSender,
    ) -> sluice_core::Result<Box<dyn CdmSession>> {
        self.senders.lock().push(events.clone());
        self.inner.create_session(key_system, session_type, events).await
    }
}

fn segments(rendition: &Rendition, count: usize, duration: f64) -> Vec<SegmentReference> {
    (0..count)
        .map(|i| SegmentReference {
            start: i as f64 * duration,
            end: (i + 1) as f64 * duration,
            uris: vec![Url::parse(&format!(
                "https://cdn.example.com/{}/{}/seg-{i}.m4s",
                rendition.content_type, rendition.id
            ))
            .unwrap()],
            byte_range: None,
            bandwidth: rendition.bandwidth,
            resolution: rendition.resolution,
            rendition_id: rendition.id,
            init_segment: None,
            timestamp_offset: 0.0,
        })
        .collect()
}

/// Single-rendition video presentation of `count` two-second segments
fn vod_manifest(count: usize) -> Arc<SegmentListManifest> {
    let rendition = Rendition::new(1, 1, ContentType::Video, 1_000_000).with_resolution(1280, 720);
    let mut lists = HashMap::new();
    lists.insert(1, segments(&rendition, count, 2.0));
    let track = Track::new(1, ContentType::Video, "und").with_rendition(rendition);
    Arc::new(
        SegmentListManifest::new()
            .with_duration(count as f64 * 2.0)
            .with_track(track, lists),
    )
}

fn player(server: Arc<MediaServer>, config: PlayerConfiguration) -> Player {
    let ctx = PlayerContext::new(server, Arc::new(NullSink::new())).with_cdm(Arc::new(ClearKeyCdm::new()));
    Player::new(ctx, config).unwrap()
}

fn short_goals() -> PlayerConfiguration {
    PlayerConfiguration::merge(serde_json::json!({
        "streaming": { "bufferingGoal": 4.0, "rebufferingGoal": 2.0 }
    }))
    .unwrap()
}

async fn wait_for_state(player: &Player, wanted: PlayerState) {
    let mut rx = player.subscribe_state();
    let reached = tokio::time::timeout(Duration::from_secs(300), async {
        loop {
            if *rx.borrow_and_update() == wanted {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    })
    .await;
    assert!(reached.is_ok(), "state {wanted} not reached, still {}", player.state());
}

fn license_config() -> DrmConfiguration {
    DrmConfiguration::with_server(KeySystem::ClearKey, Url::parse("https://license.example.com/ck").unwrap())
}

fn drm_manager(server: Arc<MediaServer>, config: DrmConfiguration) -> (Arc<DrmSessionManager>, Arc<EventBus>) {
    let events = Arc::new(EventBus::new());
    let net = Arc::new(NetworkingEngine::new(server));
    let manager = DrmSessionManager::new(
        config,
        AttemptParameters::default(),
        Arc::new(ClearKeyCdm::new()),
        net,
        events.clone(),
    );
    (Arc::new(manager), events)
}

// =============================================================================
// Network Attempt Engine
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_three_server_errors_exhaust_attempts_with_backoff() {
    let server = MediaServer::with(500, None);
    let engine = NetworkingEngine::new(server.clone());
    let params = AttemptParameters {
        max_attempts: 3,
        base_delay: 1000,
        backoff_factor: 2.0,
        fuzz_factor: 0.5,
        ..Default::default()
    };
    let request = Request::new(
        RequestType::Segment,
        vec![Url::parse("https://cdn.example.com/seg-0.m4s").unwrap()],
        params,
    );

    let err = engine.attempt(request).await.unwrap_err();
    assert_eq!(err.code(), "BAD_HTTP_STATUS");
    assert_eq!(err.category(), Category::Network);
    assert_eq!(err.severity(), Severity::Fatal);

    let times = server.times();
    assert_eq!(times.len(), 3);

    // Each delay excludes the 100ms the mock spends on the previous attempt
    let delays: Vec<f64> = times
        .windows(2)
        .map(|w| w[1].duration_since(w[0]).as_secs_f64() * 1000.0 - 100.0)
        .collect();
    for (n, delay) in delays.iter().enumerate() {
        let nominal = 1000.0 * 2f64.powi(n as i32);
        assert!(
            *delay >= nominal * 0.5 - 1.0 && *delay <= nominal * 1.5 + 1.0,
            "retry {} waited {delay}ms, nominal {nominal}ms",
            n + 1
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_fatal_status_is_never_retried() {
    let server = MediaServer::with(403, None);
    let engine = NetworkingEngine::new(server.clone());
    let params = AttemptParameters {
        max_attempts: 5,
        fatal_status_codes: BTreeSet::from([403]),
        ..Default::default()
    };
    let request = Request::new(
        RequestType::Segment,
        vec![Url::parse("https://cdn.example.com/seg-0.m4s").unwrap()],
        params,
    );

    assert_err!(engine.attempt(request).await);
    assert_eq!(server.count(RequestType::Segment), 1);
}

// =============================================================================
// ABR
// =============================================================================

#[test]
fn test_sustained_two_megabits_caps_selection() {
    let abr = AbrController::new(AbrConfiguration {
        bandwidth_upgrade_target: 0.9,
        switch_interval: 0.0,
        ..Default::default()
    });
    let renditions: Vec<Arc<Rendition>> = [500_000u64, 1_000_000, 1_750_000, 2_500_000, 4_000_000]
        .iter()
        .enumerate()
        .map(|(i, bw)| Arc::new(Rendition::new(i as u32 + 1, 1, ContentType::Video, *bw)))
        .collect();
    abr.set_renditions(renditions);
    abr.choose_initial().unwrap();

    // 250 KB per second = 2 Mbps
    for _ in 0..30 {
        abr.segment_downloaded(&DownloadTrace {
            bytes: 250_000,
            elapsed_ms: 1000.0,
            request_type: RequestType::Segment,
            content_type: Some(ContentType::Video),
            partial: false,
        });
        if let Some(decision) = abr.evaluate() {
            assert!(decision.rendition.bandwidth <= 1_800_000);
            abr.commit(&decision);
        }
        assert!(abr.current().unwrap().bandwidth <= 1_800_000);
    }

    assert_eq!(abr.current().unwrap().bandwidth, 1_750_000);
    assert!(abr.switch_history().iter().all(|c| c.bandwidth <= 1_800_000));
}

// =============================================================================
// DRM
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_same_key_twice_issues_one_license_request() {
    let server = MediaServer::new();
    let mut config = license_config();
    config.enforce_single_session = true;
    let (manager, _) = drm_manager(server.clone(), config);

    let info = DrmInfo::new(KeySystem::ClearKey).with_key_id(KID);
    let init = clearkey::key_ids_init_data([&KID.to_string()]).unwrap();
    let (first, second) = tokio::join!(
        manager.encrypted(&info, init.clone()),
        manager.encrypted(&info, init.clone())
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.state(), DrmSessionState::Active);
    assert_eq!(server.count(RequestType::License), 1);
    assert_eq!(manager.license_request_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_ldl_delay_renews_exactly_once() {
    let server = MediaServer::new();
    let mut config = license_config();
    config.advanced.insert(
        KeySystem::ClearKey.name().to_string(),
        AdvancedDrmConfiguration {
            ldl_delay: 30.0,
            ..Default::default()
        },
    );
    let (manager, events) = drm_manager(server.clone(), config);
    let (_, mut rx) = events.subscribe_channel();

    let info = DrmInfo::new(KeySystem::ClearKey).with_key_id(KID);
    let init = clearkey::key_ids_init_data([&KID.to_string()]).unwrap();
    let session = manager.encrypted(&info, init).await.unwrap();
    let mut states = session.subscribe();
    assert_eq!(server.count(RequestType::License), 1);

    // Observe RENEWING on the way back to ACTIVE
    let watcher = tokio::spawn(async move {
        let mut seen = Vec::new();
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            seen.push(state);
            if state == DrmSessionState::Active {
                break;
            }
        }
        seen
    });

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(server.count(RequestType::License), 2);
    assert_eq!(session.renewals(), 1);
    assert_eq!(session.state(), DrmSessionState::Active);
    assert_eq!(
        watcher.await.unwrap(),
        vec![DrmSessionState::Renewing, DrmSessionState::Active]
    );

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(server.count(RequestType::License), 2);

    let mut renewed = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, PlayerEvent::DrmSessionRenewed { .. }) {
            renewed += 1;
        }
    }
    assert_eq!(renewed, 1);
    manager.close_all().await;
}

// =============================================================================
// Player
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_underrun_buffers_then_resumes() {
    let server = MediaServer::with(200, Some(("seg-3.", Duration::from_secs(6))));
    let player = player(server, short_goals());
    let (_, mut rx) = player.events().subscribe_channel();

    assert_ok!(player.load(vod_manifest(10), None).await);
    wait_for_state(&player, PlayerState::Playing).await;
    wait_for_state(&player, PlayerState::Buffering).await;
    wait_for_state(&player, PlayerState::Playing).await;

    let mut started = 0;
    let mut ended = None;
    while let Ok(event) = rx.try_recv() {
        match event {
            PlayerEvent::BufferingStarted { .. } => started += 1,
            PlayerEvent::BufferingEnded { duration, .. } => ended = Some(duration),
            _ => {}
        }
    }
    assert_eq!(started, 1);
    let duration = ended.expect("buffering ended");
    assert!(duration > 1.0, "buffered for {duration}s");

    let history = player.stats().state_history;
    let resumed = history.last().unwrap();
    assert_eq!(resumed.state, PlayerState::Playing);
    assert!((resumed.previous_duration - duration).abs() < 1e-6);
    assert_eq!(history[history.len() - 2].state, PlayerState::Buffering);

    player.release().await;
    assert_eq!(player.state(), PlayerState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_vod_plays_to_end() {
    let server = MediaServer::new();
    let player = player(server.clone(), short_goals());

    player.load(vod_manifest(3), None).await.unwrap();
    wait_for_state(&player, PlayerState::Ended).await;

    assert_eq!(server.count(RequestType::Segment), 3);
    let stats = player.stats();
    assert!(stats.load_latency.is_some());
    assert!((stats.position - 6.0).abs() < 0.1);
    assert_eq!(stats.stream_bandwidth, Some(1_000_000));
    assert!(stats.play_time > 5.0);
    assert!(stats.qoe.score > 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_encrypted_presentation_shares_one_session() {
    let server = MediaServer::new();
    let mut config = short_goals();
    config.drm = license_config();
    config.drm.enforce_single_session = true;
    let player = player(server.clone(), config);

    let drm = || DrmInfo::new(KeySystem::ClearKey).with_key_id(KID);
    let video = Rendition::new(1, 1, ContentType::Video, 1_000_000).with_drm_info(drm());
    let audio = Rendition::new(2, 2, ContentType::Audio, 128_000).with_drm_info(drm());
    let mut video_segments = HashMap::new();
    video_segments.insert(1, segments(&video, 5, 2.0));
    let mut audio_segments = HashMap::new();
    audio_segments.insert(2, segments(&audio, 5, 2.0));
    let manifest = SegmentListManifest::new()
        .with_duration(10.0)
        .with_track(Track::new(1, ContentType::Video, "und").with_rendition(video), video_segments)
        .with_track(Track::new(2, ContentType::Audio, "en").with_rendition(audio), audio_segments);

    player.load(Arc::new(manifest), None).await.unwrap();
    wait_for_state(&player, PlayerState::Playing).await;

    assert_eq!(server.count(RequestType::License), 1);
    let sessions = player.drm_sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].state, DrmSessionState::Active);

    player.release().await;
    assert!(player.drm_sessions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_manual_rendition_disables_abr() {
    let server = MediaServer::new();
    let player = player(server, short_goals());

    let low = Rendition::new(1, 1, ContentType::Video, 500_000);
    let high = Rendition::new(2, 1, ContentType::Video, 3_000_000);
    let mut lists = HashMap::new();
    lists.insert(1, segments(&low, 5, 2.0));
    lists.insert(2, segments(&high, 5, 2.0));
    let track = Track::new(1, ContentType::Video, "und").with_rendition(low).with_rendition(high);
    let manifest = SegmentListManifest::new().with_duration(10.0).with_track(track, lists);

    let (_, mut rx) = player.events().subscribe_channel();
    player.load(Arc::new(manifest), None).await.unwrap();
    player.select_rendition(2).unwrap();

    let stats = player.stats();
    assert_eq!(stats.stream_bandwidth, Some(3_000_000));
    let last = stats.switch_history.last().unwrap();
    assert!(!last.from_adaptation);
    assert_eq!(last.rendition_id, 2);

    let mut variant_changed = false;
    while let Ok(event) = rx.try_recv() {
        if let PlayerEvent::VariantChanged { choice } = event {
            variant_changed = choice.rendition_id == 2;
        }
    }
    assert!(variant_changed);
    assert_eq!(player.select_rendition(99).unwrap_err().code(), "NO_RENDITIONS");
}

#[tokio::test(start_paused = true)]
async fn test_new_load_replaces_session() {
    let server = MediaServer::new();
    let player = player(server, short_goals());
    let (_, mut rx) = player.events().subscribe_channel();

    let first = player.load(vod_manifest(5), None).await.unwrap();
    let second = player.load(vod_manifest(5), None).await.unwrap();
    assert_ne!(first, second);

    let mut unloaded = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let PlayerEvent::Unloading { session_id } = event {
            unloaded.push(session_id);
        }
    }
    assert_eq!(unloaded, vec![first]);
    assert_eq!(player.state(), PlayerState::Preparing);
}

#[tokio::test(start_paused = true)]
async fn test_text_failure_is_fatal_unless_ignored() {
    let manifest = || {
        let video = Rendition::new(1, 1, ContentType::Video, 1_000_000);
        let text = Rendition::new(2, 2, ContentType::Text, 1_000);
        let mut video_segments = HashMap::new();
        video_segments.insert(1, segments(&video, 3, 2.0));
        let mut text_segments = HashMap::new();
        text_segments.insert(2, segments(&text, 3, 2.0));
        Arc::new(
            SegmentListManifest::new()
                .with_duration(6.0)
                .with_track(Track::new(1, ContentType::Video, "und").with_rendition(video), video_segments)
                .with_track(Track::new(2, ContentType::Text, "en").with_rendition(text), text_segments),
        )
    };
    let config = |ignore: bool| {
        PlayerConfiguration::merge(serde_json::json!({
            "streaming": {
                "bufferingGoal": 4.0,
                "rebufferingGoal": 2.0,
                "ignoreTextStreamFailures": ignore
            },
            "preferredTextLanguage": "en"
        }))
        .unwrap()
    };

    // Text failures fail playback by default
    let strict = player(MediaServer::failing("/text/"), config(false));
    let (_, mut rx) = strict.events().subscribe_channel();
    strict.load(manifest(), None).await.unwrap();
    wait_for_state(&strict, PlayerState::Error).await;
    let mut fatal = None;
    while let Ok(event) = rx.try_recv() {
        if let PlayerEvent::Error { code, severity: Severity::Fatal, .. } = event {
            fatal = Some(code);
        }
    }
    assert_eq!(fatal.as_deref(), Some("BAD_HTTP_STATUS"));

    // With the flag set, video plays on without text
    let lenient = player(MediaServer::failing("/text/"), config(true));
    let (_, mut rx) = lenient.events().subscribe_channel();
    lenient.load(manifest(), None).await.unwrap();
    wait_for_state(&lenient, PlayerState::Ended).await;
    let mut text_failed = false;
    while let Ok(event) = rx.try_recv() {
        if let PlayerEvent::Error { code, severity, .. } = event {
            assert_eq!(severity, Severity::Recoverable, "unexpected {code}");
            text_failed |= code == "TEXT_STREAM_FAILED";
        }
    }
    assert!(text_failed);
    assert!(lenient
        .stats()
        .state_history
        .iter()
        .all(|entry| entry.state != PlayerState::Error));
}

#[tokio::test(start_paused = true)]
async fn test_fatal_error_closes_drm_sessions() {
    let server = MediaServer::failing("seg-2.");
    let mut config = short_goals();
    config.drm = license_config();
    config.drm.advanced.insert(
        KeySystem::ClearKey.name().to_string(),
        AdvancedDrmConfiguration {
            ldl_delay: 30.0,
            ..Default::default()
        },
    );
    let player = player(server.clone(), config);

    let video = Rendition::new(1, 1, ContentType::Video, 1_000_000)
        .with_drm_info(DrmInfo::new(KeySystem::ClearKey).with_key_id(KID));
    let mut lists = HashMap::new();
    lists.insert(1, segments(&video, 5, 2.0));
    let manifest = SegmentListManifest::new()
        .with_duration(10.0)
        .with_track(Track::new(1, ContentType::Video, "und").with_rendition(video), lists);

    player.load(Arc::new(manifest), None).await.unwrap();
    wait_for_state(&player, PlayerState::Error).await;
    assert_eq!(server.count(RequestType::License), 1);

    // Past the renewal delay: the timer died with the session
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(server.count(RequestType::License), 1);
    assert!(player.drm_sessions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_restricted_text_track_cannot_be_selected() {
    const TEXT_KID: &str = "ffeeddccbbaa99887766554433221100";

    let server = MediaServer::new();
    let cdm = Arc::new(StatusCdm::default());
    let mut config = short_goals();
    config.drm = license_config();
    let ctx = PlayerContext::new(server, Arc::new(NullSink::new())).with_cdm(cdm.clone());
    let player = Player::new(ctx, config).unwrap();

    let video = Rendition::new(1, 1, ContentType::Video, 1_000_000)
        .with_drm_info(DrmInfo::new(KeySystem::ClearKey).with_key_id(KID));
    let text = Rendition::new(2, 2, ContentType::Text, 1_000)
        .with_drm_info(DrmInfo::new(KeySystem::ClearKey).with_key_id(TEXT_KID));
    let mut video_segments = HashMap::new();
    video_segments.insert(1, segments(&video, 5, 2.0));
    let mut text_segments = HashMap::new();
    text_segments.insert(2, segments(&text, 5, 2.0));
    let manifest = SegmentListManifest::new()
        .with_duration(10.0)
        .with_track(Track::new(1, ContentType::Video, "und").with_rendition(video), video_segments)
        .with_track(Track::new(2, ContentType::Text, "en").with_rendition(text), text_segments);

    player.load(Arc::new(manifest), None).await.unwrap();
    wait_for_state(&player, PlayerState::Playing).await;

    cdm.report(TEXT_KID, KeyStatus::OutputRestricted);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = player.select_text_track(Some(2)).unwrap_err();
    assert_eq!(err.code(), "RESTRICTIONS_CANNOT_BE_MET");
    assert_eq!(player.state(), PlayerState::Playing);
}
