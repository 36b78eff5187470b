//! Streaming engine
//!
//! One pull loop per content type:
//! - Fetch while `bufferedAheadOf(playhead)` is below the buffering goal
//!   (the rebuffering goal while the player is buffering)
//! - Open DRM sessions before the first segment of an encrypted rendition
//! - Append the init segment once per rendition change
//! - Trim content further than `bufferBehind` behind the playhead
//! - Let ABR re-evaluate after each segment of the adaptive stream
//!
//! A live presentation additionally runs a manifest refresh loop.

use super::manifest::ManifestProvider;
use super::playhead::Playhead;
use super::sink::MediaSink;
use crate::abr::AbrController;
use crate::buffer::BufferModel;
use crate::config::{AttemptParameters, StreamingConfiguration};
use crate::drm::DrmSessionManager;
use crate::error::{Error, Result};
use crate::events::{EventBus, PlayerEvent, SessionSignal, SignalSender};
use crate::net::{NetworkingEngine, Request};
use crate::track::Rendition;
use crate::types::{saturating_secs, ContentType, PlayerState, SegmentReference};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SEGMENT_TOLERANCE: f64 = 1e-3;

/// Everything a streaming session works with
pub struct StreamingContext {
    pub config: StreamingConfiguration,
    pub segment_retry: AttemptParameters,
    pub manifest_retry: AttemptParameters,
    pub manifest: Arc<dyn ManifestProvider>,
    pub net: Arc<NetworkingEngine>,
    pub abr: Arc<AbrController>,
    pub drm: Option<Arc<DrmSessionManager>>,
    pub sink: Arc<dyn MediaSink>,
    pub buffer: Arc<BufferModel>,
    pub playhead: Arc<Playhead>,
    pub events: Arc<EventBus>,
    pub signals: SignalSender,
    pub state: watch::Receiver<PlayerState>,
}

/// Position of one stream loop
#[derive(Debug, Default)]
struct Cursor {
    generation: u64,
    /// End of the last appended segment
    next_time: Option<f64>,
    /// Rendition whose init segment is in the sink
    init_rendition: Option<u32>,
    /// Encrypted renditions whose sessions are open
    prepared: HashSet<u32>,
}

/// Next segment to fetch: the one after `next_time` when continuing, else
/// the one containing (or following) `position`
pub(crate) fn next_segment(
    segments: &[SegmentReference],
    position: f64,
    next_time: Option<f64>,
) -> Option<&SegmentReference> {
    match next_time {
        Some(time) => segments.iter().find(|s| s.start >= time - SEGMENT_TOLERANCE),
        None => segments
            .iter()
            .find(|s| s.contains(position))
            .or_else(|| segments.iter().find(|s| s.start >= position)),
    }
}

/// Runs the stream loops of one loaded presentation
pub struct StreamingEngine {
    ctx: StreamingContext,
    selections: Mutex<HashMap<ContentType, Arc<Rendition>>>,
    streams: Mutex<HashSet<ContentType>>,
    exhausted: Mutex<HashSet<ContentType>>,
    adaptive: ContentType,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl StreamingEngine {
    /// `adaptive` is the content type whose rendition ABR controls
    pub fn new(ctx: StreamingContext, adaptive: ContentType, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            selections: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashSet::new()),
            exhausted: Mutex::new(HashSet::new()),
            adaptive,
            tasks: Mutex::new(Vec::new()),
            cancel,
        })
    }

    pub fn adaptive_type(&self) -> ContentType {
        self.adaptive
    }

    /// Rendition streamed for a content type
    pub fn selection(&self, content_type: ContentType) -> Option<Arc<Rendition>> {
        self.selections.lock().get(&content_type).cloned()
    }

    /// Switch the rendition of a content type; the loop continues from where it is
    pub fn select(&self, content_type: ContentType, rendition: Arc<Rendition>) {
        let previous = self.selections.lock().insert(content_type, rendition.clone());
        if previous.as_ref().map(|r| r.id) != Some(rendition.id) {
            debug!(
                content_type = %content_type,
                from = ?previous.map(|r| r.id),
                to = rendition.id,
                "Stream rendition selected"
            );
        }
    }

    /// Stop streaming a content type (text track disabled)
    pub fn deselect(&self, content_type: ContentType) {
        self.selections.lock().remove(&content_type);
    }

    /// True once every started stream appended its last segment
    pub fn is_exhausted(&self) -> bool {
        let streams = self.streams.lock();
        let exhausted = self.exhausted.lock();
        !streams.is_empty()
            && streams
                .iter()
                .filter(|ct| **ct != ContentType::Text)
                .all(|ct| exhausted.contains(ct))
    }

    /// Spawn a loop for every selected content type, plus live refresh
    pub fn start(self: &Arc<Self>) {
        let content_types: Vec<ContentType> = self.selections.lock().keys().copied().collect();
        let mut tasks = self.tasks.lock();
        for content_type in content_types {
            if !self.streams.lock().insert(content_type) {
                continue;
            }
            tasks.push(tokio::spawn(Arc::clone(self).run_stream(content_type)));
        }
        if self.ctx.manifest.is_live() {
            tasks.push(tokio::spawn(Arc::clone(self).run_live_refresh()));
        }
        info!(streams = tasks.len(), live = self.ctx.manifest.is_live(), "Streaming started");
    }

    /// Start the loop of a content type selected after [`start`](Self::start)
    pub fn ensure_stream(self: &Arc<Self>, content_type: ContentType) {
        if self.selection(content_type).is_none() || !self.streams.lock().insert(content_type) {
            return;
        }
        self.tasks.lock().push(tokio::spawn(Arc::clone(self).run_stream(content_type)));
    }

    /// Cancel every loop and in-flight request of this engine
    pub fn stop(&self) {
        self.cancel.cancel();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        debug!("Streaming stopped");
    }

    fn goal(&self) -> f64 {
        match *self.ctx.state.borrow() {
            PlayerState::Buffering => self.ctx.config.rebuffering_goal,
            _ => self.ctx.config.buffering_goal,
        }
    }

    /// Wait one tick or until a seek; false once cancelled
    async fn idle(&self, seeks: &mut watch::Receiver<u64>) -> bool {
        let tick = saturating_secs(self.ctx.config.tick_interval);
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            changed = seeks.changed() => changed.is_ok(),
            _ = tokio::time::sleep(tick) => true,
        }
    }

    async fn run_stream(self: Arc<Self>, content_type: ContentType) {
        let mut seeks = self.ctx.playhead.subscribe_seeks();
        let mut cursor = Cursor {
            generation: *seeks.borrow_and_update(),
            ..Default::default()
        };
        info!(content_type = %content_type, "Stream loop started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let generation = *seeks.borrow_and_update();
            if generation != cursor.generation {
                cursor.generation = generation;
                cursor.next_time = None;
                self.exhausted.lock().remove(&content_type);
                debug!(content_type = %content_type, position = self.ctx.playhead.position(), "Stream restarting after seek");
            }

            let Some(rendition) = self.selection(content_type) else {
                if !self.idle(&mut seeks).await {
                    break;
                }
                continue;
            };

            let position = self.ctx.playhead.position();
            let ahead = self.ctx.buffer.buffered_ahead_of(content_type, position, false);
            if ahead >= self.goal() {
                if !self.idle(&mut seeks).await {
                    break;
                }
                continue;
            }

            let segments = self.ctx.manifest.segments(&rendition);
            let Some(segment) = next_segment(&segments, position, cursor.next_time).cloned() else {
                if !self.ctx.manifest.is_live() {
                    self.mark_exhausted(content_type);
                }
                if !self.idle(&mut seeks).await {
                    break;
                }
                continue;
            };

            match self.load_segment(content_type, &rendition, &segment, &mut cursor).await {
                Ok(()) => {
                    cursor.next_time = Some(segment.end);
                    self.trim(content_type, self.ctx.playhead.position()).await;
                    if content_type == self.adaptive {
                        self.adapt();
                    }
                }
                Err(err) if err.is_aborted() || self.cancel.is_cancelled() => break,
                Err(err) => {
                    if !self.on_stream_error(content_type, err) || !self.idle(&mut seeks).await {
                        break;
                    }
                }
            }
        }
        debug!(content_type = %content_type, "Stream loop stopped");
    }

    async fn load_segment(
        &self,
        content_type: ContentType,
        rendition: &Arc<Rendition>,
        segment: &SegmentReference,
        cursor: &mut Cursor,
    ) -> Result<()> {
        if rendition.is_encrypted() && !cursor.prepared.contains(&rendition.id) {
            let drm = self.ctx.drm.as_ref().ok_or_else(|| Error::KeySystemUnavailable {
                key_system: rendition
                    .drm_infos
                    .iter()
                    .map(|i| i.key_system.name())
                    .collect::<Vec<_>>()
                    .join(", "),
            })?;
            drm.prepare_rendition(rendition).await?;
            cursor.prepared.insert(rendition.id);
        }

        if let Some(init) = &segment.init_segment {
            if cursor.init_rendition != Some(rendition.id) {
                let request = Request::segment(
                    init.uris.clone(),
                    init.byte_range,
                    content_type,
                    self.ctx.segment_retry.clone(),
                );
                let response = self.ctx.net.attempt_with_token(request, &self.cancel).await?;
                self.ctx
                    .sink
                    .append(content_type, response.data, segment.timestamp_offset, None)
                    .await?;
                cursor.init_rendition = Some(rendition.id);
                debug!(content_type = %content_type, rendition_id = rendition.id, "Init segment appended");
            }
        }

        let request = Request::segment(
            segment.uris.clone(),
            segment.byte_range,
            content_type,
            self.ctx.segment_retry.clone(),
        );
        let response = self.ctx.net.attempt_with_token(request, &self.cancel).await?;
        let bytes = response.data.len();
        self.ctx
            .sink
            .append(
                content_type,
                response.data,
                segment.timestamp_offset,
                Some((segment.start, segment.end)),
            )
            .await?;
        self.ctx.buffer.append(content_type, segment.start, segment.end);
        debug!(
            content_type = %content_type,
            rendition_id = rendition.id,
            start = segment.start,
            end = segment.end,
            bytes,
            "Segment appended"
        );
        Ok(())
    }

    async fn trim(&self, content_type: ContentType, position: f64) {
        let behind = position - self.ctx.config.buffer_behind;
        let Some(start) = self.ctx.buffer.buffer_start(content_type) else {
            return;
        };
        if behind <= start {
            return;
        }
        if let Err(err) = self.ctx.sink.remove(content_type, start, behind).await {
            warn!(content_type = %content_type, error = %err, "Buffer eviction failed");
            return;
        }
        self.ctx.buffer.remove(content_type, start, behind);
        debug!(content_type = %content_type, start, end = behind, "Evicted content behind the playhead");
    }

    fn adapt(&self) {
        let Some(decision) = self.ctx.abr.evaluate() else {
            return;
        };
        let Some(choice) = self.ctx.abr.commit(&decision) else {
            return;
        };
        self.select(self.adaptive, decision.rendition.clone());
        self.ctx.events.emit(PlayerEvent::Adaptation {
            choice,
            previous_rendition_id: decision.previous.map(|r| r.id),
        });
    }

    fn mark_exhausted(&self, content_type: ContentType) {
        if !self.exhausted.lock().insert(content_type) {
            return;
        }
        debug!(content_type = %content_type, "Stream reached the end of the presentation");
        if self.is_exhausted() {
            info!("All streams exhausted");
            let _ = self.ctx.signals.send(SessionSignal::StreamsExhausted);
        }
    }

    /// Report a stream failure; returns false when the loop must stop
    fn on_stream_error(&self, content_type: ContentType, err: Error) -> bool {
        if content_type == ContentType::Text && self.ctx.config.ignore_text_stream_failures {
            let err = Error::TextStreamFailed { source: Box::new(err) };
            warn!(error = %err, "Text stream failed, continuing without text");
            self.selections.lock().remove(&ContentType::Text);
            let _ = self.ctx.signals.send(SessionSignal::Error(err));
            return false;
        }

        let recoverable = err.is_recoverable();
        if recoverable {
            warn!(content_type = %content_type, code = err.code(), error = %err, "Recoverable stream error");
        } else {
            error!(content_type = %content_type, code = err.code(), error = %err, "Stream failed");
        }
        let _ = self.ctx.signals.send(SessionSignal::Error(err));
        recoverable
    }

    async fn run_live_refresh(self: Arc<Self>) {
        let period = self
            .ctx
            .config
            .live_refresh_period
            .or_else(|| self.ctx.manifest.max_segment_duration())
            .unwrap_or(1.0)
            .max(1.0);
        info!(period, "Live refresh loop started");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(saturating_secs(period)) => {}
            }

            match self.ctx.manifest.refresh(&self.ctx.net, &self.ctx.manifest_retry).await {
                Ok(()) => {
                    self.ctx.events.emit(PlayerEvent::ManifestRefreshed {
                        live_edge: self.ctx.manifest.live_edge(),
                    });
                    if !self.ctx.manifest.is_live() {
                        info!("Presentation ended, live refresh stopped");
                        break;
                    }
                }
                Err(err) if err.is_aborted() => break,
                Err(err) => {
                    let err = Error::ManifestRefresh(err.to_string());
                    warn!(error = %err, "Live refresh failed");
                    let _ = self.ctx.signals.send(SessionSignal::Error(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn segments(count: usize, duration: f64) -> Vec<SegmentReference> {
        (0..count)
            .map(|i| SegmentReference {
                start: i as f64 * duration,
                end: (i + 1) as f64 * duration,
                uris: vec![Url::parse(&format!("https://cdn.example.com/seg-{i}.m4s")).unwrap()],
                byte_range: None,
                bandwidth: 1_000_000,
                resolution: None,
                rendition_id: 1,
                init_segment: None,
                timestamp_offset: 0.0,
            })
            .collect()
    }

    #[test]
    fn test_next_segment_from_position() {
        let list = segments(5, 4.0);
        assert_eq!(next_segment(&list, 0.0, None).unwrap().start, 0.0);
        assert_eq!(next_segment(&list, 9.5, None).unwrap().start, 8.0);
        assert!(next_segment(&list, 20.0, None).is_none());
    }

    #[test]
    fn test_next_segment_continues_after_last_append() {
        let list = segments(5, 4.0);
        assert_eq!(next_segment(&list, 1.0, Some(8.0)).unwrap().start, 8.0);
        assert_eq!(next_segment(&list, 1.0, Some(7.9995)).unwrap().start, 8.0);
        assert!(next_segment(&list, 1.0, Some(20.0)).is_none());
    }
}
