//! Adaptive Bitrate (ABR) Controller
//!
//! - Bandwidth estimation from download traces (half-life weighted EWMAs)
//! - Restriction filtering with a lowest-bandwidth fallback
//! - Upgrade/downgrade targets around the current rendition
//! - Switch-interval hysteresis; decisions are evaluated, then committed
//! - Append-only switch history

use crate::config::AbrConfiguration;
use crate::net::{DownloadTrace, RequestType};
use crate::track::{filters, Rendition};
use crate::types::{ContentType, RenditionChoice};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

/// Rendition selection strategy
pub trait AbrAlgorithm: Send + Sync {
    /// Pick a rendition from `candidates` (sorted by ascending bandwidth, never empty)
    fn select<'a>(&self, candidates: &'a [Arc<Rendition>], context: &AbrContext) -> &'a Arc<Rendition>;

    /// Get algorithm name
    fn name(&self) -> &'static str;
}

/// Inputs to a selection
#[derive(Debug, Clone)]
pub struct AbrContext {
    /// Bandwidth estimate in bits per second
    pub bandwidth_estimate: f64,
    /// Bandwidth of the rendition currently streaming
    pub current_bandwidth: Option<u64>,
    pub upgrade_target: f64,
    pub downgrade_target: f64,
}

/// Throughput-based selection with an upgrade/downgrade band
#[derive(Debug, Default, Clone, Copy)]
pub struct ThroughputAlgorithm;

impl AbrAlgorithm for ThroughputAlgorithm {
    fn select<'a>(&self, candidates: &'a [Arc<Rendition>], context: &AbrContext) -> &'a Arc<Rendition> {
        let lowest = &candidates[0];
        let upgrade_limit = context.bandwidth_estimate * context.upgrade_target;
        let best_fit = candidates
            .iter()
            .filter(|r| r.bandwidth as f64 <= upgrade_limit)
            .max_by_key(|r| r.bandwidth)
            .unwrap_or(lowest);

        let Some(current_bw) = context.current_bandwidth else {
            return best_fit;
        };

        if best_fit.bandwidth > current_bw {
            return best_fit;
        }

        // Stay put while the current rendition is affordable under the downgrade target
        let downgrade_limit = context.bandwidth_estimate * context.downgrade_target;
        if current_bw as f64 <= downgrade_limit {
            if let Some(current) = candidates.iter().find(|r| r.bandwidth == current_bw) {
                return current;
            }
        }
        best_fit
    }

    fn name(&self) -> &'static str {
        "throughput"
    }
}

/// Exponentially weighted moving average with a half-life in sample weight units
#[derive(Debug, Clone)]
struct Ewma {
    alpha: f64,
    estimate: f64,
    total_weight: f64,
}

impl Ewma {
    fn new(half_life: f64) -> Self {
        Self {
            alpha: (0.5f64.ln() / half_life.max(f64::EPSILON)).exp(),
            estimate: 0.0,
            total_weight: 0.0,
        }
    }

    fn sample(&mut self, weight: f64, value: f64) {
        let adjusted_alpha = self.alpha.powf(weight);
        let next = value * (1.0 - adjusted_alpha) + adjusted_alpha * self.estimate;
        if next.is_finite() {
            self.estimate = next;
            self.total_weight += weight;
        }
    }

    fn value(&self) -> f64 {
        // Correct the bias towards the zero starting point
        let zero_factor = 1.0 - self.alpha.powf(self.total_weight);
        if zero_factor > 0.0 {
            self.estimate / zero_factor
        } else {
            0.0
        }
    }

    fn is_empty(&self) -> bool {
        self.total_weight <= 0.0
    }
}

/// Bandwidth estimator fed by download traces
///
/// The long-term estimate (`min(fast, slow)`) is fed only by full segment
/// traces. The short-term estimate also takes partial traces and can only pull
/// the combined estimate down.
#[derive(Debug, Clone)]
pub struct BandwidthEstimator {
    fast: Ewma,
    slow: Ewma,
    short_term: Ewma,
    fast_half_life: f64,
    bytes_sampled: u64,
    time_sampled_ms: f64,
    min_bytes: u64,
    min_total_time_ms: f64,
    default_estimate: f64,
}

impl BandwidthEstimator {
    pub fn new(config: &AbrConfiguration) -> Self {
        Self {
            fast: Ewma::new(config.fast_half_life),
            slow: Ewma::new(config.slow_half_life),
            short_term: Ewma::new(config.fast_half_life),
            fast_half_life: config.fast_half_life,
            bytes_sampled: 0,
            time_sampled_ms: 0.0,
            min_bytes: config.min_bytes_for_estimate,
            min_total_time_ms: config.min_total_time_ms,
            default_estimate: config.default_bandwidth_estimate as f64,
        }
    }

    /// Feed one trace; returns true if it was used
    pub fn sample(&mut self, trace: &DownloadTrace) -> bool {
        if trace.elapsed_ms <= 0.0 || trace.bytes == 0 {
            return false;
        }
        let weight = trace.elapsed_ms / 1000.0;
        let bps = trace.throughput_bps();

        if trace.partial {
            self.short_term.sample(weight, bps);
            return true;
        }
        if trace.bytes < self.min_bytes {
            return false;
        }

        self.fast.sample(weight, bps);
        self.slow.sample(weight, bps);
        self.short_term.sample(weight, bps);
        self.bytes_sampled += trace.bytes;
        self.time_sampled_ms += trace.elapsed_ms;
        true
    }

    /// Enough full traces have been seen to trust the sampled estimate
    pub fn has_good_estimate(&self) -> bool {
        self.time_sampled_ms >= self.min_total_time_ms
    }

    /// Long-term estimate in bps, or the default until it is trusted
    pub fn long_term_estimate(&self) -> f64 {
        if self.has_good_estimate() {
            self.fast.value().min(self.slow.value())
        } else {
            self.default_estimate
        }
    }

    /// Current estimate in bps
    pub fn estimate(&self) -> f64 {
        let long_term = self.long_term_estimate();
        if self.has_good_estimate() && !self.short_term.is_empty() {
            long_term.min(self.short_term.value())
        } else {
            long_term
        }
    }

    pub fn bytes_sampled(&self) -> u64 {
        self.bytes_sampled
    }

    pub fn reset_short_term(&mut self) {
        self.short_term = Ewma::new(self.fast_half_life);
    }

    pub fn set_default_estimate(&mut self, bps: f64) {
        self.default_estimate = bps;
    }
}

/// A switch proposed by [`AbrController::evaluate`], applied by [`AbrController::commit`]
#[derive(Debug, Clone)]
pub struct AbrDecision {
    pub rendition: Arc<Rendition>,
    pub previous: Option<Arc<Rendition>>,
    pub bandwidth_estimate: f64,
}

struct AbrState {
    config: AbrConfiguration,
    estimator: BandwidthEstimator,
    renditions: Vec<Arc<Rendition>>,
    current: Option<Arc<Rendition>>,
    last_switch: Option<f64>,
    startup_complete: bool,
    history: Vec<RenditionChoice>,
}

/// ABR controller for the adaptive (video, or audio-only) track
pub struct AbrController {
    state: Mutex<AbrState>,
    algorithm: Box<dyn AbrAlgorithm>,
    origin: Instant,
}

impl AbrController {
    pub fn new(config: AbrConfiguration) -> Self {
        Self::with_algorithm(config, Box::new(ThroughputAlgorithm))
    }

    pub fn with_algorithm(config: AbrConfiguration, algorithm: Box<dyn AbrAlgorithm>) -> Self {
        Self {
            state: Mutex::new(AbrState {
                estimator: BandwidthEstimator::new(&config),
                config,
                renditions: Vec::new(),
                current: None,
                last_switch: None,
                startup_complete: false,
                history: Vec::new(),
            }),
            algorithm,
            origin: Instant::now(),
        }
    }

    /// Seconds since the controller was created
    pub fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    pub fn algorithm_name(&self) -> &'static str {
        self.algorithm.name()
    }

    /// Replace the configuration; the long-term estimate is kept
    pub fn configure(&self, config: AbrConfiguration) {
        let mut state = self.state.lock();
        state.estimator.set_default_estimate(config.default_bandwidth_estimate as f64);
        state.config = config;
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().config.enabled
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state.lock().config.enabled = enabled;
    }

    /// Set the renditions ABR may choose from (already stripped of unplayable ones)
    pub fn set_renditions(&self, mut renditions: Vec<Arc<Rendition>>) {
        renditions.sort_by_key(|r| r.bandwidth);
        let mut state = self.state.lock();
        if let Some(current) = &state.current {
            if !renditions.iter().any(|r| r.id == current.id) {
                debug!(rendition_id = current.id, "Current rendition no longer playable");
            }
        }
        state.renditions = renditions;
    }

    /// Feed a download trace; non-segment and text traces are ignored
    pub fn segment_downloaded(&self, trace: &DownloadTrace) {
        if trace.request_type != RequestType::Segment || trace.content_type == Some(ContentType::Text) {
            return;
        }
        let mut state = self.state.lock();
        if state.estimator.sample(trace) && !trace.partial {
            debug!(
                bytes = trace.bytes,
                elapsed_ms = trace.elapsed_ms,
                estimate_bps = state.estimator.estimate() as u64,
                "Bandwidth sample recorded"
            );
        }
    }

    pub fn bandwidth_estimate(&self) -> f64 {
        self.state.lock().estimator.estimate()
    }

    pub fn long_term_estimate(&self) -> f64 {
        self.state.lock().estimator.long_term_estimate()
    }

    pub fn current(&self) -> Option<Arc<Rendition>> {
        self.state.lock().current.clone()
    }

    pub fn switch_history(&self) -> Vec<RenditionChoice> {
        self.state.lock().history.clone()
    }

    /// Renditions allowed by the configured restrictions, or the lowest one if none are
    pub fn candidates(&self) -> Vec<Arc<Rendition>> {
        Self::candidates_of(&self.state.lock())
    }

    fn candidates_of(state: &AbrState) -> Vec<Arc<Rendition>> {
        let allowed = filters::within_restrictions(&state.config.restrictions);
        let candidates: Vec<_> = state.renditions.iter().filter(|r| allowed(r.as_ref())).cloned().collect();
        if !candidates.is_empty() {
            return candidates;
        }
        state.renditions.first().cloned().into_iter().collect()
    }

    fn choose(&self, state: &AbrState) -> Option<Arc<Rendition>> {
        let candidates = Self::candidates_of(state);
        if candidates.is_empty() {
            return None;
        }
        let context = AbrContext {
            bandwidth_estimate: state.estimator.estimate(),
            current_bandwidth: state.current.as_ref().map(|r| r.bandwidth),
            upgrade_target: state.config.bandwidth_upgrade_target,
            downgrade_target: state.config.bandwidth_downgrade_target,
        };
        Some(self.algorithm.select(&candidates, &context).clone())
    }

    /// Pick and commit the rendition to start with
    #[instrument(skip(self))]
    pub fn choose_initial(&self) -> Option<RenditionChoice> {
        let now = self.now();
        let mut state = self.state.lock();
        let rendition = self.choose(&state)?;
        let estimate = state.estimator.estimate();
        info!(
            rendition_id = rendition.id,
            bandwidth = rendition.bandwidth,
            estimate_bps = estimate as u64,
            "Initial rendition chosen"
        );
        state.current = Some(rendition.clone());
        state.last_switch = Some(now);
        Some(Self::record(&mut state, &rendition, now, true))
    }

    /// Propose an adaptive switch without touching the hysteresis state
    pub fn evaluate(&self) -> Option<AbrDecision> {
        let now = self.now();
        let state = self.state.lock();
        if !state.config.enabled {
            return None;
        }

        let exempt = !state.startup_complete && !state.config.use_switch_interval_for_initial_switch;
        if exempt {
            if !state.estimator.has_good_estimate() {
                return None;
            }
        } else if let Some(last) = state.last_switch {
            if now - last < state.config.switch_interval {
                return None;
            }
        }

        let rendition = self.choose(&state)?;
        if state.current.as_ref().is_some_and(|c| c.id == rendition.id) {
            return None;
        }

        Some(AbrDecision {
            rendition,
            previous: state.current.clone(),
            bandwidth_estimate: state.estimator.estimate(),
        })
    }

    /// Apply a decision; returns `None` if another switch happened since it was evaluated
    pub fn commit(&self, decision: &AbrDecision) -> Option<RenditionChoice> {
        let now = self.now();
        let mut state = self.state.lock();
        let previous_id = decision.previous.as_ref().map(|r| r.id);
        if state.current.as_ref().map(|r| r.id) != previous_id {
            debug!(rendition_id = decision.rendition.id, "Discarding stale ABR decision");
            return None;
        }

        info!(
            from = ?previous_id,
            to = decision.rendition.id,
            bandwidth = decision.rendition.bandwidth,
            estimate_bps = decision.bandwidth_estimate as u64,
            "Adaptive rendition switch"
        );
        state.current = Some(decision.rendition.clone());
        state.last_switch = Some(now);
        state.startup_complete = true;
        Some(Self::record(&mut state, &decision.rendition, now, true))
    }

    /// Manual selection; recorded with `from_adaptation = false`
    pub fn select_manual(&self, rendition: Arc<Rendition>) -> RenditionChoice {
        let now = self.now();
        let mut state = self.state.lock();
        info!(rendition_id = rendition.id, bandwidth = rendition.bandwidth, "Manual rendition switch");
        state.current = Some(rendition.clone());
        Self::record(&mut state, &rendition, now, false)
    }

    /// Clear hysteresis and the short-term estimate; the long-term estimate stays
    pub fn reset_abr(&self) {
        let mut state = self.state.lock();
        state.last_switch = None;
        state.startup_complete = false;
        state.estimator.reset_short_term();
        debug!("ABR hysteresis reset");
    }

    /// Drop everything, including the long-term estimate
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.estimator = BandwidthEstimator::new(&state.config);
        state.renditions.clear();
        state.current = None;
        state.last_switch = None;
        state.startup_complete = false;
        state.history.clear();
    }

    fn record(state: &mut AbrState, rendition: &Rendition, timestamp: f64, from_adaptation: bool) -> RenditionChoice {
        let choice = RenditionChoice {
            timestamp,
            rendition_id: rendition.id,
            track_id: rendition.track_id,
            from_adaptation,
            bandwidth: rendition.bandwidth,
        };
        state.history.push(choice.clone());
        choice
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AbrRestrictions;
    use std::time::Duration;

    fn renditions(bandwidths: &[u64]) -> Vec<Arc<Rendition>> {
        bandwidths
            .iter()
            .enumerate()
            .map(|(i, bw)| {
                let height = 360 * (i as u32 + 1);
                Arc::new(Rendition::new(i as u32, 1, ContentType::Video, *bw).with_resolution(height * 16 / 9, height))
            })
            .collect()
    }

    fn trace(bps: f64, elapsed_ms: f64) -> DownloadTrace {
        DownloadTrace {
            bytes: (bps * elapsed_ms / 8000.0) as u64,
            elapsed_ms,
            request_type: RequestType::Segment,
            content_type: Some(ContentType::Video),
            partial: false,
        }
    }

    #[test]
    fn test_estimator_uses_default_until_enough_data() {
        let config = AbrConfiguration::default();
        let mut estimator = BandwidthEstimator::new(&config);
        assert_eq!(estimator.estimate(), 1_000_000.0);

        estimator.sample(&trace(4_000_000.0, 100.0));
        assert!(!estimator.has_good_estimate());
        assert_eq!(estimator.estimate(), 1_000_000.0);

        estimator.sample(&trace(4_000_000.0, 150.0));
        assert!(estimator.has_good_estimate());
        assert!((estimator.estimate() - 4_000_000.0).abs() < 1.0);
    }

    #[test]
    fn test_partial_traces_never_touch_long_term() {
        let config = AbrConfiguration::default();
        let mut estimator = BandwidthEstimator::new(&config);
        for _ in 0..5 {
            estimator.sample(&trace(3_000_000.0, 1000.0));
        }
        let long_term = estimator.long_term_estimate();

        let mut partial = trace(500_000.0, 1000.0);
        partial.partial = true;
        estimator.sample(&partial);

        assert_eq!(estimator.long_term_estimate(), long_term);
        assert!(estimator.estimate() < long_term);

        estimator.reset_short_term();
        assert_eq!(estimator.estimate(), long_term);
    }

    #[test]
    fn test_small_traces_are_ignored() {
        let config = AbrConfiguration::default();
        let mut estimator = BandwidthEstimator::new(&config);
        assert!(!estimator.sample(&trace(100_000.0, 1000.0)));
        assert_eq!(estimator.bytes_sampled(), 0);
    }

    #[test]
    fn test_throughput_selection_band() {
        let candidates = renditions(&[500_000, 1_000_000, 2_000_000, 4_000_000]);
        let algorithm = ThroughputAlgorithm;
        let mut context = AbrContext {
            bandwidth_estimate: 2_200_000.0,
            current_bandwidth: None,
            upgrade_target: 0.85,
            downgrade_target: 0.95,
        };
        assert_eq!(algorithm.select(&candidates, &context).bandwidth, 1_000_000);

        // 2 Mbps is above the upgrade limit but within the downgrade limit: keep it
        context.current_bandwidth = Some(2_000_000);
        assert_eq!(algorithm.select(&candidates, &context).bandwidth, 2_000_000);

        context.bandwidth_estimate = 2_000_000.0;
        assert_eq!(algorithm.select(&candidates, &context).bandwidth, 1_000_000);

        context.bandwidth_estimate = 100_000.0;
        assert_eq!(algorithm.select(&candidates, &context).bandwidth, 500_000);
    }

    #[test]
    fn test_restrictions_fall_back_to_lowest() {
        let controller = AbrController::new(AbrConfiguration {
            restrictions: AbrRestrictions {
                min_bandwidth: 10_000_000,
                ..Default::default()
            },
            ..Default::default()
        });
        controller.set_renditions(renditions(&[2_000_000, 500_000, 1_000_000]));

        let candidates = controller.candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].bandwidth, 500_000);
    }

    #[test]
    fn test_restrictions_filter_by_height() {
        let controller = AbrController::new(AbrConfiguration {
            restrictions: AbrRestrictions {
                max_height: 720,
                ..Default::default()
            },
            ..Default::default()
        });
        controller.set_renditions(renditions(&[500_000, 1_000_000, 2_000_000]));
        let heights: Vec<u32> = controller
            .candidates()
            .iter()
            .filter_map(|r| r.resolution.map(|res| res.height))
            .collect();
        assert_eq!(heights, vec![360, 720]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_switch_is_immediate_then_interval_applies() {
        let controller = AbrController::new(AbrConfiguration::default());
        controller.set_renditions(renditions(&[500_000, 1_000_000, 2_000_000, 4_000_000]));

        let initial = controller.choose_initial().unwrap();
        assert_eq!(initial.bandwidth, 500_000);

        for _ in 0..3 {
            controller.segment_downloaded(&trace(2_500_000.0, 1000.0));
        }
        let first = controller.evaluate().unwrap();
        assert_eq!(first.rendition.bandwidth, 2_000_000);
        controller.commit(&first).unwrap();

        for _ in 0..20 {
            controller.segment_downloaded(&trace(6_000_000.0, 1000.0));
        }
        assert!(controller.evaluate().is_none());

        tokio::time::advance(Duration::from_secs(8)).await;
        let second = controller.evaluate().unwrap();
        assert_eq!(second.rendition.bandwidth, 4_000_000);
        controller.commit(&second).unwrap();

        let history = controller.switch_history();
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|c| c.from_adaptation));
        assert!(history[2].timestamp - history[1].timestamp >= 8.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_switch_can_honour_interval() {
        let controller = AbrController::new(AbrConfiguration {
            use_switch_interval_for_initial_switch: true,
            ..Default::default()
        });
        controller.set_renditions(renditions(&[500_000, 2_000_000]));
        controller.choose_initial().unwrap();
        for _ in 0..3 {
            controller.segment_downloaded(&trace(5_000_000.0, 1000.0));
        }
        assert!(controller.evaluate().is_none());

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(controller.evaluate().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evaluate_does_not_mutate_until_commit() {
        let controller = AbrController::new(AbrConfiguration::default());
        controller.set_renditions(renditions(&[500_000, 2_000_000]));
        controller.choose_initial().unwrap();
        for _ in 0..3 {
            controller.segment_downloaded(&trace(5_000_000.0, 1000.0));
        }

        let a = controller.evaluate().unwrap();
        let b = controller.evaluate().unwrap();
        assert_eq!(a.rendition.id, b.rendition.id);
        assert_eq!(controller.current().unwrap().bandwidth, 500_000);
        assert_eq!(controller.switch_history().len(), 1);

        controller.commit(&a).unwrap();
        // b was evaluated against the old rendition
        assert!(controller.commit(&b).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_abr_keeps_long_term_estimate() {
        let controller = AbrController::new(AbrConfiguration::default());
        controller.set_renditions(renditions(&[500_000, 2_000_000]));
        for _ in 0..5 {
            controller.segment_downloaded(&trace(3_000_000.0, 1000.0));
        }
        let long_term = controller.long_term_estimate();

        controller.reset_abr();
        assert_eq!(controller.long_term_estimate(), long_term);

        controller.reset();
        assert_eq!(controller.long_term_estimate(), 1_000_000.0);
    }

    #[test]
    fn test_manual_selection_is_not_adaptive() {
        let controller = AbrController::new(AbrConfiguration::default());
        let all = renditions(&[500_000, 2_000_000]);
        controller.set_renditions(all.clone());

        let choice = controller.select_manual(all[1].clone());
        assert!(!choice.from_adaptation);
        assert_eq!(controller.current().unwrap().id, all[1].id);
    }

    #[test]
    fn test_license_traces_are_ignored() {
        let controller = AbrController::new(AbrConfiguration::default());
        let mut license = trace(50_000_000.0, 1000.0);
        license.request_type = RequestType::License;
        controller.segment_downloaded(&license);
        assert_eq!(controller.bandwidth_estimate(), 1_000_000.0);
    }
}
