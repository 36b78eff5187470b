//! Playback statistics
//!
//! Captures what QoE reporting needs:
//! - Bandwidth estimates and the streamed rendition
//! - Switch and state history
//! - Buffering, stall and gap counters
//! - DRM license timing

use crate::drm::DrmSessionInfo;
use crate::types::{PlayerState, RenditionChoice, Resolution, StateHistoryEntry};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// QoE (Quality of Experience) calculator
#[derive(Debug, Default)]
pub struct QoeCalculator {
    initial_buffer_time: f64,
    rebuffer_count: u32,
    rebuffer_duration: f64,
    quality_switches: u32,
    /// (seconds, bandwidth)
    bitrate_samples: Vec<(f64, u64)>,
}

impl QoeCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill the calculator from a state history and a switch history
    pub fn from_history(states: &[StateHistoryEntry], switches: &[RenditionChoice], now: f64) -> Self {
        let mut calc = Self::new();

        // Each entry carries the duration of the state before it
        let mut started = false;
        for pair in states.windows(2) {
            let (entered, left) = (&pair[0], &pair[1]);
            match entered.state {
                PlayerState::Preparing if !started => calc.record_initial_buffer(left.previous_duration),
                PlayerState::Buffering if started => calc.record_rebuffer(left.previous_duration),
                PlayerState::Playing => started = true,
                _ => {}
            }
        }

        for pair in switches.windows(2) {
            calc.record_bitrate(pair[1].timestamp - pair[0].timestamp, pair[0].bandwidth);
        }
        if let Some(last) = switches.last() {
            calc.record_bitrate((now - last.timestamp).max(0.0), last.bandwidth);
        }
        for _ in switches.iter().skip(1).filter(|c| c.from_adaptation) {
            calc.record_quality_switch();
        }
        calc
    }

    pub fn record_initial_buffer(&mut self, duration: f64) {
        self.initial_buffer_time = duration;
    }

    pub fn record_rebuffer(&mut self, duration: f64) {
        self.rebuffer_count += 1;
        self.rebuffer_duration += duration;
    }

    pub fn record_quality_switch(&mut self) {
        self.quality_switches += 1;
    }

    pub fn record_bitrate(&mut self, duration: f64, bitrate: u64) {
        self.bitrate_samples.push((duration, bitrate));
    }

    /// QoE score (0-100)
    pub fn calculate_qoe(&self) -> f64 {
        let mut score = 100.0;

        // Startup beyond 2s costs 5 points per second
        if self.initial_buffer_time > 2.0 {
            score -= (self.initial_buffer_time - 2.0) * 5.0;
        }

        score -= self.rebuffer_count as f64 * 10.0;
        score -= self.rebuffer_duration * 5.0;
        score -= self.quality_switches as f64 * 2.0;

        let avg_bitrate = self.average_bitrate();
        if avg_bitrate > 5_000_000 {
            score += 5.0;
        } else if avg_bitrate > 2_000_000 {
            score += 2.0;
        }

        score.clamp(0.0, 100.0)
    }

    /// Time-weighted average bitrate
    fn average_bitrate(&self) -> u64 {
        let total_duration: f64 = self.bitrate_samples.iter().map(|(d, _)| d).sum();
        if total_duration <= 0.0 {
            return 0;
        }
        let weighted_sum: f64 = self.bitrate_samples.iter().map(|(d, b)| d * *b as f64).sum();
        (weighted_sum / total_duration) as u64
    }

    pub fn breakdown(&self) -> QoeBreakdown {
        QoeBreakdown {
            score: self.calculate_qoe(),
            initial_buffer_time: self.initial_buffer_time,
            rebuffer_count: self.rebuffer_count,
            rebuffer_duration: self.rebuffer_duration,
            quality_switches: self.quality_switches,
            average_bitrate: self.average_bitrate(),
        }
    }
}

/// QoE score breakdown
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QoeBreakdown {
    pub score: f64,
    pub initial_buffer_time: f64,
    pub rebuffer_count: u32,
    pub rebuffer_duration: f64,
    pub quality_switches: u32,
    pub average_bitrate: u64,
}

/// Snapshot returned by `Player::stats`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerStats {
    /// Current bandwidth estimate (bps)
    pub estimated_bandwidth: f64,
    /// Long-term estimate, full downloads only (bps)
    pub long_term_bandwidth: f64,
    /// Bandwidth of the adaptive rendition being streamed
    pub stream_bandwidth: Option<u64>,
    pub resolution: Option<Resolution>,
    pub position: f64,
    /// Seconds buffered ahead of the playhead
    pub buffered_ahead: f64,
    /// Seconds from `load` to the first `Playing`
    pub load_latency: Option<f64>,
    pub play_time: f64,
    pub pause_time: f64,
    pub buffering_time: f64,
    pub stall_count: u32,
    pub gaps_jumped: u32,
    /// Total license request time across sessions (ms)
    pub license_time_ms: f64,
    pub drm_sessions: Vec<DrmSessionInfo>,
    pub switch_history: Vec<RenditionChoice>,
    pub state_history: Vec<StateHistoryEntry>,
    pub time_in_states: HashMap<PlayerState, f64>,
    pub qoe: QoeBreakdown,
}

impl PlayerStats {
    /// Derive the per-state totals and the QoE breakdown from the histories
    pub fn finish(mut self, now: f64) -> Self {
        let time = |state| self.time_in_states.get(&state).copied().unwrap_or(0.0);
        self.play_time = time(PlayerState::Playing);
        self.pause_time = time(PlayerState::Paused);
        self.buffering_time = time(PlayerState::Buffering);
        self.license_time_ms = self.drm_sessions.iter().map(|s| s.license_time_ms).sum();
        self.qoe = QoeCalculator::from_history(&self.state_history, &self.switch_history, now).breakdown();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(state: PlayerState, previous_duration: f64) -> StateHistoryEntry {
        StateHistoryEntry {
            state,
            timestamp: Utc::now(),
            previous_duration,
        }
    }

    fn choice(timestamp: f64, bandwidth: u64, from_adaptation: bool) -> RenditionChoice {
        RenditionChoice {
            timestamp,
            rendition_id: 1,
            track_id: 1,
            from_adaptation,
            bandwidth,
        }
    }

    #[test]
    fn test_qoe_perfect() {
        let calc = QoeCalculator::new();
        assert_eq!(calc.calculate_qoe(), 100.0);
    }

    #[test]
    fn test_qoe_with_rebuffers() {
        let mut calc = QoeCalculator::new();
        calc.record_rebuffer(1.0);
        calc.record_rebuffer(2.0);

        // 100 - 2*10 - 3*5 = 65
        assert!((calc.calculate_qoe() - 65.0).abs() < 0.1);
    }

    #[test]
    fn test_qoe_from_history() {
        let states = vec![
            entry(PlayerState::Idle, 0.0),
            entry(PlayerState::Preparing, 0.5),
            entry(PlayerState::Playing, 4.0),
            entry(PlayerState::Buffering, 10.0),
            entry(PlayerState::Playing, 1.5),
        ];
        let switches = vec![choice(0.0, 1_000_000, true), choice(6.0, 3_000_000, true)];

        let calc = QoeCalculator::from_history(&states, &switches, 12.0);
        let breakdown = calc.breakdown();
        assert_eq!(breakdown.initial_buffer_time, 4.0);
        assert_eq!(breakdown.rebuffer_count, 1);
        assert_eq!(breakdown.rebuffer_duration, 1.5);
        assert_eq!(breakdown.quality_switches, 1);
        assert_eq!(breakdown.average_bitrate, 2_000_000);
    }

    #[test]
    fn test_manual_switches_not_counted() {
        let switches = vec![
            choice(0.0, 1_000_000, true),
            choice(2.0, 3_000_000, false),
            choice(4.0, 2_000_000, true),
            choice(6.0, 1_000_000, true),
        ];
        let calc = QoeCalculator::from_history(&[], &switches, 8.0);
        assert_eq!(calc.breakdown().quality_switches, 2);
    }

    #[test]
    fn test_stats_totals() {
        let mut stats = PlayerStats::default();
        stats.time_in_states.insert(PlayerState::Playing, 20.0);
        stats.time_in_states.insert(PlayerState::Buffering, 2.0);
        let stats = stats.finish(0.0);
        assert_eq!(stats.play_time, 20.0);
        assert_eq!(stats.buffering_time, 2.0);
        assert_eq!(stats.pause_time, 0.0);
        assert_eq!(stats.qoe.score, 100.0);
    }
}
