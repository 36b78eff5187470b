//! Live-edge chasing

use crate::config::StreamingConfiguration;
use tracing::{debug, info};

/// What to do about the distance to the live edge
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChaseAction {
    /// Far behind: seek straight to the edge minus `safe_seek_offset`
    Seek(f64),
    /// Speed up playback
    SetRate(f64),
    /// Close enough: back to normal speed
    RestoreRate,
    None,
}

/// Decide the chase action for a playhead `distance` seconds behind `live_edge`
pub fn chase_action(live_edge: f64, playhead: f64, config: &StreamingConfiguration) -> ChaseAction {
    if !config.enable_live_edge_chasing {
        return ChaseAction::None;
    }
    let distance = live_edge - playhead;
    if distance >= config.chase_jump_distance {
        ChaseAction::Seek((live_edge - config.safe_seek_offset).max(playhead))
    } else if distance >= config.start_chasing_at {
        ChaseAction::SetRate(config.chasing_rate)
    } else if distance <= config.stop_chasing_at {
        ChaseAction::RestoreRate
    } else {
        ChaseAction::None
    }
}

/// Tracks whether the playback rate is currently raised so rate changes are
/// only issued on transitions
#[derive(Debug, Default)]
pub struct LiveEdgeChaser {
    chasing: bool,
}

impl LiveEdgeChaser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_chasing(&self) -> bool {
        self.chasing
    }

    /// Returns the action to apply, with repeated rate changes filtered out
    pub fn update(&mut self, live_edge: f64, playhead: f64, config: &StreamingConfiguration) -> ChaseAction {
        match chase_action(live_edge, playhead, config) {
            ChaseAction::Seek(target) => {
                info!(live_edge, playhead, target, "Behind live edge, seeking");
                ChaseAction::Seek(target)
            }
            ChaseAction::SetRate(rate) if !self.chasing => {
                self.chasing = true;
                debug!(live_edge, playhead, rate, "Chasing live edge");
                ChaseAction::SetRate(rate)
            }
            ChaseAction::RestoreRate if self.chasing => {
                self.chasing = false;
                debug!(live_edge, playhead, "Caught up with live edge");
                ChaseAction::RestoreRate
            }
            _ => ChaseAction::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StreamingConfiguration {
        StreamingConfiguration {
            enable_live_edge_chasing: true,
            chase_jump_distance: 10.0,
            start_chasing_at: 4.0,
            stop_chasing_at: 1.0,
            chasing_rate: 1.25,
            safe_seek_offset: 3.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_far_behind_seeks_instead_of_speeding_up() {
        assert_eq!(chase_action(100.0, 85.0, &config()), ChaseAction::Seek(97.0));
        assert_eq!(chase_action(100.0, 90.0, &config()), ChaseAction::Seek(97.0));
    }

    #[test]
    fn test_chase_bands() {
        let config = config();
        assert_eq!(chase_action(100.0, 95.0, &config), ChaseAction::SetRate(1.25));
        assert_eq!(chase_action(100.0, 96.0, &config), ChaseAction::SetRate(1.25));
        assert_eq!(chase_action(100.0, 98.0, &config), ChaseAction::None);
        assert_eq!(chase_action(100.0, 99.5, &config), ChaseAction::RestoreRate);
    }

    #[test]
    fn test_disabled_chasing_does_nothing() {
        let config = StreamingConfiguration::default();
        assert_eq!(chase_action(100.0, 0.0, &config), ChaseAction::None);
    }

    #[test]
    fn test_chaser_reports_transitions_only() {
        let config = config();
        let mut chaser = LiveEdgeChaser::new();
        assert_eq!(chaser.update(100.0, 95.0, &config), ChaseAction::SetRate(1.25));
        assert_eq!(chaser.update(100.0, 95.5, &config), ChaseAction::None);
        assert!(chaser.is_chasing());
        assert_eq!(chaser.update(100.0, 99.5, &config), ChaseAction::RestoreRate);
        assert_eq!(chaser.update(100.0, 99.8, &config), ChaseAction::None);
    }
}
