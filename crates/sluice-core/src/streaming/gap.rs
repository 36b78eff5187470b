//! Gap jumping and stall detection

use crate::buffer::BufferedRanges;
use crate::config::StreamingConfiguration;
use crate::events::{EventBus, PlayerEvent};
use crate::types::saturating_secs;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Unbuffered span between the playhead and the next buffered range
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gap {
    pub start: f64,
    pub end: f64,
}

impl Gap {
    pub fn size(&self) -> f64 {
        self.end - self.start
    }
}

/// Gap the playhead is sitting in, if any
pub fn find_gap(ranges: &BufferedRanges, position: f64) -> Option<Gap> {
    if ranges.range_containing(position).is_some() {
        return None;
    }
    let next = ranges.next_range_after(position)?;
    Some(Gap {
        start: position,
        end: next.start,
    })
}

/// Decides whether the playhead jumps over gaps
#[derive(Debug)]
pub struct GapJumper {
    small_gap_limit: f64,
    jump_large_gaps: bool,
    /// End of the large gap already announced
    announced: Option<f64>,
    jumped: u32,
}

impl GapJumper {
    pub fn new(config: &StreamingConfiguration) -> Self {
        Self {
            small_gap_limit: config.small_gap_limit,
            jump_large_gaps: config.jump_large_gaps,
            announced: None,
            jumped: 0,
        }
    }

    pub fn gaps_jumped(&self) -> u32 {
        self.jumped
    }

    /// Returns the position to jump to.
    ///
    /// Small gaps are jumped silently. A large gap is announced once with a
    /// cancellable [`PlayerEvent::LargeGap`] and jumped only if
    /// `jump_large_gaps` is set and no observer prevented it.
    pub fn evaluate(&mut self, ranges: &BufferedRanges, position: f64, events: &EventBus) -> Option<f64> {
        let Some(gap) = find_gap(ranges, position) else {
            self.announced = None;
            return None;
        };

        if gap.size() <= self.small_gap_limit {
            debug!(from = gap.start, to = gap.end, "Jumping small gap");
            return Some(self.jump(gap, events));
        }

        if self.announced == Some(gap.end) {
            return None;
        }
        self.announced = Some(gap.end);

        let prevented = events.emit(PlayerEvent::LargeGap {
            position,
            gap_size: gap.size(),
        });
        if self.jump_large_gaps && !prevented {
            info!(from = gap.start, to = gap.end, size = gap.size(), "Jumping large gap");
            Some(self.jump(gap, events))
        } else {
            info!(position, size = gap.size(), prevented, "Large gap left in place");
            None
        }
    }

    fn jump(&mut self, gap: Gap, events: &EventBus) -> f64 {
        self.jumped += 1;
        events.emit(PlayerEvent::GapJumped {
            from: gap.start,
            to: gap.end,
        });
        gap.end
    }
}

/// Detects a playhead that stopped moving while it should be playing
#[derive(Debug)]
pub struct StallDetector {
    enabled: bool,
    threshold: Duration,
    skip: f64,
    last_position: Option<f64>,
    since: Option<Instant>,
    stalls: u32,
}

impl StallDetector {
    pub fn new(config: &StreamingConfiguration) -> Self {
        Self {
            enabled: config.stall_enabled,
            threshold: saturating_secs(config.stall_threshold),
            skip: config.stall_skip,
            last_position: None,
            since: None,
            stalls: 0,
        }
    }

    pub fn stalls(&self) -> u32 {
        self.stalls
    }

    pub fn reset(&mut self) {
        self.last_position = None;
        self.since = None;
    }

    /// Feed the current position; returns the skip target once stalled for `stall_threshold`.
    ///
    /// `expect_progress` is true while playing with data at the playhead.
    pub fn poll(&mut self, position: f64, expect_progress: bool, now: Instant) -> Option<f64> {
        if !self.enabled || !expect_progress {
            self.reset();
            return None;
        }

        match (self.last_position, self.since) {
            (Some(last), Some(since)) if (last - position).abs() < 1e-6 => {
                if now.duration_since(since) < self.threshold {
                    return None;
                }
                self.stalls += 1;
                self.since = Some(now);
                let skip_to = position + self.skip;
                warn!(position, skip_to, stalls = self.stalls, "Playback stalled, skipping forward");
                Some(skip_to)
            }
            _ => {
                self.last_position = Some(position);
                self.since = Some(now);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn ranges(spans: &[(f64, f64)]) -> BufferedRanges {
        let mut ranges = BufferedRanges::new();
        for (start, end) in spans {
            ranges.append(*start, *end);
        }
        ranges
    }

    #[test]
    fn test_find_gap() {
        let buffered = ranges(&[(0.0, 4.0), (6.0, 10.0)]);
        assert_eq!(find_gap(&buffered, 2.0), None);
        assert_eq!(find_gap(&buffered, 4.0), Some(Gap { start: 4.0, end: 6.0 }));
        assert_eq!(find_gap(&buffered, 10.0), None);
    }

    #[test]
    fn test_small_gap_jumped_silently() {
        let config = StreamingConfiguration::default();
        let events = EventBus::new();
        let (_, mut rx) = events.subscribe_channel();
        let mut jumper = GapJumper::new(&config);

        let buffered = ranges(&[(0.0, 4.0), (4.3, 10.0)]);
        assert_eq!(jumper.evaluate(&buffered, 4.0, &events), Some(4.3));
        assert_eq!(jumper.gaps_jumped(), 1);
        assert!(matches!(rx.try_recv(), Ok(PlayerEvent::GapJumped { .. })));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_large_gap_announced_once_and_waits() {
        let config = StreamingConfiguration::default();
        let events = EventBus::new();
        let announced = Arc::new(Mutex::new(0));
        {
            let announced = announced.clone();
            events.subscribe(move |event, _| {
                if matches!(event, PlayerEvent::LargeGap { .. }) {
                    *announced.lock() += 1;
                }
            });
        }
        let mut jumper = GapJumper::new(&config);
        let buffered = ranges(&[(0.0, 4.0), (7.0, 10.0)]);

        assert_eq!(jumper.evaluate(&buffered, 4.0, &events), None);
        assert_eq!(jumper.evaluate(&buffered, 4.0, &events), None);
        assert_eq!(*announced.lock(), 1);
    }

    #[test]
    fn test_large_gap_jump_can_be_prevented() {
        let config = StreamingConfiguration {
            jump_large_gaps: true,
            ..Default::default()
        };
        let buffered = ranges(&[(0.0, 4.0), (7.0, 10.0)]);

        let events = EventBus::new();
        let mut jumper = GapJumper::new(&config);
        assert_eq!(jumper.evaluate(&buffered, 4.0, &events), Some(7.0));

        let events = EventBus::new();
        events.subscribe(|event, control| {
            if matches!(event, PlayerEvent::LargeGap { .. }) {
                control.prevent_default();
            }
        });
        let mut jumper = GapJumper::new(&config);
        assert_eq!(jumper.evaluate(&buffered, 4.0, &events), None);
    }

    #[test]
    fn test_stall_detection() {
        let config = StreamingConfiguration {
            stall_threshold: 1.0,
            stall_skip: 0.5,
            ..Default::default()
        };
        let mut detector = StallDetector::new(&config);
        let start = Instant::now();

        assert_eq!(detector.poll(5.0, true, start), None);
        assert_eq!(detector.poll(5.0, true, start + Duration::from_millis(500)), None);
        assert_eq!(detector.poll(5.0, true, start + Duration::from_millis(1000)), Some(5.5));
        assert_eq!(detector.stalls(), 1);

        // Moving playhead or paused playback never stalls
        assert_eq!(detector.poll(6.0, true, start + Duration::from_secs(5)), None);
        assert_eq!(detector.poll(6.0, false, start + Duration::from_secs(10)), None);
        assert_eq!(detector.poll(6.0, true, start + Duration::from_secs(10)), None);
    }
}
