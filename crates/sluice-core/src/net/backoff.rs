//! Exponential backoff with relative jitter

use crate::config::AttemptParameters;
use crate::types::saturating_secs;
use rand::Rng;
use std::time::Duration;

/// Delay schedule derived from [`AttemptParameters`]
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base_delay_ms: f64,
    backoff_factor: f64,
    fuzz_factor: f64,
}

impl Backoff {
    pub fn new(params: &AttemptParameters) -> Self {
        Self {
            base_delay_ms: params.base_delay as f64,
            backoff_factor: params.backoff_factor,
            fuzz_factor: params.fuzz_factor.clamp(0.0, 1.0),
        }
    }

    /// Un-jittered delay before attempt `attempt` (0-indexed; attempt 0 has none)
    pub fn nominal_delay_ms(&self, attempt: u32) -> f64 {
        if attempt == 0 {
            return 0.0;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        self.base_delay_ms * self.backoff_factor.powi(exponent)
    }

    /// Delay before attempt `attempt`, with jitter in `[-fuzz, +fuzz]` of the nominal value
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay_ms(attempt);
        if nominal <= 0.0 {
            return Duration::ZERO;
        }
        let fuzz = if self.fuzz_factor > 0.0 {
            rand::thread_rng().gen_range(-self.fuzz_factor..=self.fuzz_factor)
        } else {
            0.0
        };
        saturating_secs(nominal * (1.0 + fuzz) / 1000.0)
    }

    /// Inclusive bounds of [`Backoff::delay_for_attempt`]
    pub fn bounds(&self, attempt: u32) -> (Duration, Duration) {
        let nominal = self.nominal_delay_ms(attempt);
        let low = nominal * (1.0 - self.fuzz_factor);
        let high = nominal * (1.0 + self.fuzz_factor);
        (saturating_secs(low / 1000.0), saturating_secs(high / 1000.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MAX_DELAY;

    fn params(fuzz: f64) -> AttemptParameters {
        AttemptParameters {
            base_delay: 1000,
            backoff_factor: 2.0,
            fuzz_factor: fuzz,
            ..Default::default()
        }
    }

    #[test]
    fn test_first_attempt_has_no_delay() {
        let backoff = Backoff::new(&params(0.5));
        assert_eq!(backoff.delay_for_attempt(0), Duration::ZERO);
    }

    #[test]
    fn test_delay_without_fuzz_is_exponential() {
        let backoff = Backoff::new(&params(0.0));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(4000));
    }

    #[test]
    fn test_large_schedule_saturates_instead_of_overflowing() {
        let params = AttemptParameters {
            base_delay: 1000,
            backoff_factor: 10.0,
            fuzz_factor: 0.0,
            max_attempts: 30,
            ..Default::default()
        };
        let mut config = crate::config::PlayerConfiguration::default();
        config.segment_retry = params.clone();
        assert!(config.validate().is_ok());

        let backoff = Backoff::new(&params);
        assert_eq!(backoff.delay_for_attempt(24), MAX_DELAY);
        assert_eq!(backoff.delay_for_attempt(u32::MAX), MAX_DELAY);
        assert_eq!(backoff.bounds(29), (MAX_DELAY, MAX_DELAY));
        assert!(backoff.delay_for_attempt(5) < MAX_DELAY);
    }

    #[test]
    fn test_fuzzed_delay_stays_within_bounds() {
        let backoff = Backoff::new(&params(0.5));
        for attempt in 1..=4 {
            let (low, high) = backoff.bounds(attempt);
            for _ in 0..64 {
                let delay = backoff.delay_for_attempt(attempt);
                assert!(delay >= low && delay <= high, "attempt {attempt}: {delay:?}");
            }
        }
        assert_eq!(backoff.bounds(1), (Duration::from_millis(500), Duration::from_millis(1500)));
        assert_eq!(backoff.bounds(2), (Duration::from_millis(1000), Duration::from_millis(3000)));
    }
}
