use std::time::Duration;

use rand::Rng;

/// Exponential backoff for socket reconnection.
#[derive(Clone, Debug, PartialEq)]
pub struct ReconnectPolicy {
    /// Reconnects attempted before giving up for good.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Symmetric jitter as a fraction of the backoff delay.
    pub jitter_ratio: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_ratio: 0.2,
        }
    }
}

impl ReconnectPolicy {
    /// `min(max_delay, base_delay * 2^attempt)` in milliseconds, before jitter.
    pub fn backoff_ms(&self, attempt: u32) -> f64 {
        let exp = self.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt.min(63) as i32);
        exp.min(self.max_delay.as_millis() as f64)
    }

    /// Delay with the jitter offset chosen by `unit`, a sample in `[-1, 1]`.
    pub fn delay_with(&self, attempt: u32, unit: f64) -> Duration {
        let capped = self.backoff_ms(attempt);
        let jitter = capped * self.jitter_ratio * unit.clamp(-1.0, 1.0);
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }

    /// Delay before reconnect number `attempt + 1`, with random jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let unit = if self.jitter_ratio > 0.0 {
            rand::thread_rng().gen_range(-1.0..=1.0)
        } else {
            0.0
        };
        self.delay_with(attempt, unit)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn no_jitter() -> ReconnectPolicy {
        ReconnectPolicy {
            jitter_ratio: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn defaults() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
        assert!((policy.jitter_ratio - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn exponential_backoff() {
        let policy = no_jitter();
        assert_eq!(policy.delay_for(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(16000));
    }

    #[test]
    fn capped_at_max() {
        let policy = no_jitter();
        assert_eq!(policy.delay_for(5), Duration::from_secs(30));
        assert_eq!(policy.delay_for(200), Duration::from_secs(30));
    }

    #[test]
    fn jitter_extremes() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_with(0, -1.0), Duration::from_millis(800));
        assert_eq!(policy.delay_with(0, 1.0), Duration::from_millis(1200));
        assert_eq!(policy.delay_with(10, 5.0), Duration::from_millis(36000));
    }

    #[test]
    fn exhaustion() {
        let policy = ReconnectPolicy::default();
        assert!(!policy.exhausted(4));
        assert!(policy.exhausted(5));
    }

    proptest! {
        #[test]
        fn delay_stays_within_jitter_band(attempt in 0u32..40, ratio in 0.0f64..1.0) {
            let policy = ReconnectPolicy { jitter_ratio: ratio, ..Default::default() };
            let capped = policy.backoff_ms(attempt);
            let ms = policy.delay_for(attempt).as_millis() as f64;
            prop_assert!(ms >= (capped * (1.0 - ratio)).floor() - 1.0);
            prop_assert!(ms <= (capped * (1.0 + ratio)).ceil());
        }

        #[test]
        fn backoff_is_monotonic(attempt in 0u32..60) {
            let policy = ReconnectPolicy::default();
            prop_assert!(policy.backoff_ms(attempt + 1) >= policy.backoff_ms(attempt));
        }
    }
}
