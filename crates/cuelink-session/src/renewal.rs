//! When to renew a session ahead of its expiry.

use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenewalPlan {
    /// Lead time before expiry at which renewal happens.
    pub window_ms: i64,
    /// Delay from now until the renewal attempt.
    pub fire_in_ms: i64,
}

impl RenewalPlan {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.fire_in_ms.max(0) as u64)
    }
}

/// `window = min(ttl * ratio, min_window)` clamped to `[0, ttl]`; renewal
/// fires at `ttl - window`. `None` when there is nothing left to schedule.
pub fn renewal_plan(ttl_ms: i64, ratio: f64, min_window_ms: i64) -> Option<RenewalPlan> {
    if ttl_ms <= 0 {
        return None;
    }
    let proportional = (ttl_ms as f64 * ratio.max(0.0)) as i64;
    let window_ms = proportional.min(min_window_ms).clamp(0, ttl_ms);
    let fire_in_ms = ttl_ms - window_ms;
    (fire_in_ms > 0).then_some(RenewalPlan {
        window_ms,
        fire_in_ms,
    })
}
