//! Exponential back-off with a cap (grounded on
//! `original_source/lb/code/src/backoffs.c`)
//!
//! Shared by the server loop's adaptive poll back-off (spec §4.10 step 5)
//! and the steal rate limiter's post-failure back-off (spec §4.8).

use std::time::Duration;

/// A doubling-with-cap back-off schedule. Call `record_failure`/`record_success`
/// after each poll attempt and `current_delay` to find out how long to sleep.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    multiplier: u32,
    consecutive_failures: u32,
}

impl Backoff {
    /// A new schedule starting at `base`, doubling (or scaling by
    /// `multiplier`) on each consecutive failure, capped at `cap`.
    pub fn new(base: Duration, cap: Duration, multiplier: u32) -> Self {
        Backoff { base, cap, multiplier: multiplier.max(2), consecutive_failures: 0 }
    }

    /// The default schedule used by the adaptive server-loop poll:
    /// 1ms base, doubling, capped at 100ms.
    pub fn default_poll() -> Self {
        Backoff::new(Duration::from_millis(1), Duration::from_millis(100), 2)
    }

    /// Record a failed (empty) poll, advancing the back-off.
    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
    }

    /// Record a successful poll. Per spec §4.10: "any success resets half
    /// the counter", not the whole counter, so a single lucky poll amid a
    /// genuinely idle stretch doesn't reset back to the tightest spin.
    pub fn record_success(&mut self) {
        self.consecutive_failures /= 2;
    }

    /// The delay to sleep for given the current failure streak.
    pub fn current_delay(&self) -> Duration {
        if self.consecutive_failures == 0 {
            return Duration::ZERO;
        }
        let scale = self.multiplier.saturating_pow(self.consecutive_failures.min(20));
        let delay = self.base.saturating_mul(scale);
        delay.min(self.cap)
    }

    /// Current consecutive-failure count, exposed for tests/metrics.
    pub fn streak(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_then_caps() {
        let mut b = Backoff::new(Duration::from_millis(1), Duration::from_millis(8), 2);
        assert_eq!(b.current_delay(), Duration::ZERO);
        for _ in 0..10 {
            b.record_failure();
        }
        assert_eq!(b.current_delay(), Duration::from_millis(8));
    }

    #[test]
    fn success_halves_not_resets() {
        let mut b = Backoff::new(Duration::from_millis(1), Duration::from_secs(1), 2);
        for _ in 0..6 {
            b.record_failure();
        }
        let streak_before = b.streak();
        b.record_success();
        assert_eq!(b.streak(), streak_before / 2);
    }
}
