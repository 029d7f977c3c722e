//! Reconnect policy: exponential backoff with an attempt cap

use std::time::Duration;

/// `delay(k) = base * 2^k` for attempt `k` (counted from 1); attempts
/// beyond `max_attempts` give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self { base, max_attempts }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor)
    }

    pub fn should_give_up(&self, attempt: u32) -> bool {
        attempt > self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_per_attempt() {
        let policy = ReconnectPolicy::new(Duration::from_secs(5), 5);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(20));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(160));
    }

    #[test]
    fn delay_matches_formula_for_every_allowed_attempt() {
        let policy = ReconnectPolicy::new(Duration::from_millis(250), 8);
        for k in 1..=policy.max_attempts {
            assert_eq!(policy.delay_for_attempt(k), Duration::from_millis(250) * 2u32.pow(k));
        }
    }

    #[test]
    fn gives_up_only_above_maximum() {
        let policy = ReconnectPolicy::default();
        assert!(!policy.should_give_up(5));
        assert!(policy.should_give_up(6));
    }

    #[test]
    fn huge_attempt_saturates() {
        let policy = ReconnectPolicy::new(Duration::from_secs(5), u32::MAX);
        assert_eq!(policy.delay_for_attempt(200), Duration::from_secs(5).saturating_mul(u32::MAX));
    }
}
