//! Backoff schedule for upload retries.

use std::time::Duration;

use rand::Rng;

/// Bounded exponential backoff with jitter.
///
/// `max_retries` counts additional attempts after the first, so an asset
/// is tried at most `max_retries + 1` times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Whether another attempt is allowed after `attempts_made` attempts.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts()
    }

    /// Upper bound of the wait before retry number `retry` (1-based):
    /// `base * 2^(retry - 1)`, capped at `max_delay`.
    pub fn ceiling(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// Jittered wait before retry number `retry`, uniform in
    /// `[ceiling / 2, ceiling]`.
    pub fn delay(&self, retry: u32) -> Duration {
        let ceiling = self.ceiling(retry);
        if ceiling.is_zero() {
            return ceiling;
        }
        let ceiling_ms = ceiling.as_millis() as u64;
        let floor_ms = ceiling_ms / 2;
        Duration::from_millis(rand::rng().random_range(floor_ms..=ceiling_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempts_are_bounded_by_retries_plus_one() {
        let policy = RetryPolicy::new(2, Duration::ZERO, Duration::ZERO);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));

        let none = RetryPolicy::new(0, Duration::ZERO, Duration::ZERO);
        assert!(!none.should_retry(1));
    }

    #[test]
    fn ceiling_doubles_then_caps() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(policy.ceiling(1), Duration::from_secs(1));
        assert_eq!(policy.ceiling(2), Duration::from_secs(2));
        assert_eq!(policy.ceiling(3), Duration::from_secs(4));
        assert_eq!(policy.ceiling(4), Duration::from_secs(5));
        assert_eq!(policy.ceiling(40), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_half_to_full_ceiling() {
        let policy = RetryPolicy::new(3, Duration::from_millis(200), Duration::from_secs(10));
        for _ in 0..100 {
            let d = policy.delay(2);
            assert!(d >= Duration::from_millis(200), "{d:?}");
            assert!(d <= Duration::from_millis(400), "{d:?}");
        }
    }

    #[test]
    fn zero_base_means_no_wait() {
        let policy = RetryPolicy::new(3, Duration::ZERO, Duration::ZERO);
        assert_eq!(policy.delay(3), Duration::ZERO);
    }
}
