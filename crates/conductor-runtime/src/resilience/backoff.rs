//! Retry delays between task attempts.

use backon::{BackoffBuilder, ExponentialBuilder};
use std::time::Duration;

/// Exponential backoff, doubling from `base` and capped by the tier ceiling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub jitter: bool,
}

impl BackoffPolicy {
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Delay before retrying after `attempt` failed (1-based).
    pub fn delay(&self, attempt: u32, ceiling: Duration) -> Duration {
        if self.base.is_zero() || ceiling.is_zero() {
            return Duration::ZERO;
        }

        let mut builder = ExponentialBuilder::default()
            .with_min_delay(self.base)
            .with_max_delay(ceiling)
            .with_factor(2.0)
            .with_max_times(attempt.max(1) as usize);
        if self.jitter {
            builder = builder.with_jitter();
        }

        builder
            .build()
            .nth(attempt.saturating_sub(1) as usize)
            .unwrap_or(ceiling)
            .min(ceiling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_until_ceiling() {
        let policy = BackoffPolicy::new(Duration::from_millis(100));
        let ceiling = Duration::from_millis(500);
        assert_eq!(policy.delay(1, ceiling), Duration::from_millis(100));
        assert_eq!(policy.delay(2, ceiling), Duration::from_millis(200));
        assert_eq!(policy.delay(3, ceiling), Duration::from_millis(400));
        assert_eq!(policy.delay(4, ceiling), ceiling);
        assert_eq!(policy.delay(10, ceiling), ceiling);
    }

    #[test]
    fn test_jitter_stays_under_ceiling() {
        let policy = BackoffPolicy::new(Duration::from_millis(100)).with_jitter();
        let ceiling = Duration::from_millis(300);
        for attempt in 1..6 {
            assert!(policy.delay(attempt, ceiling) <= ceiling);
        }
    }

    #[test]
    fn test_zero_base_means_no_wait() {
        let policy = BackoffPolicy::new(Duration::ZERO);
        assert_eq!(policy.delay(3, Duration::from_secs(1)), Duration::ZERO);
    }
}
