//! Per-provider retry policy: bounded attempts with exponential backoff,
//! composed outside the call sites that use it.

use std::time::Duration;

/// Finite-state retry schedule. `delay_after(attempt)` yields the backoff
/// to sleep after a failed attempt (0-based), or `None` once the policy
/// is exhausted and the caller should fall through to the next provider.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Backoff after the given failed attempt, capped at `max_delay`.
    /// Returns `None` when no attempts remain.
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt + 1 >= self.max_attempts {
            return None;
        }
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(16));
        Some(exp.min(self.max_delay))
    }
}

impl Default for RetryPolicy {
    /// 3 attempts, 500ms base, capped at 8s.
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500), Duration::from_secs(8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule_doubles() {
        let policy = RetryPolicy::new(4, Duration::from_millis(500), Duration::from_secs(8));
        assert_eq!(policy.delay_after(0), Some(Duration::from_millis(500)));
        assert_eq!(policy.delay_after(1), Some(Duration::from_millis(1000)));
        assert_eq!(policy.delay_after(2), Some(Duration::from_millis(2000)));
        assert_eq!(policy.delay_after(3), None);
    }

    #[test]
    fn test_backoff_capped_at_max() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1), Duration::from_secs(4));
        assert_eq!(policy.delay_after(5), Some(Duration::from_secs(4)));
    }

    #[test]
    fn test_single_attempt_never_sleeps() {
        let policy = RetryPolicy::new(1, Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(policy.delay_after(0), None);
    }
}
