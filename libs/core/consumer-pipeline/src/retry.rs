//! Retry policy and backoff schedule
//!
//! Retries are re-publications of the message with an incremented
//! `retry-count`, so the schedule only needs to answer two questions:
//! is another attempt allowed, and how long to wait before it.

use serde::Deserialize;
use std::time::Duration;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Wait before retry number `attempt` (1-based).
///
/// Exponential mode doubles from `base_delay` (`base * 2^(attempt-1)`),
/// otherwise the delay is constant. `attempt` 0 is treated as 1.
pub fn delay_for(attempt: u32, base_delay: Duration, exponential: bool) -> Duration {
    if !exponential {
        return base_delay;
    }

    let exponent = attempt.max(1) - 1;
    let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
    base_delay.saturating_mul(factor)
}

/// Retry configuration (`retry.*`)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Republications allowed before dead-lettering
    pub max_retries: u32,

    /// Base delay in milliseconds
    #[serde(rename = "retryDelay")]
    pub retry_delay_ms: u64,

    /// Double the delay on every attempt
    #[serde(rename = "exponentialBackoff")]
    pub exponential: bool,

    /// Optional cap on a single delay in milliseconds
    #[serde(rename = "maxDelay")]
    pub max_delay_ms: Option<u64>,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = delay.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    pub fn with_exponential_backoff(mut self, exponential: bool) -> Self {
        self.exponential = exponential;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay_ms = Some(max_delay.as_millis().try_into().unwrap_or(u64::MAX));
        self
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Whether a message that has already been retried `retry_count` times may be retried again
    pub fn allows_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Delay before retry number `attempt`, honouring `max_delay_ms`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = delay_for(attempt, self.base_delay(), self.exponential);
        match self.max_delay_ms {
            Some(cap) => delay.min(Duration::from_millis(cap)),
            None => delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            exponential: true,
            max_delay_ms: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_schedule() {
        let base = Duration::from_millis(1000);
        assert_eq!(delay_for(1, base, true), Duration::from_millis(1000));
        assert_eq!(delay_for(2, base, true), Duration::from_millis(2000));
        assert_eq!(delay_for(3, base, true), Duration::from_millis(4000));
        assert_eq!(delay_for(4, base, true), Duration::from_millis(8000));
    }

    #[test]
    fn test_constant_schedule() {
        let base = Duration::from_millis(250);
        for attempt in 1..20 {
            assert_eq!(delay_for(attempt, base, false), base);
        }
    }

    #[test]
    fn test_exponential_is_monotonic_and_saturates() {
        let base = Duration::from_millis(500);
        let mut previous = Duration::ZERO;
        for attempt in 1..200 {
            let delay = delay_for(attempt, base, true);
            assert!(delay >= previous, "attempt {attempt} shrank");
            previous = delay;
        }
    }

    #[test]
    fn test_attempt_zero_behaves_like_first_attempt() {
        let base = Duration::from_millis(100);
        assert_eq!(delay_for(0, base, true), base);
    }

    #[test]
    fn test_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.base_delay(), Duration::from_secs(1));
        assert!(policy.exponential);
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
    }

    #[test]
    fn test_max_delay_caps_schedule() {
        let policy = RetryPolicy::new(10)
            .with_retry_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5));

        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for(9), Duration::from_secs(5));
    }

    #[test]
    fn test_zero_max_retries_never_retries() {
        assert!(!RetryPolicy::new(0).allows_retry(0));
    }
}
