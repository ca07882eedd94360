//! Retry policy with exponential backoff and jitter.
//!
//! Only transient failure kinds are retried; the delay grows as
//! `base * 2^attempt`, capped, with full jitter to avoid thundering herds.

use crate::errors::FailureKind;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry behavior for one stage.
///
/// The constants here are configuration, not invariants: per-stage overrides
/// in the pipeline description replace any of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Base delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Cap applied to the computed delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Whether to apply full jitter to the computed delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 200,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Creates the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum retry count.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Disables jitter. Deterministic delays are mainly useful in tests.
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Total attempts allowed, including the first.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Decides whether a task that has made `attempts_made` attempts and
    /// failed with `kind` should be re-enqueued.
    #[must_use]
    pub fn should_retry(&self, kind: FailureKind, attempts_made: u32) -> bool {
        kind.is_retryable() && attempts_made < self.max_attempts()
    }

    /// Computes the backoff delay before retry number `attempt`
    /// (1 for the first retry).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let raw = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let capped = raw.min(self.max_delay_ms);

        let delayed = if self.jitter && capped > 0 {
            rand::thread_rng().gen_range(0..=capped)
        } else {
            capped
        };

        Duration::from_millis(delayed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_allows_three_attempts() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.max_attempts(), 3);
    }

    #[test]
    fn should_retry_respects_kind() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(FailureKind::Transient, 1));
        assert!(policy.should_retry(FailureKind::Timeout, 2));
        assert!(!policy.should_retry(FailureKind::Validation, 1));
        assert!(!policy.should_retry(FailureKind::Cancelled, 1));
        assert!(!policy.should_retry(FailureKind::CircuitOpen, 1));
    }

    #[test]
    fn should_retry_respects_budget() {
        let policy = RetryPolicy::new().with_max_retries(2);
        assert!(policy.should_retry(FailureKind::Transient, 1));
        assert!(policy.should_retry(FailureKind::Transient, 2));
        assert!(!policy.should_retry(FailureKind::Transient, 3));
    }

    #[test]
    fn delay_doubles_without_jitter() {
        let policy = RetryPolicy::new()
            .with_base_delay_ms(100)
            .without_jitter();

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy::new()
            .with_base_delay_ms(1000)
            .with_max_delay_ms(5000)
            .without_jitter();

        assert_eq!(policy.delay_for(12), Duration::from_millis(5000));
    }

    #[test]
    fn jittered_delay_stays_under_cap() {
        let policy = RetryPolicy::new()
            .with_base_delay_ms(100)
            .with_max_delay_ms(100);

        for attempt in 1..8 {
            assert!(policy.delay_for(attempt) <= Duration::from_millis(100));
        }
    }
}
