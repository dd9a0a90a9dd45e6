//! Retry bookkeeping with capped exponential backoff.
//!
//! Failed operations are never retried inline. The policy decides whether
//! an operation gets another attempt and when it becomes eligible again;
//! the queue holds it until then.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::queue::QueuedOperation;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts.
    pub max_retries: u32,
    /// Retry `n` waits `backoff_base^n` seconds.
    pub backoff_base: f64,
    /// Maximum delay (cap for exponential growth).
    pub max_delay: Duration,
}

/// What to do with an operation whose handler just failed.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Put it back, not eligible before `not_before`.
    Retry {
        attempt: u32,
        delay: Duration,
        not_before: DateTime<Utc>,
    },
    /// Retries are used up; drop and report.
    Exhausted,
}

impl RetryPolicy {
    /// Create a new retry policy.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff_base: 2.0,
            max_delay: Duration::from_secs(300),
        }
    }

    /// Set backoff base.
    pub fn with_backoff_base(mut self, base: f64) -> Self {
        self.backoff_base = base;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Calculate delay before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let secs = self.backoff_base.powi(attempt as i32);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }

    /// Record a failure on `op` and decide its fate.
    ///
    /// `retry_count` is only incremented when another attempt is granted,
    /// so it never exceeds `max_retries`.
    pub fn on_failure(&self, op: &mut QueuedOperation, now: DateTime<Utc>) -> RetryDecision {
        let limit = op.max_retries.min(self.max_retries);
        if op.retry_count >= limit {
            return RetryDecision::Exhausted;
        }

        op.retry_count += 1;
        let delay = self.delay_for_attempt(op.retry_count);
        let not_before = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(now);
        op.not_before = Some(not_before);

        RetryDecision::Retry {
            attempt: op.retry_count,
            delay,
            not_before,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::OperationKind;
    use edgesync_common::Priority;

    fn op(max_retries: u32) -> QueuedOperation {
        QueuedOperation::new(
            OperationKind::TelemetryUpload,
            serde_json::Value::Null,
            Priority::Normal,
            max_retries,
        )
    }

    #[test]
    fn test_delay_calculation() {
        let policy = RetryPolicy::new(3).with_backoff_base(2.0);

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = RetryPolicy::new(10)
            .with_backoff_base(10.0)
            .with_max_delay(Duration::from_secs(10));

        // 10^5 seconds, capped at 10
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(10));
    }

    #[test]
    fn test_zero_cap_means_immediate() {
        let policy = RetryPolicy::new(3).with_max_delay(Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(2), Duration::ZERO);
    }

    #[test]
    fn test_retry_count_never_exceeds_max() {
        let policy = RetryPolicy::new(3).with_max_delay(Duration::ZERO);
        let mut op = op(3);
        let now = Utc::now();

        let mut retries = 0;
        while let RetryDecision::Retry { attempt, .. } = policy.on_failure(&mut op, now) {
            retries += 1;
            assert_eq!(attempt, retries);
            assert!(op.retry_count <= op.max_retries);
        }

        assert_eq!(retries, 3);
        assert_eq!(op.retry_count, 3);
        assert_eq!(policy.on_failure(&mut op, now), RetryDecision::Exhausted);
    }

    #[test]
    fn test_sets_not_before() {
        let policy = RetryPolicy::new(3).with_backoff_base(2.0);
        let mut op = op(3);
        let now = Utc::now();

        match policy.on_failure(&mut op, now) {
            RetryDecision::Retry { not_before, delay, .. } => {
                assert_eq!(delay, Duration::from_secs(2));
                assert_eq!(not_before, now + chrono::Duration::seconds(2));
                assert_eq!(op.not_before, Some(not_before));
            }
            RetryDecision::Exhausted => panic!("expected a retry"),
        }
    }

    #[test]
    fn test_operation_limit_is_respected() {
        let policy = RetryPolicy::new(5);
        let mut op = op(0);
        assert_eq!(policy.on_failure(&mut op, Utc::now()), RetryDecision::Exhausted);
    }
}
