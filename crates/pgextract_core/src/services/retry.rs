//! Retry and reconnect policies.
//!
//! Backoff is exponential: `initial * 2^(attempt - 1)`, capped at `max_delay`.

use std::future::Future;
use std::time::Duration;

use crate::error::Result;

/// How often and how patiently an operation is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Policy for whole export attempts.
    pub fn export(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }

    /// Policy for re-establishing a dead connection before an export starts.
    ///
    /// Shorter waits than [`RetryPolicy::export`].
    pub fn reconnect() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }

    /// Policy that never waits (tests and single-shot operations).
    pub fn immediate(max_attempts: u32) -> Self {
        Self { max_attempts: max_attempts.max(1), initial_delay: Duration::ZERO, max_delay: Duration::ZERO }
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_delay.saturating_mul(1 << exponent).min(self.max_delay)
    }

    /// Check if another attempt is allowed after `attempt` failed.
    pub fn has_attempts_left(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Run a recovery step whose failure must not replace the error being handled.
///
/// Failures are logged at WARN and dropped.
pub async fn best_effort<F>(what: &str, recovery: F)
where
    F: Future<Output = Result<()>>,
{
    if let Err(e) = recovery.await {
        tracing::warn!(error = %e, "{what} failed; continuing with original error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExtractError;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(700),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(700));
        assert_eq!(policy.backoff(40), Duration::from_millis(700));
    }

    #[test]
    fn test_attempt_budget() {
        let policy = RetryPolicy::export(3);
        assert!(policy.has_attempts_left(1));
        assert!(policy.has_attempts_left(2));
        assert!(!policy.has_attempts_left(3));
        assert_eq!(RetryPolicy::export(0).max_attempts, 1);
    }

    #[test]
    fn test_reconnect_policy_is_shorter() {
        let export = RetryPolicy::export(5);
        let reconnect = RetryPolicy::reconnect();
        assert!(reconnect.backoff(1) < export.backoff(1));
        assert!(reconnect.max_delay < export.max_delay);
    }

    #[tokio::test]
    async fn test_best_effort_swallows_errors() {
        best_effort("close cursor", async { Err(ExtractError::connectivity("gone")) }).await;
        best_effort("close cursor", async { Ok(()) }).await;
    }
}
