//! Bounded caller-level retry for transient store failures.

use std::future::Future;
use std::time::Duration;

use crate::core::SchedulerError;

/// How often and how patiently a store call is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    pub attempts: u32,
    /// Fixed pause between attempts.
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Single attempt, no retry.
    pub const NONE: Self = Self {
        attempts: 1,
        backoff: Duration::ZERO,
    };
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

/// Run `op`, retrying transient errors up to the policy's attempt budget.
///
/// Non-transient errors are returned immediately.
///
/// # Errors
/// The last error once the budget is exhausted, or the first permanent error.
pub async fn with_store_retry<T, F, Fut>(
    policy: RetryPolicy,
    op_name: &str,
    mut op: F,
) -> Result<T, SchedulerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SchedulerError>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < attempts => {
                tracing::warn!(
                    op = op_name,
                    attempt,
                    max_attempts = attempts,
                    error = %err,
                    "transient store error, retrying"
                );
                attempt += 1;
                if !policy.backoff.is_zero() {
                    tokio::time::sleep(policy.backoff).await;
                }
            }
            Err(err) => return Err(err),
        }
    }
}
