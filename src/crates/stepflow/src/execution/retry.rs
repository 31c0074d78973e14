//! Fixed-delay retry for delegated work
//!
//! Attempts are made up to `max_retries + 1` times with a constant pause in
//! between. There is no backoff and no cancellation.

use crate::error::{Result, StepflowError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// Pause between attempts in milliseconds
    pub retry_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay_ms: retry_delay.as_millis() as u64,
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Whether an error is worth another attempt
///
/// Missing work units or targets will not appear between attempts.
pub fn is_retryable(error: &StepflowError) -> bool {
    !matches!(
        error,
        StepflowError::WorkNotFound(_)
            | StepflowError::TargetNotFound(_)
            | StepflowError::NoTargetAvailable(_)
    )
}

/// Execute `f` until it succeeds, the error is permanent, or attempts run out
pub async fn retry_with_delay<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            info!(
                operation = operation_name,
                attempt = attempt,
                max_retries = policy.max_retries,
                "Retrying operation"
            );
        }

        match f(attempt).await {
            Ok(result) => {
                if attempt > 0 {
                    info!(
                        operation = operation_name,
                        attempt = attempt,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                debug!(
                    operation = operation_name,
                    attempt = attempt,
                    error = %e,
                    "Operation failed"
                );

                if !is_retryable(&e) {
                    error!(
                        operation = operation_name,
                        error = %e,
                        "Permanent error detected, aborting retries"
                    );
                    return Err(e);
                }

                last_error = Some(e);

                if attempt < policy.max_retries {
                    warn!(
                        operation = operation_name,
                        attempt = attempt,
                        delay_ms = policy.retry_delay_ms,
                        "Attempt failed, will retry after delay"
                    );
                    tokio::time::sleep(policy.retry_delay()).await;
                }
            }
        }
    }

    let final_error = last_error.unwrap_or_else(|| {
        StepflowError::General(format!(
            "Operation '{}' failed after {} retries",
            operation_name, policy.max_retries
        ))
    });

    error!(
        operation = operation_name,
        max_retries = policy.max_retries,
        error = %final_error,
        "All retry attempts exhausted"
    );

    Err(final_error)
}
