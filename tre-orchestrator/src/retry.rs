//! Bounded retry around conditional updates
//!
//! Optimistic concurrency means a write can lose a race and fail with
//! `Conflict`. Callers that own the decision to try again (status updaters,
//! the dispatcher's failure marking) wrap the read-modify-write cycle in
//! [`retry_on_conflict`], which re-runs it with exponential backoff and
//! gives up with `RetryExhausted` after a fixed number of attempts.

use crate::error::{OrchestratorError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff,
        }
    }

    /// Retry immediately, mostly useful in tests
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    /// Delay before attempt `attempt + 1`
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Run `op` until it returns something other than `Conflict`, at most
/// `policy.max_attempts` times. `op` receives the 1-based attempt number and
/// must re-read whatever state it conditions on.
pub async fn retry_on_conflict<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Err(OrchestratorError::Conflict(detail)) => {
                if attempt >= policy.max_attempts {
                    warn!(
                        operation,
                        attempts = attempt,
                        retry_exhausted = true,
                        last_conflict = %detail,
                        "Conflict retries exhausted"
                    );
                    return Err(OrchestratorError::RetryExhausted {
                        operation: operation.to_string(),
                        attempts: attempt,
                        last_conflict: detail,
                    });
                }

                let delay = policy.backoff_for(attempt);
                debug!(operation, attempt, ?delay, "Conflict, retrying");
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
            other => return other,
        }
    }
}
