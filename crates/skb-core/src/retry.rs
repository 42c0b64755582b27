//! Bounded retry for network-fallible collaborator calls.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::ServiceError;

/// Up to `max_attempts` tries with a fixed `delay` between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

/// Terminal result of a retried call that never succeeded.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{operation} failed after {attempts} attempt(s): {last}")]
pub struct RetryExhausted {
    pub operation: &'static str,
    pub attempts: u32,
    pub last: ServiceError,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempt budget is spent. No delay follows the final attempt.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T, RetryExhausted>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    warn!(
                        target: "skb::retry",
                        operation,
                        attempt,
                        max_attempts,
                        error = %err,
                        "attempt failed"
                    );
                    if !err.is_transient() || attempt >= max_attempts {
                        return Err(RetryExhausted {
                            operation,
                            attempts: attempt,
                            last: err,
                        });
                    }
                    tokio::time::sleep(self.delay).await;
                }
            }
        }
    }
}
