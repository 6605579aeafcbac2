// src/rabbitmq/retry.rs

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use super::errors::Result;

/// Longest single backoff the executor will sleep, whatever the policy says.
const MAX_BACKOFF_SECS: u64 = 30;

/// Bounded retry with exponential backoff for transient broker failures.
///
/// Attempts are numbered from 1. After a retryable failure on attempt `n`
/// the executor sleeps `base^n` seconds before attempt `n + 1`, so the
/// default policy of three attempts with base 2 waits 2s then 4s and gives
/// up after roughly six seconds. On exhaustion the last failure is returned
/// unchanged; non-retryable failures short-circuit on the first attempt.
///
/// No cancellation signal threads through the loop. The attempt budget
/// bounds the worst case, and callers that need a hard deadline wrap the
/// call in `tokio::time::timeout`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff_base_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_secs: 2,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base_secs: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_base_secs,
        }
    }

    /// Runs `op` until it succeeds, fails in a non-retryable way, or the
    /// attempt budget is spent. `operation` names the broker call in the
    /// retry logs.
    pub async fn execute<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) if attempt < self.max_attempts && error.is_retryable() => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_secs = delay.as_secs(),
                        error = %error,
                        "Transient broker failure, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let secs = self
            .backoff_base_secs
            .saturating_pow(attempt)
            .min(MAX_BACKOFF_SECS);
        Duration::from_secs(secs)
    }
}
