//! Bounded retry for transient transaction failures.

use std::time::Duration;

use tracing::warn;

use crate::error::{PgError, PgResult};

/// Retry policy for short transactions.
///
/// Serialization failures and deadlocks are re-issued up to
/// `max_attempts` times with linear backoff. Anything else propagates
/// immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Base backoff; attempt `n` waits `n * backoff`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given attempt budget.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Set the base backoff.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Whether a failed attempt should be re-issued.
    pub fn should_retry(&self, attempt: u32, err: &PgError) -> bool {
        attempt + 1 < self.max_attempts && err.is_retryable()
    }

    /// Sleep before re-issuing attempt `attempt`.
    pub async fn wait(&self, attempt: u32) {
        tokio::time::sleep(self.backoff * attempt.max(1)).await;
    }

    /// Run an operation under this policy.
    ///
    /// The closure is re-invoked from scratch on each attempt; it must
    /// re-open any transaction it needs.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> PgResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = PgResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if self.should_retry(attempt, &err) => {
                    attempt += 1;
                    warn!(
                        attempt = attempt,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "Transient failure, re-issuing transaction"
                    );
                    self.wait(attempt).await;
                }
                Err(err) if err.is_retryable() => {
                    return Err(PgError::RetriesExhausted {
                        attempts: self.max_attempts,
                        source: Box::new(err),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }
}
