//! Bounded exponential-backoff retry
//!
//! The delay before retry `n` (0-indexed) is `first × factor^n`, clamped to
//! `max`. Each delay is derived from the attempt number alone.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Retry policy for idempotent operations
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub first: Duration,
    /// Maximum delay between attempts
    pub max: Duration,
    /// Multiplicative growth factor
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            first: Duration::from_secs(1),
            max: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Fixed-delay policy
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            first: delay,
            max: delay,
            factor: 1.0,
        }
    }

    /// Delay to wait after failed attempt `attempt` (0-indexed)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);
        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Run `op` until it succeeds, attempts run out, `should_retry` rejects
    /// the error, or `token` is cancelled. Returns the last error on failure.
    ///
    /// `op` receives the 0-indexed attempt number.
    pub async fn retry_if<T, E, F, Fut, P>(
        &self,
        token: &CancellationToken,
        mut op: F,
        should_retry: P,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if attempt + 1 >= attempts || !should_retry(&err) {
                return Err(err);
            }

            let delay = self.delay(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "Retrying after failure");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = token.cancelled() => return Err(err),
            }
            attempt += 1;
        }
    }

    /// Retry every error
    pub async fn retry<T, E, F, Fut>(&self, token: &CancellationToken, op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.retry_if(token, op, |_| true).await
    }
}
