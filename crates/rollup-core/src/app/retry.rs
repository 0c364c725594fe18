//! Retry policy: decides backoff delays for in-run retries of store reads.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::domain::EngineError;

/// Upper bound for a single backoff delay.
pub const MAX_DELAY: Duration = Duration::from_secs(30);

/// Exponential backoff: `delay = base_delay * multiplier^(attempt - 1)`.
///
/// Only retryable error codes are retried; hard errors return immediately.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,

    /// Base delay for the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    /// 3 attempts, 200ms, 400ms.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay after the `attempts`-th failure (1-indexed).
    ///
    /// Example with base_delay=200ms, multiplier=2.0:
    /// - attempt 1: 200ms
    /// - attempt 2: 400ms
    ///
    /// Capped at [`MAX_DELAY`]. A negative or NaN product falls back to `base_delay`.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = base_secs * self.multiplier.powi(exponent);
        if secs.is_nan() || secs < 0.0 {
            return self.base_delay.min(MAX_DELAY);
        }
        Duration::try_from_secs_f64(secs)
            .unwrap_or(MAX_DELAY)
            .min(MAX_DELAY)
    }

    /// Runs `op` until it succeeds, fails hard, or attempts run out.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_attempts.max(1) => {
                    let delay = self.next_delay(attempt);
                    warn!(%err, attempt, delay_ms = delay.as_millis() as u64, "{what} failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
