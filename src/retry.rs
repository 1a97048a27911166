//! Bounded retries with exponential backoff

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Retry limits and backoff curve
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

/// Re-runs a failing operation with growing pauses in between
///
/// # Examples
///
/// ```
/// use esox_connectionpool::{RetryConfig, RetryPolicy};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() {
/// let policy = RetryPolicy::new(RetryConfig {
///     max_retries: 2,
///     initial_delay: Duration::from_millis(1),
///     ..Default::default()
/// });
///
/// let result: Result<u32, &str> = policy.execute(|| async { Ok(5) }).await;
/// assert_eq!(result, Ok(5));
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Retry on every error
    pub async fn execute<F, Fut, R, E>(&self, f: F) -> Result<R, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        self.execute_when(f, |_| true).await
    }

    /// Retry only errors for which `retry_on` returns true; anything else is
    /// returned immediately.
    pub async fn execute_when<F, Fut, R, E, P>(&self, mut f: F, retry_on: P) -> Result<R, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<R, E>>,
        P: Fn(&E) -> bool,
    {
        let mut delay = self.config.initial_delay;
        let mut attempt = 0;

        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.config.max_retries && retry_on(&err) => {
                    attempt += 1;
                    debug!(attempt, delay = ?delay, "operation failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = delay.mul_f64(self.config.backoff_multiplier).min(self.config.max_delay);
                }
                Err(err) => return Err(err),
            }
        }
    }
}
