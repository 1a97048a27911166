//! Circuit breaker pattern implementation

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::CircuitBreakerError;

/// Circuit breaker state
///
/// # Examples
///
/// ```
/// use esox_connectionpool::{CircuitBreaker, CircuitBreakerState};
///
/// let breaker = CircuitBreaker::default();
/// assert_eq!(breaker.state(), CircuitBreakerState::Closed);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerState {
    /// Circuit is closed - normal operation
    Closed,

    /// Circuit is open - failing fast
    Open,

    /// Circuit is half-open - testing recovery
    HalfOpen,
}

/// Thresholds and timers for a [`CircuitBreaker`]
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed circuit
    pub failure_threshold: usize,

    /// Successes in half-open needed to close the circuit
    pub success_threshold: usize,

    /// Bound on a single call; `None` lets calls run as long as they like
    pub timeout: Option<Duration>,

    /// Cool-down after the last failure before a trial call is let through
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            timeout: Some(Duration::from_secs(30)),
            reset_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: usize) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: usize) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Set the per-call timeout (zero disables it)
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = if timeout.is_zero() { None } else { Some(timeout) };
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitBreakerState,
    failure_count: usize,
    success_count: usize,
    last_failure_time: Option<Instant>,
}

/// Circuit breaker for protecting against cascading failures
///
/// # Examples
///
/// ```
/// use esox_connectionpool::{CircuitBreaker, CircuitBreakerConfig};
///
/// let breaker = CircuitBreaker::new(CircuitBreakerConfig::new().with_failure_threshold(3));
///
/// // Record failures
/// breaker.record_failure();
/// breaker.record_failure();
/// breaker.record_failure();
///
/// // Circuit should be open after threshold
/// assert!(!breaker.allow_request());
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitBreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
            }),
        }
    }

    /// Get the current state
    pub fn state(&self) -> CircuitBreakerState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> usize {
        self.inner.lock().failure_count
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `f` through the breaker
    ///
    /// An open circuit rejects without calling `f`. A call that errors or
    /// exceeds the configured timeout counts as a failure.
    pub async fn execute<F, Fut, R, E>(&self, f: F) -> Result<R, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        if !self.allow_request() {
            return Err(CircuitBreakerError::Open);
        }

        let outcome = match self.config.timeout {
            Some(limit) => match tokio::time::timeout(limit, f()).await {
                Ok(result) => result.map_err(CircuitBreakerError::Operation),
                Err(_) => Err(CircuitBreakerError::Timeout(limit)),
            },
            None => f().await.map_err(CircuitBreakerError::Operation),
        };

        match outcome {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        outcome
    }

    /// Check if the circuit breaker allows the operation
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitBreakerState::Closed => true,
            CircuitBreakerState::Open => {
                // Check if the cool-down has elapsed
                if let Some(time) = inner.last_failure_time
                    && time.elapsed() >= self.config.reset_timeout
                {
                    debug!("circuit half-open, letting trial calls through");
                    inner.state = CircuitBreakerState::HalfOpen;
                    inner.success_count = 0;
                    return true;
                }
                false
            }
            CircuitBreakerState::HalfOpen => true,
        }
    }

    /// Record a successful operation
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = 0;

        if inner.state == CircuitBreakerState::HalfOpen {
            inner.success_count += 1;
            if inner.success_count >= self.config.success_threshold {
                debug!("circuit closed");
                Self::close(&mut inner);
            }
        }
    }

    /// Record a failed operation
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count += 1;
        inner.last_failure_time = Some(Instant::now());

        match inner.state {
            CircuitBreakerState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(failures = inner.failure_count, "circuit opened");
                    inner.state = CircuitBreakerState::Open;
                }
            }
            CircuitBreakerState::HalfOpen => {
                // Any failure in half-open immediately opens the circuit
                warn!("trial call failed, circuit reopened");
                inner.state = CircuitBreakerState::Open;
            }
            CircuitBreakerState::Open => {}
        }
    }

    fn close(inner: &mut Inner) {
        inner.state = CircuitBreakerState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
    }

    /// Reset the circuit breaker
    pub fn reset(&self) {
        Self::close(&mut self.inner.lock());
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker(failures: usize, successes: usize) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig::new()
                .with_failure_threshold(failures)
                .with_success_threshold(successes)
                .with_timeout(Duration::from_millis(50))
                .with_reset_timeout(Duration::from_millis(100)),
        )
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), CircuitBreakerError<&'static str>> {
        breaker.execute(|| async { Err("boom") }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_skips_the_operation() {
        let breaker = breaker(3, 1);
        for _ in 0..3 {
            assert_eq!(fail(&breaker).await, Err(CircuitBreakerError::Operation("boom")));
        }
        assert_eq!(breaker.state(), CircuitBreakerState::Open);

        let calls = AtomicUsize::new(0);
        let result = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &str>(())
            })
            .await;
        assert_eq!(result, Err(CircuitBreakerError::Open));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_closes_after_successes() {
        let breaker = breaker(1, 2);
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitBreakerState::Open);

        tokio::time::sleep(Duration::from_millis(100)).await;
        breaker.execute(|| async { Ok::<_, &str>(()) }).await.unwrap();
        assert_eq!(breaker.state(), CircuitBreakerState::HalfOpen);
        breaker.execute(|| async { Ok::<_, &str>(()) }).await.unwrap();
        assert_eq!(breaker.state(), CircuitBreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = breaker(1, 2);
        let _ = fail(&breaker).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitBreakerState::Open);
        assert!(!breaker.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_call_counts_as_failure() {
        let breaker = breaker(1, 1);
        let result = breaker
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, &str>(())
            })
            .await;

        assert_eq!(result, Err(CircuitBreakerError::Timeout(Duration::from_millis(50))));
        assert_eq!(breaker.state(), CircuitBreakerState::Open);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = breaker(3, 1);
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitBreakerState::Closed);
        assert_eq!(breaker.failure_count(), 1);
    }
}
