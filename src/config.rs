//! Pool configuration options

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::errors::{PoolError, PoolResult};

/// Configuration for connection pool behavior
///
/// Time-valued options are `Option<Duration>`; `None` disables the
/// corresponding timer. Passing [`Duration::ZERO`] to a `with_*` method
/// disables it as well.
///
/// # Examples
///
/// ```
/// use esox_connectionpool::PoolConfig;
/// use std::time::Duration;
///
/// let config = PoolConfig::new()
///     .with_min_connections(2)
///     .with_max_connections(10)
///     .with_acquire_timeout(Duration::from_secs(5));
///
/// assert_eq!(config.max_connections, 10);
/// assert_eq!(config.acquire_timeout, Some(Duration::from_secs(5)));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PoolConfig {
    /// Connections created on start-up and kept alive while running
    pub min_connections: usize,

    /// Upper bound on tracked connections
    pub max_connections: usize,

    /// How long a queued acquire may wait
    pub acquire_timeout: Option<Duration>,

    /// Idle connections above the floor are evicted after this long
    pub idle_timeout: Option<Duration>,

    /// Bound on a single `ConnectionFactory::create` call
    pub connection_timeout: Option<Duration>,

    /// Validate a connection before handing it out
    pub validate_on_acquire: bool,

    /// Validate a connection before taking it back
    pub validate_on_release: bool,

    /// Period of the background validation sweep over idle connections
    pub validation_interval: Option<Duration>,

    /// Hand out the oldest idle connection first (otherwise the newest)
    pub fifo: bool,

    /// Initialize the pool as soon as it is constructed
    pub auto_start: bool,

    /// Record acquire/use latency samples
    pub enable_statistics: bool,

    /// Upper bound on how long `drain` waits for acquired connections
    pub drain_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 0,
            max_connections: 10,
            acquire_timeout: Some(Duration::from_secs(30)),
            idle_timeout: Some(Duration::from_secs(30)),
            connection_timeout: Some(Duration::from_secs(30)),
            validate_on_acquire: true,
            validate_on_release: false,
            validation_interval: Some(Duration::from_secs(30)),
            fifo: true,
            auto_start: true,
            enable_statistics: true,
            drain_timeout: None,
        }
    }
}

fn enabled(duration: Duration) -> Option<Duration> {
    if duration.is_zero() { None } else { Some(duration) }
}

impl PoolConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Check the size bounds
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_connectionpool::PoolConfig;
    ///
    /// let config = PoolConfig::new()
    ///     .with_min_connections(5)
    ///     .with_max_connections(2);
    ///
    /// assert!(config.validate().is_err());
    /// ```
    pub fn validate(&self) -> PoolResult<()> {
        if self.max_connections == 0 {
            return Err(PoolError::InvalidConfiguration(
                "max_connections must be greater than 0".to_string(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(PoolError::InvalidConfiguration(format!(
                "min_connections ({}) must not exceed max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }

    /// Set the minimum pool size
    pub fn with_min_connections(mut self, count: usize) -> Self {
        self.min_connections = count;
        self
    }

    /// Set the maximum pool size
    pub fn with_max_connections(mut self, count: usize) -> Self {
        self.max_connections = count;
        self
    }

    /// Set the acquire timeout (zero disables it)
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = enabled(timeout);
        self
    }

    /// Set the idle timeout (zero disables eviction)
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = enabled(timeout);
        self
    }

    /// Set the connection creation timeout (zero disables it)
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = enabled(timeout);
        self
    }

    /// Toggle validation on acquire
    pub fn with_validate_on_acquire(mut self, validate: bool) -> Self {
        self.validate_on_acquire = validate;
        self
    }

    /// Toggle validation on release
    pub fn with_validate_on_release(mut self, validate: bool) -> Self {
        self.validate_on_release = validate;
        self
    }

    /// Set the background validation period (zero disables the sweep)
    pub fn with_validation_interval(mut self, interval: Duration) -> Self {
        self.validation_interval = enabled(interval);
        self
    }

    /// Choose FIFO (`true`) or LIFO (`false`) hand-out of idle connections
    pub fn with_fifo(mut self, fifo: bool) -> Self {
        self.fifo = fifo;
        self
    }

    /// Toggle initialization on construction
    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    /// Toggle latency sampling
    pub fn with_statistics(mut self, enable: bool) -> Self {
        self.enable_statistics = enable;
        self
    }

    /// Bound how long `drain` waits (zero means wait forever)
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = enabled(timeout);
        self
    }

    /// Period of the idle-eviction sweep: half the idle timeout, at most 10s
    pub(crate) fn eviction_interval(&self) -> Option<Duration> {
        self.idle_timeout
            .map(|idle| (idle / 2).min(Duration::from_secs(10)))
            .filter(|interval| !interval.is_zero())
    }
}
