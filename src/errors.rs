//! Error types for the connection pool and the resilience primitives

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::connection::PoolState;

/// Error type returned by connection factories.
pub type FactoryError = Box<dyn StdError + Send + Sync>;

#[derive(Error, Debug, Clone)]
pub enum PoolError {
    #[error("Timed out after {0:?} waiting for a connection")]
    AcquireTimeout(Duration),

    #[error("Connection creation timed out after {0:?}")]
    ConnectionCreationTimeout(Duration),

    #[error("Connection validation failed")]
    ValidationFailed,

    #[error("Connection reset failed: {0}")]
    ResetFailed(String),

    #[error("Pool is not running (state: {0})")]
    PoolNotRunning(PoolState),

    #[error("Pool is draining")]
    Draining,

    #[error("Pool did not drain within {0:?}")]
    DrainTimeout(Duration),

    #[error("Connection factory failed: {0}")]
    Factory(Arc<dyn StdError + Send + Sync>),

    #[error("A pool named '{0}' is already registered")]
    DuplicatePoolName(String),

    #[error("No pool named '{0}' is registered")]
    PoolNotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Requested {requested} tokens but the bucket holds at most {capacity}")]
    ExceedsCapacity { requested: u64, capacity: u64 },

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Pool is closed")]
    Closed,
}

impl PoolError {
    pub(crate) fn factory(err: FactoryError) -> Self {
        PoolError::Factory(Arc::from(err))
    }
}

pub type PoolResult<T> = Result<T, PoolError>;

/// Error returned by [`CircuitBreaker::execute`](crate::CircuitBreaker::execute)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CircuitBreakerError<E> {
    #[error("Circuit breaker is open - too many failures")]
    Open,

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Operation(E),
}

impl<E> CircuitBreakerError<E> {
    /// The wrapped operation error, if the operation itself failed
    pub fn into_operation(self) -> Option<E> {
        match self {
            CircuitBreakerError::Operation(e) => Some(e),
            _ => None,
        }
    }
}
