//! # esox_connectionpool
//!
//! Bounded, async connection pool for Rust with validation, idle eviction,
//! statistics and a set of resilience primitives.
//!
//! ## Features
//!
//! - Bounded pool with a min/max size and on-demand creation
//! - Priority-ordered wait queue with per-request acquire timeouts
//! - Validation on acquire, on release and by periodic sweep
//! - Idle eviction down to the configured floor
//! - Automatic return of connections via RAII (Drop trait)
//! - Graceful drain and close
//! - Event stream, statistics, health checks and Prometheus export
//! - Database pool with query and transaction helpers
//! - Named pool registry
//! - Semaphore, token bucket rate limiter, circuit breaker and retry policy
//!
//! ## Quick Start
//!
//! ```rust
//! use esox_connectionpool::{PoolConfig, ResourcePool};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let pool = ResourcePool::build(
//!     || async { Ok(String::from("connection")) },
//!     |_conn| async { Ok(()) },
//!     |conn: &String| !conn.is_empty(),
//!     PoolConfig::new().with_max_connections(4),
//! )
//! .await
//! .unwrap();
//!
//! {
//!     let conn = pool.acquire().await.unwrap();
//!     println!("Got: {}", *conn);
//!     // Returned to the pool when `conn` goes out of scope
//! }
//! # }
//! ```

mod pool;
mod config;
mod connection;
mod factory;
mod events;
mod metrics;
mod health;
mod eviction;
mod circuit_breaker;
mod errors;
mod semaphore;
mod rate_limiter;
mod retry;
mod database;
mod manager;
mod resource;

pub use pool::ConnectionPool;
pub use config::PoolConfig;
pub use connection::{ConnectionId, ConnectionInfo, ConnectionState, PoolState, PooledConnection};
pub use factory::{ConnectionFactory, FnFactory};
pub use events::PoolEvent;
pub use metrics::PoolStatistics;
#[cfg(feature = "metrics")]
pub use metrics::MetricsExporter;
pub use health::HealthStatus;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState};
pub use errors::{CircuitBreakerError, FactoryError, PoolError, PoolResult};
pub use semaphore::Semaphore;
pub use rate_limiter::RateLimiter;
pub use retry::{RetryConfig, RetryPolicy};
pub use database::{BoxFuture, Database, DatabaseConnectionPool, Transaction};
pub use manager::{ManagedPool, PoolManager};
pub use resource::ResourcePool;
