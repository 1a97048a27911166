//! Health monitoring for connection pools

use crate::connection::PoolState;
use crate::metrics::PoolStatistics;

/// Health status of a connection pool
///
/// # Examples
///
/// ```
/// use esox_connectionpool::{HealthStatus, PoolState, PoolStatistics};
///
/// let stats = PoolStatistics {
///     total_connections: 3,
///     idle_connections: 3,
///     max_connections: 10,
///     ..Default::default()
/// };
///
/// let health = HealthStatus::new(PoolState::Running, &stats);
/// assert!(health.is_healthy());
/// assert_eq!(health.idle_connections, 3);
/// ```
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Whether the pool is healthy
    pub is_healthy: bool,

    /// Number of warnings detected
    pub warning_count: usize,

    /// Current pool utilization (0.0 to 1.0)
    pub utilization: f64,

    pub idle_connections: usize,

    pub acquired_connections: usize,

    pub pending_requests: usize,

    pub max_connections: usize,

    /// Warning messages
    pub warnings: Vec<String>,
}

impl HealthStatus {
    /// Derive a health status from a statistics snapshot
    pub fn new(state: PoolState, stats: &PoolStatistics) -> Self {
        let mut warnings = Vec::new();
        let mut is_healthy = true;

        if state != PoolState::Running {
            warnings.push(format!("Pool is {}", state));
            is_healthy = false;
        }

        // Check for high utilization
        if stats.utilization > 0.9 {
            warnings.push(format!("High utilization: {:.1}%", stats.utilization * 100.0));
            is_healthy = false;
        }

        if stats.idle_connections == 0 && stats.max_connections > 0 {
            warnings.push("No idle connections".to_string());
        }

        if stats.pending_requests > 0 {
            warnings.push(format!("{} callers waiting for a connection", stats.pending_requests));
        }

        Self {
            is_healthy,
            warning_count: warnings.len(),
            utilization: stats.utilization,
            idle_connections: stats.idle_connections,
            acquired_connections: stats.acquired_connections,
            pending_requests: stats.pending_requests,
            max_connections: stats.max_connections,
            warnings,
        }
    }

    /// Check if the pool is healthy
    pub fn is_healthy(&self) -> bool {
        self.is_healthy
    }
}
