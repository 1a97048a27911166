//! Connection metadata and the handle returned by `acquire`

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tokio::time::Instant;
use tracing::warn;

use crate::pool::PoolInner;

/// Opaque, pool-assigned connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConnectionId(pub(crate) u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle state of a single pooled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Acquired,
    Validating,
    Closing,
    Closed,
    Error,
}

/// Lifecycle state of a pool. Transitions only move forward.
///
/// # Examples
///
/// ```
/// use esox_connectionpool::PoolState;
///
/// assert!(PoolState::Initializing < PoolState::Running);
/// assert!(PoolState::Draining < PoolState::Closed);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PoolState {
    Initializing,
    Running,
    Draining,
    Closed,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PoolState::Initializing => "initializing",
            PoolState::Running => "running",
            PoolState::Draining => "draining",
            PoolState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Bookkeeping for one connection
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub created_at: Instant,
    pub last_used_at: Instant,
    pub last_validated_at: Option<Instant>,
    pub use_count: u64,
    pub state: ConnectionState,
    pub metadata: HashMap<String, String>,
}

impl ConnectionInfo {
    pub(crate) fn new(id: ConnectionId) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            last_used_at: now,
            last_validated_at: None,
            use_count: 0,
            state: ConnectionState::Idle,
            metadata: HashMap::new(),
        }
    }

    pub(crate) fn mark_acquired(&mut self) {
        self.state = ConnectionState::Acquired;
        self.use_count += 1;
        self.last_used_at = Instant::now();
    }

    pub(crate) fn mark_idle(&mut self) {
        self.state = ConnectionState::Idle;
    }

    /// Time since the connection was last handed out
    pub fn idle_for(&self) -> std::time::Duration {
        self.last_used_at.elapsed()
    }
}

/// A connection checked out of a [`ConnectionPool`](crate::ConnectionPool)
///
/// Dereferences to the raw resource. Give it back with [`release`](Self::release)
/// or throw it away with [`destroy`](Self::destroy); a handle that is simply
/// dropped is released in the background on the current tokio runtime.
pub struct PooledConnection<T: Send + Sync + 'static> {
    resource: Option<T>,
    info: ConnectionInfo,
    pool: Arc<PoolInner<T>>,
}

impl<T: Send + Sync + 'static> PooledConnection<T> {
    pub(crate) fn new(resource: T, info: ConnectionInfo, pool: Arc<PoolInner<T>>) -> Self {
        Self {
            resource: Some(resource),
            info,
            pool,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.info.id
    }

    /// Snapshot of the connection metadata taken when it was acquired
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Return the connection to its pool.
    ///
    /// Validation and reset run in a task of their own, so the connection
    /// still gets back to the pool if this future is dropped half way.
    pub async fn release(mut self) {
        let Some(resource) = self.resource.take() else {
            return;
        };
        let pool = Arc::clone(&self.pool);
        let id = self.info.id;
        let task = tokio::spawn(async move {
            PoolInner::release_connection(&pool, id, resource).await;
        });
        if let Err(err) = task.await {
            warn!(connection_id = %id, error = %err, "release task failed");
        }
    }

    /// Close the connection instead of returning it to the pool
    pub async fn destroy(mut self) {
        let Some(resource) = self.resource.take() else {
            return;
        };
        let pool = Arc::clone(&self.pool);
        let id = self.info.id;
        let task = tokio::spawn(async move {
            PoolInner::destroy_connection(&pool, id, resource).await;
            PoolInner::process_queue(&pool).await;
        });
        if let Err(err) = task.await {
            warn!(connection_id = %id, error = %err, "destroy task failed");
        }
    }

    /// Take the resource back without going through the pool
    pub(crate) fn detach(mut self) -> Option<T> {
        self.resource.take()
    }

    pub(crate) fn belongs_to(&self, pool: &Arc<PoolInner<T>>) -> bool {
        Arc::ptr_eq(&self.pool, pool)
    }
}

impl<T: Send + Sync + 'static> Deref for PooledConnection<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.resource.as_ref().expect("connection already returned")
    }
}

impl<T: Send + Sync + 'static> DerefMut for PooledConnection<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.resource.as_mut().expect("connection already returned")
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for PooledConnection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.info.id)
            .field("use_count", &self.info.use_count)
            .field("released", &self.resource.is_none())
            .finish()
    }
}

impl<T: Send + Sync + 'static> Drop for PooledConnection<T> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            PoolInner::release_on_drop(&self.pool, self.info.id, resource);
        }
    }
}
