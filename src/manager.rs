//! Named registry of independently configured pools

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::database::{Database, DatabaseConnectionPool};
use crate::errors::{PoolError, PoolResult};
use crate::metrics::PoolStatistics;
use crate::pool::ConnectionPool;
use crate::resource::ResourcePool;

/// Type-erased view of a pool the manager can close and inspect
#[async_trait]
pub trait ManagedPool: Send + Sync + 'static {
    async fn close(&self) -> PoolResult<()>;

    fn statistics(&self) -> PoolStatistics;

    fn as_any(&self) -> &(dyn Any + Send + Sync);
}

#[async_trait]
impl<T: Send + Sync + 'static> ManagedPool for ConnectionPool<T> {
    async fn close(&self) -> PoolResult<()> {
        ConnectionPool::close(self).await
    }

    fn statistics(&self) -> PoolStatistics {
        ConnectionPool::statistics(self)
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}

#[async_trait]
impl<D: Database> ManagedPool for DatabaseConnectionPool<D> {
    async fn close(&self) -> PoolResult<()> {
        self.pool().close().await
    }

    fn statistics(&self) -> PoolStatistics {
        self.pool().statistics()
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> ManagedPool for ResourcePool<T> {
    async fn close(&self) -> PoolResult<()> {
        self.pool().close().await
    }

    fn statistics(&self) -> PoolStatistics {
        self.pool().statistics()
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}

/// Pools by name
///
/// # Examples
///
/// ```
/// use esox_connectionpool::{PoolConfig, PoolManager, ResourcePool};
///
/// # #[tokio::main]
/// # async fn main() {
/// let manager = PoolManager::new();
/// let buffers = ResourcePool::build(
///     || async { Ok(String::new()) },
///     |_s| async { Ok(()) },
///     |_s: &String| true,
///     PoolConfig::default(),
/// )
/// .await
/// .unwrap();
///
/// manager.register("buffers", buffers).unwrap();
/// assert!(manager.has("buffers"));
///
/// let buffers = manager.get::<ResourcePool<String>>("buffers").unwrap();
/// assert_eq!(buffers.total_count(), 0);
///
/// manager.close_all().await.unwrap();
/// assert!(!manager.has("buffers"));
/// # }
/// ```
#[derive(Default)]
pub struct PoolManager {
    pools: DashMap<String, Arc<dyn ManagedPool>>,
}

impl PoolManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pool under `name`; names are unique
    pub fn register<P: ManagedPool>(&self, name: impl Into<String>, pool: P) -> PoolResult<()> {
        let name = name.into();
        match self.pools.entry(name) {
            Entry::Occupied(entry) => Err(PoolError::DuplicatePoolName(entry.key().clone())),
            Entry::Vacant(entry) => {
                info!(pool = %entry.key(), "pool registered");
                entry.insert(Arc::new(pool));
                Ok(())
            }
        }
    }

    /// The pool under `name`, if it exists and has type `P`
    pub fn get<P: ManagedPool + Clone>(&self, name: &str) -> Option<P> {
        let pool = self.pools.get(name)?;
        pool.as_any().downcast_ref::<P>().cloned()
    }

    /// Unregister a pool without closing it
    pub fn remove(&self, name: &str) -> bool {
        self.pools.remove(name).is_some()
    }

    pub fn has(&self, name: &str) -> bool {
        self.pools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn statistics(&self, name: &str) -> PoolResult<PoolStatistics> {
        self.pools
            .get(name)
            .map(|pool| pool.statistics())
            .ok_or_else(|| PoolError::PoolNotFound(name.to_string()))
    }

    /// Close every registered pool concurrently and empty the registry.
    /// Returns the first close error, after all pools have been closed.
    pub async fn close_all(&self) -> PoolResult<()> {
        let pools: Vec<(String, Arc<dyn ManagedPool>)> = self
            .pools
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        self.pools.clear();

        let mut closing = JoinSet::new();
        for (name, pool) in pools {
            closing.spawn(async move { (name, pool.close().await) });
        }

        let mut first_error = None;
        while let Some(joined) = closing.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((name, Err(err))) => {
                    warn!(pool = %name, error = %err, "pool failed to close cleanly");
                    first_error.get_or_insert(err);
                }
                Err(err) => {
                    warn!(error = %err, "close task failed");
                    first_error.get_or_insert(PoolError::Cancelled);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::connection::PoolState;

    async fn numbers() -> ResourcePool<u32> {
        ResourcePool::build(
            || async { Ok(7) },
            |_n| async { Ok(()) },
            |_n: &u32| true,
            PoolConfig::new().with_min_connections(1),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_name_is_rejected() {
        let manager = PoolManager::new();
        manager.register("numbers", numbers().await).unwrap();

        assert!(matches!(
            manager.register("numbers", numbers().await),
            Err(PoolError::DuplicatePoolName(name)) if name == "numbers"
        ));
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_get_checks_the_pool_type() {
        let manager = PoolManager::new();
        manager.register("numbers", numbers().await).unwrap();

        assert!(manager.get::<ResourcePool<u32>>("numbers").is_some());
        assert!(manager.get::<ResourcePool<String>>("numbers").is_none());
        assert!(manager.get::<ResourcePool<u32>>("missing").is_none());
    }

    #[tokio::test]
    async fn test_statistics_by_name() {
        let manager = PoolManager::new();
        manager.register("numbers", numbers().await).unwrap();

        assert_eq!(manager.statistics("numbers").unwrap().total_connections, 1);
        assert!(matches!(manager.statistics("other"), Err(PoolError::PoolNotFound(_))));
    }

    #[tokio::test]
    async fn test_close_all_closes_every_pool() {
        let manager = PoolManager::new();
        let first = numbers().await;
        let second = numbers().await;
        manager.register("first", first.clone()).unwrap();
        manager.register("second", second.clone()).unwrap();
        assert_eq!(manager.names(), vec!["first", "second"]);

        manager.close_all().await.unwrap();

        assert!(manager.is_empty());
        assert_eq!(first.state(), PoolState::Closed);
        assert_eq!(second.state(), PoolState::Closed);
    }

    #[tokio::test]
    async fn test_remove_leaves_pool_open() {
        let manager = PoolManager::new();
        let pool = numbers().await;
        manager.register("numbers", pool.clone()).unwrap();

        assert!(manager.remove("numbers"));
        assert!(!manager.remove("numbers"));
        assert_eq!(pool.state(), PoolState::Running);
    }
}
