//! Pools of arbitrary resources built from plain functions

use std::fmt;
use std::future::Future;
use std::ops::Deref;

use crate::config::PoolConfig;
use crate::errors::{FactoryError, PoolResult};
use crate::factory::FnFactory;
use crate::pool::ConnectionPool;

/// A [`ConnectionPool`] for things that are not connections: buffers,
/// parsers, worker handles
pub struct ResourcePool<T: Send + Sync + 'static> {
    pool: ConnectionPool<T>,
}

impl<T: Send + Sync + 'static> ResourcePool<T> {
    /// Create the pool; with `auto_start` it initializes in the background
    pub fn new<C, CF, D, DF, V>(create: C, destroy: D, validate: V, config: PoolConfig) -> PoolResult<Self>
    where
        C: Fn() -> CF + Send + Sync + 'static,
        CF: Future<Output = Result<T, FactoryError>> + Send + 'static,
        D: Fn(T) -> DF + Send + Sync + 'static,
        DF: Future<Output = Result<(), FactoryError>> + Send + 'static,
        V: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let factory = FnFactory::new(create, destroy, validate);
        Ok(Self {
            pool: ConnectionPool::new(factory, config)?,
        })
    }

    /// Create the pool and wait until it is running
    pub async fn build<C, CF, D, DF, V>(create: C, destroy: D, validate: V, config: PoolConfig) -> PoolResult<Self>
    where
        C: Fn() -> CF + Send + Sync + 'static,
        CF: Future<Output = Result<T, FactoryError>> + Send + 'static,
        D: Fn(T) -> DF + Send + Sync + 'static,
        DF: Future<Output = Result<(), FactoryError>> + Send + 'static,
        V: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let factory = FnFactory::new(create, destroy, validate);
        Ok(Self {
            pool: ConnectionPool::build(factory, config).await?,
        })
    }

    pub fn pool(&self) -> &ConnectionPool<T> {
        &self.pool
    }
}

impl<T: Send + Sync + 'static> Clone for ResourcePool<T> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for ResourcePool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ResourcePool").field(&self.pool).finish()
    }
}

impl<T: Send + Sync + 'static> Deref for ResourcePool<T> {
    type Target = ConnectionPool<T>;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}
