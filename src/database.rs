//! Connection pool specialised for database-style connections

use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::config::PoolConfig;
use crate::connection::PooledConnection;
use crate::errors::{FactoryError, PoolError, PoolResult};
use crate::factory::ConnectionFactory;
use crate::pool::ConnectionPool;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A database driver: how to open, check, use and close one connection
#[async_trait]
pub trait Database: Send + Sync + 'static {
    type Connection: Send + Sync + 'static;
    type Row: Send + 'static;

    async fn connect(&self) -> Result<Self::Connection, FactoryError>;

    /// Liveness check, typically a trivial round trip
    async fn ping(&self, connection: &Self::Connection) -> Result<bool, FactoryError>;

    async fn execute(&self, connection: &mut Self::Connection, sql: &str) -> Result<Vec<Self::Row>, FactoryError>;

    async fn close(&self, connection: Self::Connection) -> Result<(), FactoryError>;
}

struct DatabaseFactory<D: Database> {
    database: Arc<D>,
}

#[async_trait]
impl<D: Database> ConnectionFactory<D::Connection> for DatabaseFactory<D> {
    async fn create(&self) -> Result<D::Connection, FactoryError> {
        self.database.connect().await
    }

    async fn destroy(&self, connection: D::Connection) -> Result<(), FactoryError> {
        self.database.close(connection).await
    }

    async fn validate(&self, connection: &D::Connection) -> Result<bool, FactoryError> {
        self.database.ping(connection).await
    }
}

/// A connection inside an open transaction.
///
/// A transaction dropped before it finished (its future cancelled, or the
/// callback panicked) is rolled back in the background; if the rollback
/// fails the connection is destroyed rather than returned dirty.
pub struct Transaction<D: Database> {
    database: Arc<D>,
    connection: Option<PooledConnection<D::Connection>>,
}

impl<D: Database> Transaction<D> {
    pub async fn query(&mut self, sql: &str) -> PoolResult<Vec<D::Row>> {
        let connection = self.connection.as_mut().ok_or(PoolError::Closed)?;
        self.database
            .execute(connection, sql)
            .await
            .map_err(PoolError::factory)
    }

    /// `None` once the transaction has handed its connection back
    pub fn connection(&self) -> Option<&PooledConnection<D::Connection>> {
        self.connection.as_ref()
    }

    /// Give the connection back: released when the session is clean,
    /// destroyed otherwise
    async fn finish(&mut self, clean: bool) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        if clean {
            connection.release().await;
        } else {
            connection.destroy().await;
        }
    }
}

impl<D: Database> Drop for Transaction<D> {
    fn drop(&mut self) {
        let Some(mut connection) = self.connection.take() else {
            return;
        };
        // Without a runtime the handle's own drop discards the connection
        let Ok(handle) = Handle::try_current() else {
            return;
        };
        warn!(connection_id = %connection.id(), "transaction dropped while open, rolling back");
        let database = Arc::clone(&self.database);
        handle.spawn(async move {
            match database.execute(&mut connection, "ROLLBACK").await {
                Ok(_) => connection.release().await,
                Err(err) => {
                    warn!(connection_id = %connection.id(), error = %err, "rollback failed, destroying connection");
                    connection.destroy().await;
                }
            }
        });
    }
}

/// Connection pool bound to a [`Database`]
///
/// # Examples
///
/// ```no_run
/// # use esox_connectionpool::{Database, DatabaseConnectionPool, PoolConfig, PoolError};
/// # async fn run<D: Database>(database: D) -> Result<(), PoolError> {
/// let pool = DatabaseConnectionPool::build(database, PoolConfig::default()).await?;
///
/// let rows = pool.query("SELECT 1").await?;
///
/// pool.transaction(|tx| Box::pin(async move {
///     tx.query("UPDATE accounts SET balance = balance - 10 WHERE id = 1").await?;
///     tx.query("UPDATE accounts SET balance = balance + 10 WHERE id = 2").await?;
///     Ok::<_, PoolError>(())
/// }))
/// .await?;
/// # Ok(())
/// # }
/// ```
pub struct DatabaseConnectionPool<D: Database> {
    pool: ConnectionPool<D::Connection>,
    database: Arc<D>,
}

impl<D: Database> Clone for DatabaseConnectionPool<D> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            database: Arc::clone(&self.database),
        }
    }
}

impl<D: Database> DatabaseConnectionPool<D> {
    /// Create the pool; honours `auto_start` like [`ConnectionPool::new`]
    pub fn new(database: D, config: PoolConfig) -> PoolResult<Self> {
        let database = Arc::new(database);
        let factory = DatabaseFactory {
            database: Arc::clone(&database),
        };
        Ok(Self {
            pool: ConnectionPool::new(factory, config)?,
            database,
        })
    }

    /// Create the pool and wait until it is running
    pub async fn build(database: D, config: PoolConfig) -> PoolResult<Self> {
        let database = Arc::new(database);
        let factory = DatabaseFactory {
            database: Arc::clone(&database),
        };
        Ok(Self {
            pool: ConnectionPool::build(factory, config).await?,
            database,
        })
    }

    pub fn pool(&self) -> &ConnectionPool<D::Connection> {
        &self.pool
    }

    /// Run one statement on a pooled connection
    pub async fn query(&self, sql: &str) -> PoolResult<Vec<D::Row>> {
        let mut conn = self.pool.acquire().await?;
        let result = self.database.execute(&mut conn, sql).await;
        conn.release().await;
        result.map_err(PoolError::factory)
    }

    /// Run `callback` inside BEGIN/COMMIT, rolling back if it fails.
    ///
    /// A connection whose COMMIT or ROLLBACK fails is destroyed.
    pub async fn transaction<F, R, E>(&self, callback: F) -> Result<R, E>
    where
        F: for<'t> FnOnce(&'t mut Transaction<D>) -> BoxFuture<'t, Result<R, E>>,
        E: From<PoolError>,
    {
        let connection = self.pool.acquire().await?;
        let mut tx = Transaction {
            database: Arc::clone(&self.database),
            connection: Some(connection),
        };

        if let Err(err) = tx.query("BEGIN").await {
            tx.finish(true).await;
            return Err(err.into());
        }

        let outcome = callback(&mut tx).await;
        let id = tx.connection().map(|conn| conn.id());
        match outcome {
            Ok(value) => match tx.query("COMMIT").await {
                Ok(_) => {
                    debug!(connection_id = ?id, "transaction committed");
                    tx.finish(true).await;
                    Ok(value)
                }
                Err(err) => {
                    warn!(connection_id = ?id, error = %err, "commit failed, destroying connection");
                    tx.finish(false).await;
                    Err(err.into())
                }
            },
            Err(err) => {
                let rolled_back = match tx.query("ROLLBACK").await {
                    Ok(_) => true,
                    Err(rollback) => {
                        warn!(connection_id = ?id, error = %rollback, "rollback failed, destroying connection");
                        false
                    }
                };
                tx.finish(rolled_back).await;
                Err(err)
            }
        }
    }
}

impl<D: Database> Deref for DatabaseConnectionPool<D> {
    type Target = ConnectionPool<D::Connection>;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}
