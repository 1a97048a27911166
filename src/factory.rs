//! The boundary between a pool and the resource it manages

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use crate::errors::FactoryError;

/// Creates, checks and disposes of the raw resources a pool hands out
///
/// # Examples
///
/// ```
/// use async_trait::async_trait;
/// use esox_connectionpool::{ConnectionFactory, FactoryError};
///
/// struct Sockets;
///
/// #[async_trait]
/// impl ConnectionFactory<String> for Sockets {
///     async fn create(&self) -> Result<String, FactoryError> {
///         Ok("socket".to_string())
///     }
///
///     async fn destroy(&self, _conn: String) -> Result<(), FactoryError> {
///         Ok(())
///     }
///
///     async fn validate(&self, conn: &String) -> Result<bool, FactoryError> {
///         Ok(!conn.is_empty())
///     }
/// }
/// ```
#[async_trait]
pub trait ConnectionFactory<T: Send + Sync + 'static>: Send + Sync + 'static {
    async fn create(&self) -> Result<T, FactoryError>;

    async fn destroy(&self, connection: T) -> Result<(), FactoryError>;

    /// `Ok(false)` and `Err(_)` both mark the connection as unhealthy
    async fn validate(&self, connection: &T) -> Result<bool, FactoryError>;

    /// Called before a released connection goes back to the idle set
    async fn reset(&self, _connection: &mut T) -> Result<(), FactoryError> {
        Ok(())
    }
}

/// A factory assembled from plain functions
pub struct FnFactory<T, C, D, V> {
    create: C,
    destroy: D,
    validate: V,
    _resource: PhantomData<fn() -> T>,
}

impl<T, C, D, V> FnFactory<T, C, D, V> {
    pub fn new(create: C, destroy: D, validate: V) -> Self {
        Self {
            create,
            destroy,
            validate,
            _resource: PhantomData,
        }
    }
}

#[async_trait]
impl<T, C, CF, D, DF, V> ConnectionFactory<T> for FnFactory<T, C, D, V>
where
    T: Send + Sync + 'static,
    C: Fn() -> CF + Send + Sync + 'static,
    CF: Future<Output = Result<T, FactoryError>> + Send + 'static,
    D: Fn(T) -> DF + Send + Sync + 'static,
    DF: Future<Output = Result<(), FactoryError>> + Send + 'static,
    V: Fn(&T) -> bool + Send + Sync + 'static,
{
    async fn create(&self) -> Result<T, FactoryError> {
        (self.create)().await
    }

    async fn destroy(&self, connection: T) -> Result<(), FactoryError> {
        (self.destroy)(connection).await
    }

    async fn validate(&self, connection: &T) -> Result<bool, FactoryError> {
        Ok((self.validate)(connection))
    }
}
