//! Counting semaphore with explicit acquire/release

use std::future::Future;

use tokio::sync::Semaphore as TokioSemaphore;

/// Counting permits handed to waiters in arrival order
///
/// Unlike a guard-based semaphore, a permit is held until
/// [`release`](Semaphore::release) is called, which hands it straight to the
/// oldest waiter when there is one.
///
/// # Examples
///
/// ```
/// use esox_connectionpool::Semaphore;
///
/// # #[tokio::main]
/// # async fn main() {
/// let semaphore = Semaphore::new(2);
/// semaphore.acquire().await;
/// assert_eq!(semaphore.available_permits(), 1);
/// semaphore.release();
/// assert_eq!(semaphore.available_permits(), 2);
/// # }
/// ```
#[derive(Debug)]
pub struct Semaphore {
    inner: TokioSemaphore,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            inner: TokioSemaphore::new(permits),
        }
    }

    /// Wait for a permit
    pub async fn acquire(&self) {
        // The inner semaphore is never closed
        if let Ok(permit) = self.inner.acquire().await {
            permit.forget();
        }
    }

    /// Take a permit if one is free right now
    pub fn try_acquire(&self) -> bool {
        match self.inner.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Give a permit back, waking the oldest waiter
    pub fn release(&self) {
        self.inner.add_permits(1);
    }

    pub fn available_permits(&self) -> usize {
        self.inner.available_permits()
    }

    /// Run `f` while holding a permit; the permit is returned even if the
    /// future is dropped before completing.
    pub async fn with_permit<F, Fut, R>(&self, f: F) -> R
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        self.acquire().await;
        let _release = ReleaseOnDrop(self);
        f().await
    }
}

struct ReleaseOnDrop<'a>(&'a Semaphore);

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_waiters_are_served_in_order() {
        let semaphore = Arc::new(Semaphore::new(1));
        semaphore.acquire().await;

        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let semaphore = Arc::clone(&semaphore);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                semaphore.acquire().await;
                order.lock().push(i);
                semaphore.release();
            }));
            // Make sure each waiter is queued before the next one
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        semaphore.release();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_with_permit_releases_on_completion() {
        let semaphore = Semaphore::new(1);
        let value = semaphore.with_permit(|| async { 7 }).await;

        assert_eq!(value, 7);
        assert_eq!(semaphore.available_permits(), 1);
        assert!(semaphore.try_acquire());
        assert!(!semaphore.try_acquire());
    }
}
