//! Token bucket rate limiting

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::trace;

use crate::errors::{PoolError, PoolResult};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

struct Waiter {
    tokens: f64,
    sender: oneshot::Sender<()>,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    queue: VecDeque<Waiter>,
    polling: bool,
}

struct Limits {
    max_tokens: f64,
    /// Tokens added per millisecond
    refill_rate: f64,
}

impl Bucket {
    fn refill(&mut self, limits: &Limits) {
        let now = Instant::now();
        let elapsed_ms = now.duration_since(self.last_refill).as_secs_f64() * 1000.0;
        self.tokens = (self.tokens + elapsed_ms * limits.refill_rate).min(limits.max_tokens);
        self.last_refill = now;
    }

    /// Serve waiters strictly from the head; a head request that cannot be
    /// satisfied yet blocks everything behind it.
    fn serve(&mut self) {
        while let Some(head) = self.queue.front() {
            if head.tokens > self.tokens {
                break;
            }
            if let Some(waiter) = self.queue.pop_front()
                && waiter.sender.send(()).is_ok()
            {
                self.tokens -= waiter.tokens;
            }
        }
    }
}

struct Shared {
    limits: Limits,
    bucket: Mutex<Bucket>,
}

/// Token bucket limiter with continuous refill
///
/// # Examples
///
/// ```
/// use esox_connectionpool::RateLimiter;
///
/// # #[tokio::main]
/// # async fn main() {
/// let limiter = RateLimiter::new(5, 5.0);
/// for _ in 0..5 {
///     limiter.acquire(1).await.unwrap();
/// }
/// assert!(!limiter.try_acquire(1));
/// # }
/// ```
#[derive(Clone)]
pub struct RateLimiter {
    shared: Arc<Shared>,
}

impl RateLimiter {
    /// A full bucket of `max_tokens`, refilled at `refill_per_second`
    pub fn new(max_tokens: u64, refill_per_second: f64) -> Self {
        let limits = Limits {
            max_tokens: max_tokens as f64,
            refill_rate: refill_per_second.max(0.0) / 1000.0,
        };
        Self {
            shared: Arc::new(Shared {
                bucket: Mutex::new(Bucket {
                    tokens: limits.max_tokens,
                    last_refill: Instant::now(),
                    queue: VecDeque::new(),
                    polling: false,
                }),
                limits,
            }),
        }
    }

    /// Wait until `tokens` are available and take them
    pub async fn acquire(&self, tokens: u64) -> PoolResult<()> {
        let wanted = tokens as f64;
        if wanted > self.shared.limits.max_tokens {
            return Err(PoolError::ExceedsCapacity {
                requested: tokens,
                capacity: self.shared.limits.max_tokens as u64,
            });
        }

        let receiver = {
            let mut bucket = self.shared.bucket.lock();
            bucket.refill(&self.shared.limits);
            if bucket.tokens >= wanted {
                bucket.tokens -= wanted;
                return Ok(());
            }

            let (sender, receiver) = oneshot::channel();
            bucket.queue.push_back(Waiter { tokens: wanted, sender });
            trace!(tokens, queued = bucket.queue.len(), "rate limited");
            if !bucket.polling {
                bucket.polling = true;
                Self::spawn_poller(Arc::downgrade(&self.shared));
            }
            receiver
        };

        receiver.await.map_err(|_| PoolError::Cancelled)
    }

    /// Take `tokens` only if they are available right now
    pub fn try_acquire(&self, tokens: u64) -> bool {
        let mut bucket = self.shared.bucket.lock();
        bucket.refill(&self.shared.limits);
        let wanted = tokens as f64;
        if bucket.tokens >= wanted {
            bucket.tokens -= wanted;
            true
        } else {
            false
        }
    }

    pub fn available_tokens(&self) -> f64 {
        let mut bucket = self.shared.bucket.lock();
        bucket.refill(&self.shared.limits);
        bucket.tokens
    }

    /// Callers waiting for tokens
    pub fn queued(&self) -> usize {
        self.shared.bucket.lock().queue.len()
    }

    fn spawn_poller(shared: Weak<Shared>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            loop {
                ticker.tick().await;
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                let drained = {
                    let mut bucket = shared.bucket.lock();
                    bucket.refill(&shared.limits);
                    bucket.serve();
                    bucket.polling = !bucket.queue.is_empty();
                    !bucket.polling
                };
                if drained {
                    break;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_bucket_refills_continuously() {
        let limiter = RateLimiter::new(5, 5.0);
        let started = Instant::now();
        for _ in 0..5 {
            limiter.acquire(1).await.unwrap();
        }
        assert_eq!(started.elapsed(), Duration::ZERO);

        limiter.acquire(1).await.unwrap();
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(200), "waited {waited:?}");
        assert!(waited < Duration::from_millis(250), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_head_of_line_blocks_smaller_requests() {
        let limiter = RateLimiter::new(4, 10.0);
        limiter.acquire(4).await.unwrap();

        let big = tokio::spawn({
            let limiter = limiter.clone();
            async move {
                limiter.acquire(3).await.unwrap();
                Instant::now()
            }
        });
        tokio::time::sleep(Duration::from_millis(1)).await;
        let small = tokio::spawn({
            let limiter = limiter.clone();
            async move {
                limiter.acquire(1).await.unwrap();
                Instant::now()
            }
        });

        let big_at = big.await.unwrap();
        let small_at = small.await.unwrap();
        // The small request could have been served after ~100ms but waits
        // behind the large one
        assert!(small_at >= big_at);
    }

    #[tokio::test]
    async fn test_oversized_request_is_rejected() {
        let limiter = RateLimiter::new(2, 1.0);
        assert!(matches!(
            limiter.acquire(3).await,
            Err(PoolError::ExceedsCapacity { requested: 3, capacity: 2 })
        ));
    }
}
