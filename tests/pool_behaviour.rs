use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use esox_connectionpool::{
    ConnectionFactory, ConnectionPool, ConnectionState, FactoryError, PoolConfig, PoolError, PoolEvent, PoolState,
};
use parking_lot::Mutex;
use tokio::time::{Instant, timeout};

#[derive(Default)]
struct Numbers {
    created: AtomicUsize,
    destroyed: AtomicUsize,
    resets: AtomicUsize,
    fail_resets: bool,
    fail_destroys: bool,
    fail_creates: AtomicBool,
    /// Validation answers false
    invalid: AtomicBool,
    /// Validation raises an error
    validation_errors: AtomicBool,
    create_delay: Duration,
    validate_delay: Duration,
}

struct NumberFactory(Arc<Numbers>);

#[async_trait]
impl ConnectionFactory<usize> for NumberFactory {
    async fn create(&self) -> Result<usize, FactoryError> {
        if !self.0.create_delay.is_zero() {
            tokio::time::sleep(self.0.create_delay).await;
        }
        if self.0.fail_creates.load(Ordering::SeqCst) {
            return Err("connection refused".into());
        }
        Ok(self.0.created.fetch_add(1, Ordering::SeqCst))
    }

    async fn destroy(&self, _conn: usize) -> Result<(), FactoryError> {
        self.0.destroyed.fetch_add(1, Ordering::SeqCst);
        if self.0.fail_destroys {
            return Err("socket already closed".into());
        }
        Ok(())
    }

    async fn validate(&self, _conn: &usize) -> Result<bool, FactoryError> {
        if !self.0.validate_delay.is_zero() {
            tokio::time::sleep(self.0.validate_delay).await;
        }
        if self.0.validation_errors.load(Ordering::SeqCst) {
            return Err("broken pipe".into());
        }
        Ok(!self.0.invalid.load(Ordering::SeqCst))
    }

    async fn reset(&self, _conn: &mut usize) -> Result<(), FactoryError> {
        self.0.resets.fetch_add(1, Ordering::SeqCst);
        if self.0.fail_resets {
            return Err("session state could not be cleared".into());
        }
        Ok(())
    }
}

fn config(min: usize, max: usize) -> PoolConfig {
    PoolConfig::new()
        .with_min_connections(min)
        .with_max_connections(max)
        .with_validation_interval(Duration::ZERO)
        .with_idle_timeout(Duration::ZERO)
}

async fn pool_with(numbers: Arc<Numbers>, config: PoolConfig) -> ConnectionPool<usize> {
    ConnectionPool::build(NumberFactory(numbers), config).await.unwrap()
}

async fn pool(config: PoolConfig) -> ConnectionPool<usize> {
    pool_with(Arc::new(Numbers::default()), config).await
}

async fn wait_for_pending(pool: &ConnectionPool<usize>, pending: usize) {
    while pool.pending_count() < pending {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn fourth_acquire_waits_for_a_release() {
    let pool = pool(config(2, 3)).await;
    assert_eq!(pool.idle_count(), 2);

    let a = pool.acquire().await.unwrap();
    let _b = pool.acquire().await.unwrap();
    let _c = pool.acquire().await.unwrap();
    assert_eq!(pool.total_count(), 3);

    let fourth = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await.map(|conn| conn.id()) }
    });
    wait_for_pending(&pool, 1).await;
    assert!(!fourth.is_finished());

    let released = a.id();
    a.release().await;

    assert_eq!(fourth.await.unwrap().unwrap(), released);
    assert_eq!(pool.total_count(), 3);
}

#[tokio::test]
async fn released_connection_is_reused() {
    let numbers = Arc::new(Numbers::default());
    let pool = pool_with(numbers.clone(), config(0, 3).with_validate_on_acquire(false)).await;

    let first = pool.acquire().await.unwrap();
    let id = first.id();
    first.release().await;

    let second = pool.acquire().await.unwrap();
    assert_eq!(second.id(), id);
    assert_eq!(second.info().use_count, 2);
    assert_eq!(numbers.created.load(Ordering::SeqCst), 1);
    assert_eq!(numbers.resets.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_pool_times_out() {
    let pool = pool(config(0, 1).with_acquire_timeout(Duration::from_millis(50))).await;
    let _held = pool.acquire().await.unwrap();

    let started = Instant::now();
    let result = pool.acquire().await;
    let waited = started.elapsed();

    assert!(matches!(result, Err(PoolError::AcquireTimeout(_))));
    assert!(waited >= Duration::from_millis(50) && waited < Duration::from_millis(100));
    assert_eq!(pool.pending_count(), 0);
    assert_eq!(pool.statistics().total_timeouts, 1);
}

#[tokio::test]
async fn higher_priority_is_served_first() {
    let pool = pool(config(0, 1)).await;
    let held = pool.acquire().await.unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let waiter = |label: &'static str, priority: i32| {
        let pool = pool.clone();
        let order = order.clone();
        tokio::spawn(async move {
            let conn = pool.acquire_with_priority(priority).await.unwrap();
            order.lock().push(label);
            conn.release().await;
        })
    };

    let low = waiter("low", 0);
    wait_for_pending(&pool, 1).await;
    let high = waiter("high", 10);
    wait_for_pending(&pool, 2).await;

    held.release().await;
    low.await.unwrap();
    high.await.unwrap();

    assert_eq!(*order.lock(), vec!["high", "low"]);
}

#[tokio::test(start_paused = true)]
async fn drain_rejects_waiters_and_waits_for_releases() {
    let pool = pool(config(0, 1)).await;
    let held = pool.acquire().await.unwrap();

    let queued = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await.map(|conn| conn.id()) }
    });
    wait_for_pending(&pool, 1).await;

    let drain = tokio::spawn({
        let pool = pool.clone();
        async move { pool.drain().await }
    });

    assert!(matches!(queued.await.unwrap(), Err(PoolError::Draining)));
    assert!(matches!(pool.acquire().await, Err(PoolError::Draining)));

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(!drain.is_finished());
    assert_eq!(pool.state(), PoolState::Draining);

    held.release().await;
    drain.await.unwrap().unwrap();
    assert_eq!(pool.acquired_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn drain_deadline_gives_up() {
    let pool = pool(config(0, 1).with_drain_timeout(Duration::from_millis(300))).await;
    let _leaked = pool.acquire().await.unwrap();

    let result = pool.close().await;

    assert!(matches!(result, Err(PoolError::DrainTimeout(_))));
    assert_eq!(pool.state(), PoolState::Closed);
}

#[tokio::test]
async fn failed_reset_destroys_the_connection() {
    let numbers = Arc::new(Numbers {
        fail_resets: true,
        ..Default::default()
    });
    let pool = pool_with(numbers.clone(), config(0, 2)).await;

    let conn = pool.acquire().await.unwrap();
    conn.release().await;

    assert_eq!(pool.total_count(), 0);
    assert_eq!(numbers.destroyed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn dropped_handle_returns_to_the_pool() {
    let pool = pool(config(0, 1)).await;
    {
        let _conn = pool.acquire().await.unwrap();
    }

    while pool.idle_count() == 0 {
        tokio::task::yield_now().await;
    }
    assert_eq!(pool.acquired_count(), 0);
    assert!(pool.all_connections().iter().all(|info| info.state == ConnectionState::Idle));
}

#[tokio::test]
async fn events_follow_the_connection_lifecycle() {
    let pool = pool(config(0, 1)).await;
    let mut events = pool.subscribe();

    let conn = pool.acquire().await.unwrap();
    let id = conn.id();
    conn.release().await;
    pool.close().await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert_eq!(
        seen,
        vec![
            PoolEvent::Created { id },
            PoolEvent::Acquired { id },
            PoolEvent::Released { id },
            PoolEvent::Draining,
            PoolEvent::Destroyed { id },
            PoolEvent::Closed,
        ]
    );
}

#[tokio::test]
async fn operations_after_close_are_rejected() {
    let pool = pool(config(1, 2)).await;
    pool.close().await.unwrap();

    assert!(matches!(
        pool.acquire().await,
        Err(PoolError::PoolNotRunning(PoolState::Closed))
    ));
    assert!(pool.close().await.is_ok());
    assert!(!pool.health().is_healthy());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bounds_hold_under_contention() {
    const MAX: usize = 3;
    let pool = pool(config(1, MAX)).await;

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..25 {
                let conn = pool.acquire().await.unwrap();
                let stats = pool.statistics();
                assert!(stats.total_connections <= MAX);
                assert!(stats.idle_connections + stats.acquired_connections <= stats.total_connections);
                tokio::task::yield_now().await;
                conn.release().await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    // A queue service task may still be putting its connection back
    while pool.idle_count() != pool.total_count() {
        tokio::task::yield_now().await;
    }
    let stats = pool.statistics();
    assert_eq!(stats.acquired_connections, 0);
    assert_eq!(stats.idle_connections, stats.total_connections);
    assert_eq!(stats.total_acquired, 400);
    assert_eq!(stats.total_released, 400);
}

#[tokio::test(start_paused = true)]
async fn abandoned_acquire_still_creates_its_connection() {
    let numbers = Arc::new(Numbers {
        create_delay: Duration::from_millis(100),
        ..Default::default()
    });
    let pool = pool_with(numbers.clone(), config(0, 1).with_acquire_timeout(Duration::from_millis(500))).await;

    let abandoned = timeout(Duration::from_millis(10), pool.acquire()).await;
    assert!(abandoned.is_err());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(pool.total_count(), 1);
    assert_eq!(pool.idle_count(), 1);

    let conn = pool.acquire().await.unwrap();
    assert_eq!(*conn, 0);
    assert_eq!(numbers.created.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn abandoned_validation_puts_the_connection_back() {
    let numbers = Arc::new(Numbers {
        validate_delay: Duration::from_millis(100),
        ..Default::default()
    });
    let pool = pool_with(numbers.clone(), config(1, 1).with_validate_on_acquire(true)).await;

    let abandoned = timeout(Duration::from_millis(10), pool.acquire()).await;
    assert!(abandoned.is_err());

    assert_eq!(pool.total_count(), 1);
    assert_eq!(pool.idle_count(), 1);
    assert_eq!(pool.all_connections()[0].state, ConnectionState::Idle);

    let conn = pool.acquire().await.unwrap();
    assert_eq!(*conn, 0);
    assert_eq!(numbers.destroyed.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn abandoned_release_still_returns_the_connection() {
    let numbers = Arc::new(Numbers {
        validate_delay: Duration::from_millis(100),
        ..Default::default()
    });
    let config = config(0, 1)
        .with_validate_on_acquire(false)
        .with_validate_on_release(true)
        .with_drain_timeout(Duration::from_secs(2));
    let pool = pool_with(numbers, config).await;

    let conn = pool.acquire().await.unwrap();
    let abandoned = timeout(Duration::from_millis(10), conn.release()).await;
    assert!(abandoned.is_err());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(pool.acquired_count(), 0);
    assert_eq!(pool.idle_count(), 1);
    pool.drain().await.unwrap();
}

#[tokio::test]
async fn failed_release_validation_destroys_the_connection() {
    let numbers = Arc::new(Numbers::default());
    let config = config(0, 2)
        .with_validate_on_acquire(false)
        .with_validate_on_release(true);
    let pool = pool_with(numbers.clone(), config).await;

    let conn = pool.acquire().await.unwrap();
    numbers.invalid.store(true, Ordering::SeqCst);
    conn.release().await;
    assert_eq!(pool.total_count(), 0);
    assert_eq!(numbers.destroyed.load(Ordering::SeqCst), 1);

    numbers.invalid.store(false, Ordering::SeqCst);
    let conn = pool.acquire().await.unwrap();
    numbers.validation_errors.store(true, Ordering::SeqCst);
    conn.release().await;
    assert_eq!(pool.total_count(), 0);
    assert_eq!(numbers.destroyed.load(Ordering::SeqCst), 2);
    assert_eq!(numbers.resets.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn slow_factory_hits_the_connection_timeout() {
    let numbers = Arc::new(Numbers {
        create_delay: Duration::from_millis(200),
        ..Default::default()
    });
    let limit = Duration::from_millis(50);
    let pool = pool_with(numbers, config(0, 1).with_connection_timeout(limit)).await;

    let started = Instant::now();
    let result = pool.acquire().await;
    assert!(matches!(result, Err(PoolError::ConnectionCreationTimeout(waited)) if waited == limit));
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(pool.total_count(), 0);

    // The capacity came back, so the next caller creates instead of queueing
    assert!(matches!(
        pool.acquire().await,
        Err(PoolError::ConnectionCreationTimeout(_))
    ));
    assert_eq!(pool.statistics().total_errors, 2);
}

#[tokio::test]
async fn failed_initialization_closes_the_pool() {
    let numbers = Arc::new(Numbers::default());
    numbers.fail_creates.store(true, Ordering::SeqCst);
    let pool = ConnectionPool::new(NumberFactory(numbers), config(2, 4).with_auto_start(false)).unwrap();
    let mut events = pool.subscribe();

    assert!(matches!(pool.initialize().await, Err(PoolError::Factory(_))));
    assert_eq!(pool.state(), PoolState::Closed);
    assert!(matches!(
        pool.acquire().await,
        Err(PoolError::PoolNotRunning(PoolState::Closed))
    ));
    assert!(matches!(events.try_recv(), Ok(PoolEvent::Error { .. })));
}

#[tokio::test]
async fn background_failures_are_reported_as_events() {
    let numbers = Arc::new(Numbers {
        fail_destroys: true,
        ..Default::default()
    });
    let pool = pool_with(numbers.clone(), config(1, 2)).await;
    let mut events = pool.subscribe();

    let conn = pool.acquire().await.unwrap();
    numbers.fail_creates.store(true, Ordering::SeqCst);
    pool.destroy(conn).await;

    let mut errors = Vec::new();
    while errors.len() < 2 {
        match events.recv().await {
            Ok(PoolEvent::Error { message }) => errors.push(message),
            Ok(_) => {}
            Err(err) => panic!("event stream ended: {err}"),
        }
    }
    assert!(errors[0].starts_with("failed to destroy"));
    assert!(errors[1].starts_with("failed to replace connection"));
}

#[tokio::test(start_paused = true)]
async fn validation_sweep_keeps_the_floor() {
    let numbers = Arc::new(Numbers::default());
    let config = config(2, 4)
        .with_validate_on_acquire(false)
        .with_validate_on_release(false)
        .with_validation_interval(Duration::from_millis(100));
    let pool = pool_with(numbers.clone(), config).await;

    let mut held = Vec::new();
    for _ in 0..4 {
        held.push(pool.acquire().await.unwrap());
    }
    for conn in held {
        conn.release().await;
    }
    assert_eq!(pool.total_count(), 4);

    numbers.invalid.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(150)).await;
    numbers.invalid.store(false, Ordering::SeqCst);

    assert_eq!(numbers.destroyed.load(Ordering::SeqCst), 4);
    assert_eq!(pool.total_count(), 2);
    assert_eq!(pool.idle_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn idle_eviction_keeps_the_floor() {
    let numbers = Arc::new(Numbers::default());
    let pool = pool_with(numbers.clone(), config(2, 4).with_idle_timeout(Duration::from_millis(200))).await;

    let mut held = Vec::new();
    for _ in 0..4 {
        held.push(pool.acquire().await.unwrap());
    }
    for conn in held {
        conn.release().await;
    }

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(pool.total_count(), 2);
    assert_eq!(numbers.destroyed.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn queued_acquire_is_announced() {
    let pool = pool(config(0, 1)).await;
    let held = pool.acquire().await.unwrap();
    let mut events = pool.subscribe();

    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire_with_priority(7).await.map(|conn| conn.id()) }
    });
    wait_for_pending(&pool, 1).await;
    assert_eq!(events.try_recv().unwrap(), PoolEvent::Enqueued { pending: 1, priority: 7 });

    let id = held.id();
    held.release().await;
    assert_eq!(waiter.await.unwrap().unwrap(), id);
}

#[tokio::test(start_paused = true)]
async fn validation_sweep_keeps_hand_out_order() {
    let numbers = Arc::new(Numbers {
        validate_delay: Duration::from_millis(50),
        ..Default::default()
    });
    let config = config(0, 3)
        .with_validate_on_acquire(false)
        .with_validate_on_release(false)
        .with_validation_interval(Duration::from_millis(100));
    let pool = pool_with(numbers, config).await;

    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    let c = pool.acquire().await.unwrap();
    let (first, second) = (a.id(), b.id());
    a.release().await;
    b.release().await;
    c.release().await;

    // The sweep holds `first` from 100ms to 150ms
    tokio::time::sleep(Duration::from_millis(120)).await;
    let conn = pool.acquire().await.unwrap();
    assert_eq!(conn.id(), second);
    conn.release().await;

    tokio::time::sleep(Duration::from_millis(40)).await;
    let conn = pool.acquire().await.unwrap();
    assert_eq!(conn.id(), first);
}
