//! Basic usage examples for ConnectionPool

use async_trait::async_trait;
use esox_connectionpool::{ConnectionFactory, ConnectionPool, FactoryError, PoolConfig, PoolEvent};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug)]
struct Socket {
    peer: String,
}

struct SocketFactory {
    opened: AtomicUsize,
}

#[async_trait]
impl ConnectionFactory<Socket> for SocketFactory {
    async fn create(&self) -> Result<Socket, FactoryError> {
        let n = self.opened.fetch_add(1, Ordering::SeqCst);
        sleep(Duration::from_millis(5)).await;
        Ok(Socket {
            peer: format!("10.0.0.{}:5432", n + 1),
        })
    }

    async fn destroy(&self, socket: Socket) -> Result<(), FactoryError> {
        println!("   Closing socket to {}", socket.peer);
        Ok(())
    }

    async fn validate(&self, socket: &Socket) -> Result<bool, FactoryError> {
        Ok(!socket.peer.is_empty())
    }
}

#[tokio::main]
async fn main() {
    println!("=== EsoxSolutions.ConnectionPool - Basic Examples ===\n");

    let config = PoolConfig::new()
        .with_min_connections(2)
        .with_max_connections(3)
        .with_acquire_timeout(Duration::from_millis(200));
    let pool = ConnectionPool::build(SocketFactory { opened: AtomicUsize::new(0) }, config)
        .await
        .unwrap();

    // Example 1: Acquire and release
    acquire_release(&pool).await;

    // Example 2: Waiting for a connection
    queued_acquire(&pool).await;

    // Example 3: Acquire timeout
    acquire_timeout(&pool).await;

    // Example 4: Statistics and health
    statistics_and_health(&pool).await;

    // Example 5: Events and shutdown
    shutdown(&pool).await;
}

async fn acquire_release(pool: &ConnectionPool<Socket>) {
    println!("1. Acquire and Release:");

    let conn = pool.acquire().await.unwrap();
    println!("   Got {} -> {}", conn.id(), conn.peer);
    conn.release().await;

    {
        let conn = pool.acquire().await.unwrap();
        println!("   Got {} -> {}", conn.id(), conn.peer);
        // Returned to the pool when dropped
    }
    sleep(Duration::from_millis(10)).await;

    println!("   Idle after return: {}\n", pool.idle_count());
}

async fn queued_acquire(pool: &ConnectionPool<Socket>) {
    println!("2. Waiting for a Connection:");

    let held = vec![
        pool.acquire().await.unwrap(),
        pool.acquire().await.unwrap(),
        pool.acquire().await.unwrap(),
    ];
    println!("   Acquired: {}", pool.acquired_count());

    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move {
            let conn = pool.acquire_with_priority(10).await.unwrap();
            println!("   Waiter got {}", conn.id());
            conn.release().await;
        }
    });

    sleep(Duration::from_millis(20)).await;
    println!("   Pending: {}", pool.pending_count());

    for conn in held {
        conn.release().await;
    }
    waiter.await.unwrap();
    println!();
}

async fn acquire_timeout(pool: &ConnectionPool<Socket>) {
    println!("3. Acquire Timeout:");

    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(pool.acquire().await.unwrap());
    }

    match pool.acquire().await {
        Ok(_) => println!("   Got connection"),
        Err(e) => println!("   Error: {}", e),
    }

    for conn in held {
        conn.release().await;
    }
    println!();
}

async fn statistics_and_health(pool: &ConnectionPool<Socket>) {
    println!("4. Statistics and Health:");

    let stats = pool.statistics();
    println!("   Created: {}", stats.total_created);
    println!("   Acquired: {}", stats.total_acquired);
    println!("   Timeouts: {}", stats.total_timeouts);
    println!("   Average acquire: {:?}", stats.average_acquire_time);

    let health = pool.health();
    println!("   Healthy: {}", health.is_healthy());
    for warning in &health.warnings {
        println!("   Warning: {}", warning);
    }

    for info in pool.all_connections() {
        println!("   {} used {} times ({:?})", info.id, info.use_count, info.state);
    }
    println!();
}

async fn shutdown(pool: &ConnectionPool<Socket>) {
    println!("5. Events and Shutdown:");

    let mut events = pool.subscribe();
    pool.close().await.unwrap();

    while let Ok(event) = events.try_recv() {
        match event {
            PoolEvent::Destroyed { id } => println!("   Destroyed {}", id),
            PoolEvent::Closed => println!("   Pool closed"),
            other => println!("   {:?}", other),
        }
    }
}
