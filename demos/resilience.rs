//! Resilience primitives: semaphore, rate limiter, circuit breaker, retry

use esox_connectionpool::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, RateLimiter, RetryConfig, RetryPolicy,
    Semaphore,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::time::sleep;

#[tokio::main]
async fn main() {
    println!("=== EsoxSolutions.ConnectionPool - Resilience Examples ===\n");

    // Example 1: Semaphore
    semaphore_demo().await;

    // Example 2: Rate limiter
    rate_limiter_demo().await;

    // Example 3: Circuit breaker
    circuit_breaker_demo().await;

    // Example 4: Retry with backoff
    retry_demo().await;
}

async fn semaphore_demo() {
    println!("1. Semaphore:");

    let semaphore = Arc::new(Semaphore::new(2));
    let mut handles = vec![];

    for i in 0..4 {
        let semaphore = Arc::clone(&semaphore);
        handles.push(tokio::spawn(async move {
            semaphore
                .with_permit(|| async {
                    println!("   Task {} running", i);
                    sleep(Duration::from_millis(20)).await;
                })
                .await;
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }
    println!("   Permits available: {}\n", semaphore.available_permits());
}

async fn rate_limiter_demo() {
    println!("2. Rate Limiter:");

    let limiter = RateLimiter::new(5, 5.0);
    let started = Instant::now();

    for i in 0..7 {
        limiter.acquire(1).await.unwrap();
        println!("   Request {} at {:?}", i, started.elapsed());
    }

    match limiter.acquire(10).await {
        Ok(_) => println!("   Acquired 10 tokens"),
        Err(e) => println!("   Error: {}", e),
    }
    println!();
}

async fn circuit_breaker_demo() {
    println!("3. Circuit Breaker:");

    let breaker = CircuitBreaker::new(
        CircuitBreakerConfig::new()
            .with_failure_threshold(3)
            .with_success_threshold(1)
            .with_reset_timeout(Duration::from_millis(100)),
    );

    for i in 0..4 {
        let result = breaker.execute(|| async { Err::<(), _>("upstream unavailable") }).await;
        match result {
            Err(CircuitBreakerError::Open) => println!("   Call {}: rejected, circuit open", i),
            Err(e) => println!("   Call {}: {}", i, e),
            Ok(_) => println!("   Call {}: ok", i),
        }
    }
    println!("   State: {:?}", breaker.state());

    sleep(Duration::from_millis(120)).await;
    breaker.execute(|| async { Ok::<_, &str>(()) }).await.unwrap();
    println!("   State after recovery: {:?}\n", breaker.state());
}

async fn retry_demo() {
    println!("4. Retry with Backoff:");

    let policy = RetryPolicy::new(RetryConfig {
        max_retries: 4,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        backoff_multiplier: 2.0,
    });

    let attempts = AtomicUsize::new(0);
    let result = policy
        .execute(|| async {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            println!("   Attempt {}", attempt);
            if attempt < 3 { Err("connection refused") } else { Ok(attempt) }
        })
        .await;

    println!("   Result: {:?}", result);
}
