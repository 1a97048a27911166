// EsoxSolutions.ConnectionPool
// Bounded async connection pool with validation, eviction and resilience primitives

// This is just a binary wrapper - the actual library is in lib.rs
// Run examples with: cargo run --example basic

use std::time::Duration;

use esox_connectionpool::{PoolConfig, PoolError, ResourcePool};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn init_logging() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("esox_connectionpool=info"));

    let fmt_layer = fmt::layer().with_target(true).compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), PoolError> {
    init_logging();

    println!("=== EsoxSolutions.ConnectionPool ===");
    println!("See demos/ directory for usage examples");
    println!("Run: cargo run --example basic");
    println!();

    println!("Quick Demo:");
    let pool = ResourcePool::build(
        || async { Ok(String::from("session")) },
        |_session| async { Ok(()) },
        |session: &String| !session.is_empty(),
        PoolConfig::new()
            .with_min_connections(1)
            .with_max_connections(3)
            .with_acquire_timeout(Duration::from_secs(1)),
    )
    .await?;

    {
        let conn = pool.acquire().await?;
        println!("  Got connection {}: {}", conn.id(), *conn);
        conn.release().await;
    }

    println!("  Idle after release: {}", pool.idle_count());
    pool.close().await?;
    println!("  Pool state: {}", pool.state());
    Ok(())
}
