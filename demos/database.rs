//! Database pool and pool registry examples

use async_trait::async_trait;
use esox_connectionpool::{
    Database, DatabaseConnectionPool, FactoryError, PoolConfig, PoolError, PoolManager,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// A toy key/value store speaking a tiny SQL dialect:
/// `SET key value`, `GET key`, `BEGIN`, `COMMIT`, `ROLLBACK`
#[derive(Default)]
struct MemoryDb {
    committed: Arc<Mutex<HashMap<String, String>>>,
}

struct Session {
    id: usize,
    pending: Option<HashMap<String, String>>,
}

#[async_trait]
impl Database for MemoryDb {
    type Connection = Session;
    type Row = String;

    async fn connect(&self) -> Result<Session, FactoryError> {
        static NEXT: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(1);
        Ok(Session {
            id: NEXT.fetch_add(1, std::sync::atomic::Ordering::SeqCst),
            pending: None,
        })
    }

    async fn ping(&self, _session: &Session) -> Result<bool, FactoryError> {
        Ok(true)
    }

    async fn execute(&self, session: &mut Session, sql: &str) -> Result<Vec<String>, FactoryError> {
        let parts: Vec<&str> = sql.split_whitespace().collect();
        match parts.as_slice() {
            ["BEGIN"] => {
                session.pending = Some(HashMap::new());
                Ok(vec![])
            }
            ["COMMIT"] => {
                if let Some(writes) = session.pending.take() {
                    self.committed.lock().extend(writes);
                }
                Ok(vec![])
            }
            ["ROLLBACK"] => {
                session.pending = None;
                Ok(vec![])
            }
            ["SET", key, value] => {
                match session.pending.as_mut() {
                    Some(writes) => {
                        writes.insert(key.to_string(), value.to_string());
                    }
                    None => {
                        self.committed.lock().insert(key.to_string(), value.to_string());
                    }
                }
                Ok(vec![])
            }
            ["GET", key] => Ok(self.committed.lock().get(*key).cloned().into_iter().collect()),
            _ => Err(format!("unsupported statement: {}", sql).into()),
        }
    }

    async fn close(&self, session: Session) -> Result<(), FactoryError> {
        println!("   Closing session {}", session.id);
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    println!("=== EsoxSolutions.ConnectionPool - Database Examples ===\n");

    let pool = DatabaseConnectionPool::build(
        MemoryDb::default(),
        PoolConfig::new().with_min_connections(1).with_max_connections(4),
    )
    .await
    .unwrap();

    // Example 1: Single queries
    queries(&pool).await;

    // Example 2: Transactions
    transactions(&pool).await;

    // Example 3: Pool registry
    registry(pool).await;
}

async fn queries(pool: &DatabaseConnectionPool<MemoryDb>) {
    println!("1. Queries:");

    pool.query("SET greeting hello").await.unwrap();
    let rows = pool.query("GET greeting").await.unwrap();
    println!("   greeting = {:?}", rows);

    match pool.query("DROP TABLE users").await {
        Ok(_) => println!("   Dropped"),
        Err(e) => println!("   Error: {}", e),
    }
    println!("   Acquired after queries: {}\n", pool.acquired_count());
}

async fn transactions(pool: &DatabaseConnectionPool<MemoryDb>) {
    println!("2. Transactions:");

    pool.transaction(|tx| {
        Box::pin(async move {
            tx.query("SET balance_a 90").await?;
            tx.query("SET balance_b 110").await?;
            Ok::<_, PoolError>(())
        })
    })
    .await
    .unwrap();
    println!("   balance_a = {:?}", pool.query("GET balance_a").await.unwrap());

    let failed = pool
        .transaction(|tx| {
            Box::pin(async move {
                tx.query("SET balance_a 0").await?;
                tx.query("TRUNCATE ledger").await?;
                Ok::<_, PoolError>(())
            })
        })
        .await;
    println!("   Failed transaction: {}", failed.is_err());
    println!("   balance_a after rollback = {:?}\n", pool.query("GET balance_a").await.unwrap());
}

async fn registry(pool: DatabaseConnectionPool<MemoryDb>) {
    println!("3. Pool Registry:");

    let manager = PoolManager::new();
    manager.register("primary", pool).unwrap();

    let replica = DatabaseConnectionPool::new(MemoryDb::default(), PoolConfig::default()).unwrap();
    if let Err(e) = manager.register("primary", replica) {
        println!("   Error: {}", e);
    }

    let primary = manager.get::<DatabaseConnectionPool<MemoryDb>>("primary").unwrap();
    primary.query("SET registered yes").await.unwrap();

    let stats = manager.statistics("primary").unwrap();
    println!("   Registered pools: {:?}", manager.names());
    println!("   primary: {} connections, {} acquisitions", stats.total_connections, stats.total_acquired);

    manager.close_all().await.unwrap();
    println!("   Pools after close_all: {}", manager.len());
}
