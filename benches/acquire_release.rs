use criterion::{Criterion, black_box, criterion_group, criterion_main};
use esox_connectionpool::{PoolConfig, ResourcePool};

fn pool(runtime: &tokio::runtime::Runtime, validate_on_acquire: bool) -> ResourcePool<u64> {
    runtime
        .block_on(ResourcePool::build(
            || async { Ok(42u64) },
            |_n| async { Ok(()) },
            |n: &u64| *n == 42,
            PoolConfig::new()
                .with_min_connections(8)
                .with_max_connections(8)
                .with_validate_on_acquire(validate_on_acquire),
        ))
        .unwrap()
}

fn acquire_release(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    let unvalidated = pool(&runtime, false);
    c.bench_function("acquire_release", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let conn = unvalidated.acquire().await.unwrap();
                black_box(*conn);
                conn.release().await;
            })
        })
    });

    let validated = pool(&runtime, true);
    c.bench_function("acquire_release_validated", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let conn = validated.acquire().await.unwrap();
                black_box(*conn);
                conn.release().await;
            })
        })
    });

    let contended = pool(&runtime, false);
    c.bench_function("acquire_release_contended_16", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let mut tasks = Vec::with_capacity(16);
                for _ in 0..16 {
                    let pool = contended.clone();
                    tasks.push(tokio::spawn(async move {
                        let conn = pool.acquire().await.unwrap();
                        black_box(*conn);
                        conn.release().await;
                    }));
                }
                for task in tasks {
                    task.await.unwrap();
                }
            })
        })
    });
}

criterion_group!(benches, acquire_release);
criterion_main!(benches);
