//! Background maintenance: validation sweeps and idle eviction

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::connection::{ConnectionState, PoolState};
use crate::pool::{IdleConnection, IdleLease, PoolInner};

/// Run `sweep` every `period` for as long as the pool is alive
fn spawn_periodic<T, F, Fut>(pool: &Arc<PoolInner<T>>, period: Duration, sweep: F) -> JoinHandle<()>
where
    T: Send + Sync + 'static,
    F: Fn(Arc<PoolInner<T>>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let weak: Weak<PoolInner<T>> = Arc::downgrade(pool);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(pool) = weak.upgrade() else {
                break;
            };
            sweep(pool).await;
        }
    })
}

pub(crate) fn spawn_validation_sweep<T: Send + Sync + 'static>(pool: &Arc<PoolInner<T>>) -> Option<JoinHandle<()>> {
    let period = pool.config().validation_interval?;
    Some(spawn_periodic(pool, period, |pool| async move {
        validate_idle(&pool).await;
    }))
}

pub(crate) fn spawn_idle_eviction<T: Send + Sync + 'static>(pool: &Arc<PoolInner<T>>) -> Option<JoinHandle<()>> {
    let period = pool.config().eviction_interval()?;
    Some(spawn_periodic(pool, period, |pool| async move {
        evict_idle(&pool).await;
    }))
}

/// Validate a snapshot of the idle set, destroying whatever fails.
///
/// Connections that pass go back to their old place in hand-out order.
pub(crate) async fn validate_idle<T: Send + Sync + 'static>(pool: &Arc<PoolInner<T>>) {
    let snapshot: Vec<_> = {
        let shared = pool.shared.lock();
        if shared.state != PoolState::Running {
            return;
        }
        shared.idle.iter().map(|conn| conn.id).collect()
    };
    trace!(idle = snapshot.len(), "validation sweep");

    for id in snapshot {
        // Skip connections acquired since the snapshot was taken
        let lease = {
            let mut shared = pool.shared.lock();
            let Some(candidate) = shared.remove_idle(id) else {
                continue;
            };
            IdleLease::new(pool, &mut shared, candidate)
        };

        if lease.validate().await {
            lease.restore();
        } else if let Some(candidate) = lease.into_inner() {
            debug!(connection_id = %id, "idle connection failed validation");
            PoolInner::destroy_connection(pool, candidate.id, candidate.resource).await;
        }
    }

    PoolInner::process_queue(pool).await;
}

/// Destroy idle connections unused for longer than `idle_timeout`, never
/// going below `min_connections`.
///
/// The idle set is walked front to back, so at the floor the connections
/// nearest the front are the ones kept.
pub(crate) async fn evict_idle<T: Send + Sync + 'static>(pool: &Arc<PoolInner<T>>) {
    let Some(idle_timeout) = pool.config().idle_timeout else {
        return;
    };
    let floor = pool.config().min_connections;

    let victims: Vec<IdleConnection<T>> = {
        let mut shared = pool.shared.lock();
        if shared.state != PoolState::Running {
            return;
        }
        let mut victims = Vec::new();
        let mut index = 0;
        while index < shared.idle.len() {
            if shared.connections.len() <= floor {
                break;
            }
            let id = shared.idle[index].id;
            let expired = shared
                .connections
                .get(&id)
                .is_some_and(|info| info.idle_for() > idle_timeout);
            if !expired {
                index += 1;
                continue;
            }
            if let Some(victim) = shared.idle.remove(index) {
                shared.set_state(id, ConnectionState::Closing);
                shared.connections.remove(&id);
                victims.push(victim);
            }
        }
        victims
    };

    if !victims.is_empty() {
        debug!(evicted = victims.len(), "evicting idle connections");
    }
    for victim in victims {
        PoolInner::destroy_connection(pool, victim.id, victim.resource).await;
    }
}
