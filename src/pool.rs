//! Core connection pool implementation

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::PoolConfig;
use crate::connection::{ConnectionId, ConnectionInfo, ConnectionState, PoolState, PooledConnection};
use crate::errors::{PoolError, PoolResult};
use crate::events::{EventBus, PoolEvent};
use crate::eviction;
use crate::factory::ConnectionFactory;
use crate::health::HealthStatus;
use crate::metrics::{PoolStatistics, StatisticsTracker};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub(crate) struct IdleConnection<T> {
    pub id: ConnectionId,
    pub resource: T,
    /// Position in hand-out order, assigned on entering the idle set
    seq: u64,
}

/// A caller parked until a connection frees up
struct AcquireRequest<T: Send + Sync + 'static> {
    id: u64,
    priority: i32,
    enqueued_at: Instant,
    sender: oneshot::Sender<PoolResult<PooledConnection<T>>>,
}

/// Everything guarded by the pool lock
pub(crate) struct PoolShared<T: Send + Sync + 'static> {
    pub state: PoolState,
    pub connections: HashMap<ConnectionId, ConnectionInfo>,
    /// Sorted by `seq`
    pub idle: VecDeque<IdleConnection<T>>,
    pub acquired: HashSet<ConnectionId>,
    pending: VecDeque<AcquireRequest<T>>,
    /// Factory calls in flight; they count against `max_connections`
    creating: usize,
    idle_seq: u64,
}

impl<T: Send + Sync + 'static> PoolShared<T> {
    fn new() -> Self {
        Self {
            state: PoolState::Initializing,
            connections: HashMap::new(),
            idle: VecDeque::new(),
            acquired: HashSet::new(),
            pending: VecDeque::new(),
            creating: 0,
            idle_seq: 0,
        }
    }

    fn pop_idle(&mut self, fifo: bool) -> Option<IdleConnection<T>> {
        if fifo {
            self.idle.pop_front()
        } else {
            self.idle.pop_back()
        }
    }

    fn push_idle(&mut self, id: ConnectionId, resource: T) {
        self.idle_seq += 1;
        self.idle.push_back(IdleConnection {
            id,
            resource,
            seq: self.idle_seq,
        });
    }

    /// Put a connection that was taken out but not handed over back in its
    /// old place
    fn restore_idle(&mut self, conn: IdleConnection<T>) {
        self.set_state(conn.id, ConnectionState::Idle);
        let index = self.idle.partition_point(|queued| queued.seq < conn.seq);
        self.idle.insert(index, conn);
    }

    pub fn remove_idle(&mut self, id: ConnectionId) -> Option<IdleConnection<T>> {
        let index = self.idle.iter().position(|conn| conn.id == id)?;
        self.idle.remove(index)
    }

    fn has_capacity(&self, max: usize) -> bool {
        self.connections.len() + self.creating < max
    }

    pub fn set_state(&mut self, id: ConnectionId, state: ConnectionState) {
        if let Some(info) = self.connections.get_mut(&id) {
            info.state = state;
        }
    }

    /// Higher priority first, arrival order within a priority
    fn enqueue(&mut self, request: AcquireRequest<T>) -> usize {
        let index = self
            .pending
            .iter()
            .position(|queued| queued.priority < request.priority)
            .unwrap_or(self.pending.len());
        self.pending.insert(index, request);
        self.pending.len()
    }

    /// Mark an idle connection acquired. `None` means the pool had already
    /// forgotten it, which is a bookkeeping bug.
    fn checkout(&mut self, id: ConnectionId) -> Option<ConnectionInfo> {
        let Some(info) = self.connections.get_mut(&id) else {
            warn!(connection_id = %id, "idle connection is not tracked by the pool");
            return None;
        };
        info.mark_acquired();
        let info = info.clone();
        self.acquired.insert(id);
        Some(info)
    }

    fn check_in(&mut self, id: ConnectionId) {
        self.acquired.remove(&id);
        if let Some(info) = self.connections.get_mut(&id) {
            info.mark_idle();
        }
    }

    fn forget(&mut self, id: ConnectionId) -> bool {
        self.acquired.remove(&id);
        self.idle.retain(|conn| conn.id != id);
        self.connections.remove(&id).is_some()
    }
}

/// One unit of capacity claimed for a connection that is being created.
/// Dropping the slot before it is fulfilled gives the capacity back.
struct CreationSlot<T: Send + Sync + 'static> {
    pool: Arc<PoolInner<T>>,
    held: bool,
}

impl<T: Send + Sync + 'static> CreationSlot<T> {
    fn try_reserve(pool: &Arc<PoolInner<T>>, shared: &mut PoolShared<T>) -> Option<Self> {
        if !shared.has_capacity(pool.config.max_connections) {
            return None;
        }
        shared.creating += 1;
        Some(Self {
            pool: Arc::clone(pool),
            held: true,
        })
    }

    fn reserve(pool: &Arc<PoolInner<T>>) -> Option<Self> {
        let mut shared = pool.shared.lock();
        Self::try_reserve(pool, &mut shared)
    }

    /// The connection is tracked now; the caller holds the pool lock
    fn fulfil(mut self, shared: &mut PoolShared<T>) {
        shared.creating -= 1;
        self.held = false;
    }
}

impl<T: Send + Sync + 'static> Drop for CreationSlot<T> {
    fn drop(&mut self) {
        if self.held {
            self.pool.shared.lock().creating -= 1;
        }
    }
}

/// An idle connection taken out of the idle set for validation. Dropping
/// the lease before it is resolved puts the connection back.
pub(crate) struct IdleLease<T: Send + Sync + 'static> {
    pool: Arc<PoolInner<T>>,
    conn: Option<IdleConnection<T>>,
}

impl<T: Send + Sync + 'static> IdleLease<T> {
    /// Caller holds the pool lock and has already removed `conn` from idle
    pub(crate) fn new(pool: &Arc<PoolInner<T>>, shared: &mut PoolShared<T>, conn: IdleConnection<T>) -> Self {
        shared.set_state(conn.id, ConnectionState::Validating);
        Self {
            pool: Arc::clone(pool),
            conn: Some(conn),
        }
    }

    pub(crate) async fn validate(&self) -> bool {
        match &self.conn {
            Some(conn) => self.pool.validate(conn.id, &conn.resource).await,
            None => false,
        }
    }

    pub(crate) fn into_inner(mut self) -> Option<IdleConnection<T>> {
        self.conn.take()
    }

    pub(crate) fn restore(self) {
        drop(self);
    }
}

impl<T: Send + Sync + 'static> Drop for IdleLease<T> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            PoolInner::return_idle(&self.pool, conn);
        }
    }
}

/// Removes a queued acquire request when its caller stops waiting
struct QueuedRequest<'a, T: Send + Sync + 'static> {
    pool: &'a PoolInner<T>,
    id: u64,
}

impl<T: Send + Sync + 'static> Drop for QueuedRequest<'_, T> {
    fn drop(&mut self) {
        self.pool.cancel_request(self.id);
    }
}

/// What the queue service does next once the lock is released
enum QueueStep<T: Send + Sync + 'static> {
    Served,
    Orphaned(IdleConnection<T>),
    Validate(IdleLease<T>),
    Create(CreationSlot<T>),
}

pub(crate) struct PoolInner<T: Send + Sync + 'static> {
    factory: Arc<dyn ConnectionFactory<T>>,
    config: PoolConfig,
    pub(crate) shared: Mutex<PoolShared<T>>,
    stats: StatisticsTracker,
    events: EventBus,
    next_connection_id: AtomicU64,
    next_request_id: AtomicU64,
    initialize_started: AtomicBool,
    started_at: Instant,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + Sync + 'static> PoolInner<T> {
    fn new(factory: Arc<dyn ConnectionFactory<T>>, config: PoolConfig) -> Self {
        let stats = StatisticsTracker::new(config.enable_statistics);
        Self {
            factory,
            config,
            shared: Mutex::new(PoolShared::new()),
            stats,
            events: EventBus::new(),
            next_connection_id: AtomicU64::new(1),
            next_request_id: AtomicU64::new(1),
            initialize_started: AtomicBool::new(false),
            started_at: Instant::now(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn state(&self) -> PoolState {
        self.shared.lock().state
    }

    fn ensure_running(&self) -> PoolResult<()> {
        match self.state() {
            PoolState::Running => Ok(()),
            PoolState::Draining => Err(PoolError::Draining),
            other => Err(PoolError::PoolNotRunning(other)),
        }
    }

    /// Background failures have no caller to reject; surface them as events
    pub(crate) fn report_error(&self, message: String) {
        warn!(error = %message, "pool error");
        self.events.emit(PoolEvent::Error { message });
    }

    pub(crate) async fn initialize(this: &Arc<Self>) -> PoolResult<()> {
        if this.initialize_started.swap(true, Ordering::SeqCst) {
            return match this.state() {
                PoolState::Running => Ok(()),
                other => Err(PoolError::PoolNotRunning(other)),
            };
        }

        let slots: Vec<CreationSlot<T>> = {
            let mut shared = this.shared.lock();
            (0..this.config.min_connections)
                .map_while(|_| CreationSlot::try_reserve(this, &mut shared))
                .collect()
        };
        let mut seeding = JoinSet::new();
        for slot in slots {
            let pool = Arc::clone(this);
            seeding.spawn(async move { Self::create_connection(&pool, slot).await });
        }

        let mut failure = None;
        while let Some(joined) = seeding.join_next().await {
            let outcome = joined.unwrap_or(Err(PoolError::Cancelled));
            if let Err(err) = outcome {
                failure.get_or_insert(err);
            }
        }

        if let Some(err) = failure {
            this.report_error(format!("pool initialization failed: {err}"));
            Self::shut_down(this).await;
            return Err(err);
        }

        {
            let mut shared = this.shared.lock();
            if shared.state != PoolState::Initializing {
                return Err(PoolError::PoolNotRunning(shared.state));
            }
            shared.state = PoolState::Running;
        }

        let handles: Vec<JoinHandle<()>> = [
            eviction::spawn_validation_sweep(this),
            eviction::spawn_idle_eviction(this),
        ]
        .into_iter()
        .flatten()
        .collect();
        this.tasks.lock().extend(handles);

        info!(
            min = this.config.min_connections,
            max = this.config.max_connections,
            "connection pool ready"
        );
        this.events.emit(PoolEvent::Ready);
        Ok(())
    }

    /// Create one connection into a reserved slot and park it in the idle set
    async fn create_connection(this: &Arc<Self>, slot: CreationSlot<T>) -> PoolResult<ConnectionId> {
        let id = ConnectionId(this.next_connection_id.fetch_add(1, Ordering::Relaxed));

        // Losing the race drops the pending factory future
        let created = match this.config.connection_timeout {
            Some(limit) => match tokio::time::timeout(limit, this.factory.create()).await {
                Ok(result) => result.map_err(PoolError::factory),
                Err(_) => Err(PoolError::ConnectionCreationTimeout(limit)),
            },
            None => this.factory.create().await.map_err(PoolError::factory),
        };

        let resource = match created {
            Ok(resource) => resource,
            Err(err) => {
                drop(slot);
                StatisticsTracker::increment(&this.stats.total_errors);
                warn!(connection_id = %id, error = %err, "failed to create connection");
                return Err(err);
            }
        };

        let discarded = {
            let mut shared = this.shared.lock();
            slot.fulfil(&mut shared);
            if shared.state == PoolState::Closed {
                Some(resource)
            } else {
                shared.connections.insert(id, ConnectionInfo::new(id));
                shared.push_idle(id, resource);
                None
            }
        };

        let Some(resource) = discarded else {
            StatisticsTracker::increment(&this.stats.total_created);
            debug!(connection_id = %id, "connection created");
            this.events.emit(PoolEvent::Created { id });
            return Ok(id);
        };

        debug!(connection_id = %id, "pool closed during creation, discarding connection");
        if let Err(err) = this.factory.destroy(resource).await {
            StatisticsTracker::increment(&this.stats.total_errors);
            this.report_error(format!("failed to destroy {id}: {err}"));
        }
        Err(PoolError::Closed)
    }

    /// Create a connection in its own task, so that it still lands in the
    /// idle set when the caller stops waiting for it
    async fn create_detached(this: &Arc<Self>, slot: CreationSlot<T>) -> PoolResult<ConnectionId> {
        let pool = Arc::clone(this);
        let task = tokio::spawn(async move {
            let created = Self::create_connection(&pool, slot).await;
            if created.is_ok() {
                Self::process_queue(&pool).await;
            }
            created
        });
        task.await.unwrap_or(Err(PoolError::Cancelled))
    }

    /// Remove a connection from every set, then hand it to the factory
    pub(crate) async fn destroy_connection(this: &Arc<Self>, id: ConnectionId, resource: T) {
        if let Err(err) = Self::spawn_destroy(this, id, resource).await {
            warn!(connection_id = %id, error = %err, "destroy task failed");
        }
    }

    /// Stop tracking a connection now and let the factory tear it down in
    /// the background
    fn spawn_destroy(this: &Arc<Self>, id: ConnectionId, resource: T) -> JoinHandle<()> {
        let replacement = {
            let mut shared = this.shared.lock();
            shared.set_state(id, ConnectionState::Closing);
            shared.forget(id);
            let below_floor = shared.connections.len() + shared.creating < this.config.min_connections;
            if shared.state == PoolState::Running && below_floor {
                CreationSlot::try_reserve(this, &mut shared)
            } else {
                None
            }
        };

        let pool = Arc::clone(this);
        tokio::spawn(async move {
            if let Err(err) = pool.factory.destroy(resource).await {
                StatisticsTracker::increment(&pool.stats.total_errors);
                pool.report_error(format!("failed to destroy {id}: {err}"));
            }
            StatisticsTracker::increment(&pool.stats.total_destroyed);
            debug!(connection_id = %id, "connection destroyed");
            pool.events.emit(PoolEvent::Destroyed { id });

            if let Some(slot) = replacement {
                Self::spawn_replacement(&pool, slot);
            }
        })
    }

    /// Destroy a connection from code that cannot await
    fn discard(this: &Arc<Self>, id: ConnectionId, resource: T) {
        if Handle::try_current().is_ok() {
            drop(Self::spawn_destroy(this, id, resource));
        } else {
            warn!(connection_id = %id, "no tokio runtime, dropping connection without destroying it");
            this.shared.lock().forget(id);
            drop(resource);
        }
    }

    /// Top the pool back up to `min_connections`
    fn spawn_replacement(this: &Arc<Self>, slot: CreationSlot<T>) {
        let pool = Arc::clone(this);
        tokio::spawn(async move {
            match Self::create_connection(&pool, slot).await {
                Ok(id) => {
                    trace!(connection_id = %id, "replacement connection created");
                    Self::process_queue(&pool).await;
                }
                Err(err) => pool.report_error(format!("failed to replace connection: {err}")),
            }
        });
    }

    /// Back into the idle set after an unfinished validation
    fn return_idle(this: &Arc<Self>, conn: IdleConnection<T>) {
        let rejected = {
            let mut shared = this.shared.lock();
            if shared.state == PoolState::Closed {
                Some(conn)
            } else {
                shared.restore_idle(conn);
                None
            }
        };
        match rejected {
            Some(conn) => Self::discard(this, conn.id, conn.resource),
            None => Self::wake_queue(this),
        }
    }

    /// Serve the wait queue in the background if anyone is waiting
    fn wake_queue(this: &Arc<Self>) {
        if this.shared.lock().pending.is_empty() {
            return;
        }
        if let Ok(handle) = Handle::try_current() {
            let pool = Arc::clone(this);
            handle.spawn(async move {
                Self::process_queue(&pool).await;
            });
        }
    }

    /// Health-check a connection; errors count as unhealthy
    pub(crate) async fn validate(&self, id: ConnectionId, resource: &T) -> bool {
        let valid = match self.factory.validate(resource).await {
            Ok(valid) => valid,
            Err(err) => {
                StatisticsTracker::increment(&self.stats.total_errors);
                debug!(connection_id = %id, error = %err, "validation raised an error");
                false
            }
        };

        let mut guard = self.shared.lock();
        let shared = &mut *guard;
        if let Some(info) = shared.connections.get_mut(&id) {
            info.last_validated_at = Some(Instant::now());
            info.state = if shared.acquired.contains(&id) {
                ConnectionState::Acquired
            } else {
                ConnectionState::Idle
            };
        }
        if !valid {
            debug!(connection_id = %id, "connection failed validation");
        }
        valid
    }

    pub(crate) async fn acquire(this: &Arc<Self>, priority: i32) -> PoolResult<PooledConnection<T>> {
        let started = Instant::now();
        this.ensure_running()?;

        if let Some(conn) = Self::take_idle(this, started).await {
            return Ok(conn);
        }

        if let Some(slot) = CreationSlot::reserve(this) {
            Self::create_detached(this, slot).await?;
            if let Some(conn) = Self::take_idle(this, started).await {
                return Ok(conn);
            }
        }

        Self::enqueue_and_wait(this, priority, started).await
    }

    /// Pop idle connections until one passes validation or the set is empty
    async fn take_idle(this: &Arc<Self>, started: Instant) -> Option<PooledConnection<T>> {
        loop {
            let lease = {
                let mut shared = this.shared.lock();
                let candidate = shared.pop_idle(this.config.fifo)?;
                if this.config.validate_on_acquire {
                    IdleLease::new(this, &mut shared, candidate)
                } else {
                    let checked_out = shared.checkout(candidate.id);
                    drop(shared);
                    match checked_out {
                        Some(info) => return Some(Self::hand_out(this, candidate.resource, info, started)),
                        None => {
                            Self::discard(this, candidate.id, candidate.resource);
                            continue;
                        }
                    }
                }
            };

            let valid = lease.validate().await;
            let Some(candidate) = lease.into_inner() else {
                continue;
            };
            if !valid {
                Self::destroy_connection(this, candidate.id, candidate.resource).await;
                continue;
            }
            let checked_out = this.shared.lock().checkout(candidate.id);
            match checked_out {
                Some(info) => return Some(Self::hand_out(this, candidate.resource, info, started)),
                None => Self::discard(this, candidate.id, candidate.resource),
            }
        }
    }

    fn hand_out(this: &Arc<Self>, resource: T, info: ConnectionInfo, started: Instant) -> PooledConnection<T> {
        this.stats.record_acquire(started.elapsed());
        trace!(connection_id = %info.id, "connection acquired");
        this.events.emit(PoolEvent::Acquired { id: info.id });
        PooledConnection::new(resource, info, Arc::clone(this))
    }

    async fn enqueue_and_wait(
        this: &Arc<Self>,
        priority: i32,
        started: Instant,
    ) -> PoolResult<PooledConnection<T>> {
        let request_id = this.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (sender, mut receiver) = oneshot::channel();

        let pending = {
            let mut shared = this.shared.lock();
            if shared.state != PoolState::Running {
                return Err(PoolError::PoolNotRunning(shared.state));
            }
            shared.enqueue(AcquireRequest {
                id: request_id,
                priority,
                enqueued_at: started,
                sender,
            })
        };
        let _queued = QueuedRequest {
            pool: this,
            id: request_id,
        };
        debug!(pending, priority, "acquire request queued");
        this.events.emit(PoolEvent::Enqueued { pending, priority });

        // A connection may have come back between the idle check and now
        Self::wake_queue(this);

        let outcome = match this.config.acquire_timeout {
            None => receiver.await,
            Some(limit) => match tokio::time::timeout(limit, &mut receiver).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    if this.cancel_request(request_id) {
                        StatisticsTracker::increment(&this.stats.total_timeouts);
                        warn!(timeout = ?limit, priority, "acquire timed out");
                        return Err(PoolError::AcquireTimeout(limit));
                    }
                    // Served after the timer fired but before cancellation
                    receiver.await
                }
            },
        };

        outcome.unwrap_or(Err(PoolError::Cancelled))
    }

    fn cancel_request(&self, request_id: u64) -> bool {
        let mut shared = self.shared.lock();
        match shared.pending.iter().position(|request| request.id == request_id) {
            Some(index) => {
                shared.pending.remove(index);
                true
            }
            None => false,
        }
    }

    /// Serve queued requests from the idle set, creating connections while
    /// there is room and backlog.
    pub(crate) async fn process_queue(this: &Arc<Self>) {
        loop {
            let step = {
                let mut shared = this.shared.lock();
                if shared.pending.is_empty() || shared.state != PoolState::Running {
                    return;
                }
                match shared.pop_idle(this.config.fifo) {
                    Some(candidate) if this.config.validate_on_acquire => {
                        QueueStep::Validate(IdleLease::new(this, &mut shared, candidate))
                    }
                    Some(candidate) => match Self::dispatch(this, &mut shared, candidate) {
                        Some(orphan) => QueueStep::Orphaned(orphan),
                        None => QueueStep::Served,
                    },
                    None => match CreationSlot::try_reserve(this, &mut shared) {
                        Some(slot) => QueueStep::Create(slot),
                        None => return,
                    },
                }
            };

            match step {
                QueueStep::Served => {}
                QueueStep::Orphaned(conn) => Self::discard(this, conn.id, conn.resource),
                QueueStep::Validate(lease) => {
                    let valid = lease.validate().await;
                    let Some(candidate) = lease.into_inner() else {
                        continue;
                    };
                    if valid {
                        let orphan = Self::dispatch(this, &mut this.shared.lock(), candidate);
                        if let Some(conn) = orphan {
                            Self::discard(this, conn.id, conn.resource);
                        }
                    } else {
                        Self::destroy_connection(this, candidate.id, candidate.resource).await;
                    }
                }
                QueueStep::Create(slot) => {
                    if let Err(err) = Self::create_connection(this, slot).await {
                        this.report_error(format!("failed to create connection for queued request: {err}"));
                        return;
                    }
                }
            }
        }
    }

    /// Hand a connection to the head of the queue, skipping waiters that
    /// have gone away. A connection the pool no longer tracks is given back
    /// for the caller to discard once the lock is released.
    fn dispatch(
        this: &Arc<Self>,
        shared: &mut PoolShared<T>,
        mut candidate: IdleConnection<T>,
    ) -> Option<IdleConnection<T>> {
        while let Some(request) = shared.pending.pop_front() {
            let IdleConnection { id, resource, seq } = candidate;
            let Some(info) = shared.checkout(id) else {
                shared.pending.push_front(request);
                return Some(IdleConnection { id, resource, seq });
            };
            let conn = PooledConnection::new(resource, info, Arc::clone(this));
            match request.sender.send(Ok(conn)) {
                Ok(()) => {
                    this.stats.record_acquire(request.enqueued_at.elapsed());
                    trace!(connection_id = %id, "queued request served");
                    this.events.emit(PoolEvent::Acquired { id });
                    return None;
                }
                Err(returned) => {
                    shared.check_in(id);
                    match returned.ok().and_then(PooledConnection::detach) {
                        Some(resource) => candidate = IdleConnection { id, resource, seq },
                        None => return None,
                    }
                }
            }
        }
        shared.restore_idle(candidate);
        None
    }

    pub(crate) async fn release_connection(this: &Arc<Self>, id: ConnectionId, mut resource: T) {
        let (tracked, closed) = {
            let shared = this.shared.lock();
            (shared.acquired.contains(&id), shared.state == PoolState::Closed)
        };
        if !tracked {
            debug!(connection_id = %id, "release of an untracked connection ignored");
            return;
        }
        if closed {
            Self::destroy_connection(this, id, resource).await;
            return;
        }

        if this.config.validate_on_release && !this.validate(id, &resource).await {
            debug!(connection_id = %id, error = %PoolError::ValidationFailed, "destroying connection");
            Self::destroy_connection(this, id, resource).await;
            Self::process_queue(this).await;
            return;
        }

        if let Err(err) = this.factory.reset(&mut resource).await {
            StatisticsTracker::increment(&this.stats.total_errors);
            let err = PoolError::ResetFailed(err.to_string());
            warn!(connection_id = %id, error = %err, "destroying connection");
            Self::destroy_connection(this, id, resource).await;
            Self::process_queue(this).await;
            return;
        }

        let returned = {
            let mut shared = this.shared.lock();
            if shared.state == PoolState::Closed {
                Err(resource)
            } else {
                shared.check_in(id);
                let used_for = shared
                    .connections
                    .get(&id)
                    .map(|info| info.last_used_at.elapsed())
                    .unwrap_or_default();
                shared.push_idle(id, resource);
                Ok(used_for)
            }
        };

        let used_for = match returned {
            Ok(used_for) => used_for,
            Err(resource) => {
                Self::destroy_connection(this, id, resource).await;
                return;
            }
        };
        this.stats.record_release(used_for);
        trace!(connection_id = %id, "connection released");
        this.events.emit(PoolEvent::Released { id });
        Self::process_queue(this).await;
    }

    /// Release from `Drop`, which cannot await
    pub(crate) fn release_on_drop(this: &Arc<Self>, id: ConnectionId, resource: T) {
        match Handle::try_current() {
            Ok(handle) => {
                let pool = Arc::clone(this);
                handle.spawn(async move {
                    Self::release_connection(&pool, id, resource).await;
                });
            }
            Err(_) => {
                warn!(connection_id = %id, "connection dropped outside a tokio runtime, discarding it");
                this.shared.lock().forget(id);
                drop(resource);
            }
        }
    }

    /// Reject queued callers, then wait for every acquired connection
    pub(crate) async fn drain(this: &Arc<Self>) -> PoolResult<()> {
        let rejected = {
            let mut shared = this.shared.lock();
            match shared.state {
                PoolState::Closed => return Ok(()),
                PoolState::Draining => None,
                PoolState::Initializing | PoolState::Running => {
                    shared.state = PoolState::Draining;
                    Some(std::mem::take(&mut shared.pending))
                }
            }
        };

        if let Some(rejected) = rejected {
            info!(rejected = rejected.len(), "connection pool draining");
            for request in rejected {
                let _ = request.sender.send(Err(PoolError::Draining));
            }
            this.events.emit(PoolEvent::Draining);
        }

        let deadline = this.config.drain_timeout.map(|limit| (Instant::now() + limit, limit));
        loop {
            let outstanding = this.shared.lock().acquired.len();
            if outstanding == 0 {
                return Ok(());
            }
            if let Some((deadline, limit)) = deadline
                && Instant::now() >= deadline
            {
                warn!(outstanding, "drain deadline passed with connections still acquired");
                return Err(PoolError::DrainTimeout(limit));
            }
            trace!(outstanding, "waiting for acquired connections");
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    pub(crate) async fn close(this: &Arc<Self>) -> PoolResult<()> {
        if this.state() == PoolState::Closed {
            return Ok(());
        }
        let drained = Self::drain(this).await;
        Self::shut_down(this).await;
        info!("connection pool closed");
        this.events.emit(PoolEvent::Closed);
        drained
    }

    /// Stop background work and destroy whatever is idle
    async fn shut_down(this: &Arc<Self>) {
        for task in this.tasks.lock().drain(..) {
            task.abort();
        }
        let remaining: Vec<IdleConnection<T>> = {
            let mut shared = this.shared.lock();
            shared.state = PoolState::Closed;
            shared.idle.drain(..).collect()
        };
        for conn in remaining {
            Self::destroy_connection(this, conn.id, conn.resource).await;
        }
    }

    fn statistics(&self) -> PoolStatistics {
        let mut stats = {
            let shared = self.shared.lock();
            PoolStatistics {
                total_connections: shared.connections.len(),
                idle_connections: shared.idle.len(),
                acquired_connections: shared.acquired.len(),
                pending_requests: shared.pending.len(),
                ..Default::default()
            }
        };
        self.stats.fill(&mut stats);
        stats.uptime = self.started_at.elapsed();
        stats.max_connections = self.config.max_connections;
        stats.utilization = stats.acquired_connections as f64 / self.config.max_connections.max(1) as f64;
        stats
    }
}

impl<T: Send + Sync + 'static> Drop for PoolInner<T> {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}


/// Bounded pool of connections created on demand by a [`ConnectionFactory`]
///
/// Cloning is cheap; clones share the same pool.
///
/// # Examples
///
/// ```
/// use esox_connectionpool::{PoolConfig, ResourcePool};
///
/// # #[tokio::main]
/// # async fn main() {
/// let pool = ResourcePool::build(
///     || async { Ok(vec![0u8; 16]) },
///     |_buf| async { Ok(()) },
///     |buf: &Vec<u8>| buf.len() == 16,
///     PoolConfig::new().with_min_connections(1).with_max_connections(4),
/// )
/// .await
/// .unwrap();
///
/// let conn = pool.acquire().await.unwrap();
/// assert_eq!(conn.len(), 16);
/// conn.release().await;
/// # }
/// ```
pub struct ConnectionPool<T: Send + Sync + 'static> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Send + Sync + 'static> Clone for ConnectionPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for ConnectionPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("state", &self.state())
            .field("statistics", &self.statistics())
            .finish()
    }
}

impl<T: Send + Sync + 'static> ConnectionPool<T> {
    /// Create a pool. With `auto_start` the pool initializes itself in the
    /// background on the current tokio runtime.
    pub fn new<F>(factory: F, config: PoolConfig) -> PoolResult<Self>
    where
        F: ConnectionFactory<T>,
    {
        Self::with_factory(Arc::new(factory), config)
    }

    /// Like [`new`](Self::new) for an already shared factory
    pub fn with_factory(factory: Arc<dyn ConnectionFactory<T>>, config: PoolConfig) -> PoolResult<Self> {
        let auto_start = config.auto_start;
        let pool = Self::unstarted(factory, config)?;
        if auto_start {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let inner = Arc::clone(&pool.inner);
                    handle.spawn(async move {
                        // Failures are reported through the event channel
                        let _ = PoolInner::initialize(&inner).await;
                    });
                }
                Err(_) => warn!("no tokio runtime available, call initialize() explicitly"),
            }
        }
        Ok(pool)
    }

    /// Create a pool and wait for it to reach `running`
    pub async fn build<F>(factory: F, config: PoolConfig) -> PoolResult<Self>
    where
        F: ConnectionFactory<T>,
    {
        Self::build_with_factory(Arc::new(factory), config).await
    }

    pub async fn build_with_factory(factory: Arc<dyn ConnectionFactory<T>>, config: PoolConfig) -> PoolResult<Self> {
        let pool = Self::unstarted(factory, config)?;
        pool.initialize().await?;
        Ok(pool)
    }

    fn unstarted(factory: Arc<dyn ConnectionFactory<T>>, config: PoolConfig) -> PoolResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(PoolInner::new(factory, config)),
        })
    }

    /// Seed `min_connections` and start background maintenance
    pub async fn initialize(&self) -> PoolResult<()> {
        PoolInner::initialize(&self.inner).await
    }

    /// Check out a connection with default priority
    pub async fn acquire(&self) -> PoolResult<PooledConnection<T>> {
        PoolInner::acquire(&self.inner, 0).await
    }

    /// Check out a connection; when the pool is exhausted, higher priorities
    /// are served first.
    pub async fn acquire_with_priority(&self, priority: i32) -> PoolResult<PooledConnection<T>> {
        PoolInner::acquire(&self.inner, priority).await
    }

    /// Return a connection. Handles from another pool are left to their owner.
    pub async fn release(&self, conn: PooledConnection<T>) {
        if conn.belongs_to(&self.inner) {
            conn.release().await;
        } else {
            debug!(connection_id = %conn.id(), "connection belongs to another pool");
        }
    }

    /// Close a connection and remove it from the pool
    pub async fn destroy(&self, conn: PooledConnection<T>) {
        if conn.belongs_to(&self.inner) {
            conn.destroy().await;
        } else {
            debug!(connection_id = %conn.id(), "connection belongs to another pool");
        }
    }

    /// Stop accepting work, reject queued callers and wait for every acquired
    /// connection to come back. Waits forever unless `drain_timeout` is set.
    pub async fn drain(&self) -> PoolResult<()> {
        PoolInner::drain(&self.inner).await
    }

    /// Drain, stop background tasks and destroy every idle connection
    pub async fn close(&self) -> PoolResult<()> {
        PoolInner::close(&self.inner).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> PoolState {
        self.inner.state()
    }

    pub fn config(&self) -> &PoolConfig {
        self.inner.config()
    }

    pub fn statistics(&self) -> PoolStatistics {
        self.inner.statistics()
    }

    pub fn health(&self) -> HealthStatus {
        HealthStatus::new(self.state(), &self.statistics())
    }

    /// Metadata for every tracked connection, ordered by id
    pub fn all_connections(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self.inner.shared.lock().connections.values().cloned().collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    pub fn total_count(&self) -> usize {
        self.inner.shared.lock().connections.len()
    }

    pub fn idle_count(&self) -> usize {
        self.inner.shared.lock().idle.len()
    }

    pub fn acquired_count(&self) -> usize {
        self.inner.shared.lock().acquired.len()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.shared.lock().pending.len()
    }
}
