//! Connection pooling and lifecycle management
//!
//! Provides a validated, dynamically-sized pool over factory-opened
//! connections:
//! - Bounded acquire with a typed timeout
//! - Validation before reuse (error count, age, idle time, live probe)
//! - Automatic eviction of stale or erroring connections
//! - Utilization-driven scale up/down on a maintenance tick
//!
//! Every connection record is owned by exactly one place at a time: the idle
//! queue, an outstanding [`PooledConnection`] guard, or (briefly) the
//! maintenance sweep. Callers get RAII guards; release happens on drop on
//! every exit path.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, instrument, warn};

use crate::errors::{LatchError, Result};
use crate::factory::{ConnectionFactory, SqliteConnection};
use crate::query::{QueryOutput, SqlValue, Statement};

/// Connection pool configuration. Immutable after pool construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Minimum number of connections to maintain
    pub min_connections: usize,
    /// Maximum number of connections allowed
    pub max_connections: usize,
    /// Default maximum time to wait for a connection
    pub acquire_timeout: Duration,
    /// How long a connection can sit idle before removal
    pub max_idle_time: Duration,
    /// Maximum age of a connection before it is recycled
    pub max_lifetime: Duration,
    /// How often the maintenance tick runs
    pub maintenance_interval: Duration,
    /// Whether the maintenance tick adjusts pool size by utilization
    pub dynamic_scaling: bool,
    /// Utilization above which the pool grows by one connection
    pub scale_up_threshold: f64,
    /// Utilization below which the pool shrinks by one idle connection
    pub scale_down_threshold: f64,
    /// Consecutive errors before a connection is evicted
    pub max_consecutive_errors: u32,
    /// Whether validation runs a live probe query
    pub validate_with_probe: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
            max_idle_time: Duration::from_secs(300), // 5 minutes
            max_lifetime: Duration::from_secs(3600), // 1 hour
            maintenance_interval: Duration::from_secs(30),
            dynamic_scaling: true,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            max_consecutive_errors: 3,
            validate_with_probe: true,
        }
    }
}

impl PoolConfig {
    /// Reject configurations the pool cannot operate under. The hysteresis
    /// gap between the two thresholds is enforced here so sizing can never
    /// oscillate on a single utilization value.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(LatchError::InvalidConfig(
                "max_connections must be positive".into(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(LatchError::InvalidConfig(
                "min_connections cannot exceed max_connections".into(),
            ));
        }
        if self.scale_down_threshold >= self.scale_up_threshold {
            return Err(LatchError::InvalidConfig(
                "scale_down_threshold must be below scale_up_threshold".into(),
            ));
        }
        Ok(())
    }
}

/// Lifecycle state of one pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Idle,
    Active,
    Stale,
    Error,
}

/// One pooled connection plus its bookkeeping. Owned exclusively by the
/// pool or by the guard currently using it.
pub struct ConnectionRecord {
    pub id: u64,
    pub(crate) conn: SqliteConnection,
    pub created_at: Instant,
    pub last_used: Instant,
    pub use_count: u64,
    pub consecutive_errors: u32,
    pub state: ConnectionState,
    /// Pool generation this connection belongs to; bumping the pool epoch
    /// retires every older connection at its next validation point.
    pub(crate) epoch: u64,
}

struct PoolInner {
    idle: VecDeque<ConnectionRecord>,
    active_ids: HashSet<u64>,
    /// idle + active + records transiently held by the maintenance sweep
    /// or reserved for creation. Never exceeds `max_connections`.
    total: usize,
}

#[derive(Debug, Default)]
struct PoolCounters {
    created: AtomicU64,
    closed: AtomicU64,
    evicted: AtomicU64,
    acquired: AtomicU64,
    acquire_timeouts: AtomicU64,
    scale_up_events: AtomicU64,
    scale_down_events: AtomicU64,
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PoolStats {
    pub total_connections: usize,
    pub idle_connections: usize,
    pub active_connections: usize,
    pub min_connections: usize,
    pub max_connections: usize,
    pub created_total: u64,
    pub closed_total: u64,
    pub evicted_total: u64,
    pub acquired_total: u64,
    pub acquire_timeouts: u64,
    pub scale_up_events: u64,
    pub scale_down_events: u64,
    pub utilization: f64,
}

/// Connection pool manager for one database file.
#[derive(Clone)]
pub struct ConnectionPool {
    config: PoolConfig,
    factory: Arc<ConnectionFactory>,
    inner: Arc<Mutex<PoolInner>>,
    slots: Arc<Semaphore>,
    returned: Arc<Notify>,
    epoch: Arc<AtomicU64>,
    counters: Arc<PoolCounters>,
    shutdown: Arc<AtomicBool>,
    maintenance: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl ConnectionPool {
    pub fn new(factory: Arc<ConnectionFactory>, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            slots: Arc::new(Semaphore::new(config.max_connections)),
            config,
            factory,
            inner: Arc::new(Mutex::new(PoolInner {
                idle: VecDeque::new(),
                active_ids: HashSet::new(),
                total: 0,
            })),
            returned: Arc::new(Notify::new()),
            epoch: Arc::new(AtomicU64::new(0)),
            counters: Arc::new(PoolCounters::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
            maintenance: Arc::new(Mutex::new(None)),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Pre-create the minimum number of connections.
    pub async fn initialize(&self) -> Result<()> {
        self.ensure_min_connections().await?;
        info!(
            min = self.config.min_connections,
            max = self.config.max_connections,
            "connection pool initialized"
        );
        Ok(())
    }

    /// Acquire a connection, waiting at most `timeout`.
    ///
    /// Prefers a validated idle connection, creates a new one while below
    /// `max_connections`, and otherwise waits for a release. Expiry surfaces
    /// as a typed [`LatchError::PoolTimeout`]; the pool never retries
    /// acquisition on its own.
    #[instrument(skip(self), fields(timeout_ms = timeout.as_millis() as u64))]
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledConnection> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(LatchError::PoolClosed);
        }

        let start = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;

        let permit =
            match tokio::time::timeout_at(deadline, self.slots.clone().acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(LatchError::PoolClosed),
                Err(_) => {
                    self.counters
                        .acquire_timeouts
                        .fetch_add(1, Ordering::Relaxed);
                    return Err(LatchError::PoolTimeout {
                        waited_ms: start.elapsed().as_millis() as u64,
                    });
                }
            };

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return Err(LatchError::PoolClosed);
            }

            let candidate = self.inner.lock().idle.pop_front();
            if let Some(mut record) = candidate {
                if self.validate(&mut record).await {
                    return Ok(self.hand_out(record, permit));
                }
                self.discard(record);
                continue;
            }

            if self.reserve_slot() {
                match self.open_record().await {
                    Ok(record) => return Ok(self.hand_out(record, permit)),
                    Err(e) => {
                        self.inner.lock().total -= 1;
                        return Err(e);
                    }
                }
            }

            // At capacity with nothing idle (a sweep may be holding a
            // record); wait for a release or the deadline.
            if tokio::time::timeout_at(deadline, self.returned.notified())
                .await
                .is_err()
            {
                self.counters
                    .acquire_timeouts
                    .fetch_add(1, Ordering::Relaxed);
                return Err(LatchError::PoolTimeout {
                    waited_ms: start.elapsed().as_millis() as u64,
                });
            }
        }
    }

    fn hand_out(&self, mut record: ConnectionRecord, permit: OwnedSemaphorePermit) -> PooledConnection {
        record.state = ConnectionState::Active;
        record.last_used = Instant::now();
        record.use_count += 1;
        self.inner.lock().active_ids.insert(record.id);
        self.counters.acquired.fetch_add(1, Ordering::Relaxed);
        PooledConnection {
            record: Some(record),
            pool: self.clone(),
            _permit: permit,
        }
    }

    /// Reserve one unit of capacity under the pool lock. The caller must
    /// either open a connection or give the unit back.
    fn reserve_slot(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.total < self.config.max_connections {
            inner.total += 1;
            true
        } else {
            false
        }
    }

    async fn open_record(&self) -> Result<ConnectionRecord> {
        let conn = self.factory.open().await?;
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        Ok(ConnectionRecord {
            id: conn.id(),
            conn,
            created_at: now,
            last_used: now,
            use_count: 0,
            consecutive_errors: 0,
            state: ConnectionState::Idle,
            epoch: self.epoch.load(Ordering::Acquire),
        })
    }

    /// Validation before reuse, in order: unresolved error count, lifetime,
    /// idle duration, pool generation, then a live probe.
    async fn validate(&self, record: &mut ConnectionRecord) -> bool {
        if record.consecutive_errors >= self.config.max_consecutive_errors {
            record.state = ConnectionState::Error;
            return false;
        }
        if record.created_at.elapsed() > self.config.max_lifetime {
            record.state = ConnectionState::Stale;
            return false;
        }
        if record.last_used.elapsed() > self.config.max_idle_time {
            record.state = ConnectionState::Stale;
            return false;
        }
        if record.epoch < self.epoch.load(Ordering::Acquire) {
            record.state = ConnectionState::Stale;
            return false;
        }
        if self.config.validate_with_probe {
            if let Err(e) = record.conn.probe().await {
                warn!(connection_id = record.id, "validation probe failed: {e}");
                record.consecutive_errors += 1;
                record.state = ConnectionState::Error;
                return false;
            }
        }
        true
    }

    /// Remove a connection that is not in any set; the caller already owns it.
    fn discard(&self, record: ConnectionRecord) {
        self.inner.lock().total -= 1;
        self.counters.evicted.fetch_add(1, Ordering::Relaxed);
        self.close_record(record);
        self.returned.notify_one();
    }

    fn close_record(&self, record: ConnectionRecord) {
        debug!(
            connection_id = record.id,
            state = ?record.state,
            use_count = record.use_count,
            "closing pooled connection"
        );
        self.counters.closed.fetch_add(1, Ordering::Relaxed);
        let conn = record.conn;
        // Closing takes the driver lock; keep it off the async threads.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || drop(conn));
            }
            Err(_) => drop(conn),
        }
    }

    /// Return a connection from a guard. Cheap checks only; a failing
    /// connection is closed instead of reused.
    fn release(&self, mut record: ConnectionRecord) {
        let mut inner = self.inner.lock();
        inner.active_ids.remove(&record.id);

        let unhealthy = self.shutdown.load(Ordering::Acquire)
            || record.consecutive_errors >= self.config.max_consecutive_errors
            || record.created_at.elapsed() > self.config.max_lifetime
            || record.epoch < self.epoch.load(Ordering::Acquire);

        if unhealthy {
            inner.total -= 1;
            drop(inner);
            self.counters.evicted.fetch_add(1, Ordering::Relaxed);
            self.close_record(record);
        } else {
            record.state = ConnectionState::Idle;
            record.last_used = Instant::now();
            inner.idle.push_back(record);
            drop(inner);
        }
        self.returned.notify_one();
    }

    /// One maintenance tick: validate idle connections, then apply
    /// utilization-driven sizing and restore the minimum.
    pub async fn run_maintenance(&self) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Ok(());
        }

        // Sweep idle connections one at a time so acquire never sees the
        // whole idle set vanish at once.
        let sweep_len = self.inner.lock().idle.len();
        for _ in 0..sweep_len {
            let candidate = self.inner.lock().idle.pop_front();
            let Some(mut record) = candidate else { break };
            if self.validate(&mut record).await {
                record.state = ConnectionState::Idle;
                self.inner.lock().idle.push_back(record);
                self.returned.notify_one();
            } else {
                self.discard(record);
            }
        }

        if !self.config.dynamic_scaling {
            return self.ensure_min_connections().await;
        }

        // Dynamic sizing with hysteresis.
        let (total, active, idle_count) = {
            let inner = self.inner.lock();
            (inner.total, inner.active_ids.len(), inner.idle.len())
        };
        let utilization = if total == 0 {
            0.0
        } else {
            active as f64 / total as f64
        };

        if utilization > self.config.scale_up_threshold && total < self.config.max_connections {
            if self.reserve_slot() {
                match self.open_record().await {
                    Ok(record) => {
                        debug!(utilization, total = total + 1, "scaled pool up");
                        self.counters
                            .scale_up_events
                            .fetch_add(1, Ordering::Relaxed);
                        self.inner.lock().idle.push_back(record);
                        self.returned.notify_one();
                    }
                    Err(e) => {
                        self.inner.lock().total -= 1;
                        warn!("scale-up connection open failed: {e}");
                    }
                }
            }
        } else if utilization < self.config.scale_down_threshold
            && total > self.config.min_connections
            && idle_count > 0
        {
            let victim = self.inner.lock().idle.pop_back();
            if let Some(record) = victim {
                debug!(utilization, total = total - 1, "scaled pool down");
                self.counters
                    .scale_down_events
                    .fetch_add(1, Ordering::Relaxed);
                self.discard(record);
            }
        }

        self.ensure_min_connections().await
    }

    async fn ensure_min_connections(&self) -> Result<()> {
        loop {
            {
                let inner = self.inner.lock();
                if inner.total >= self.config.min_connections {
                    return Ok(());
                }
            }
            if !self.reserve_slot() {
                return Ok(());
            }
            match self.open_record().await {
                Ok(record) => {
                    self.inner.lock().idle.push_back(record);
                    self.returned.notify_one();
                }
                Err(e) => {
                    self.inner.lock().total -= 1;
                    return Err(e);
                }
            }
        }
    }

    /// Spawn the periodic maintenance loop.
    pub fn start_maintenance(&self) {
        let mut handle_slot = self.maintenance.lock();
        if handle_slot.is_some() {
            return;
        }
        let pool = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(pool.config.maintenance_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if pool.shutdown.load(Ordering::Acquire) {
                    break;
                }
                if let Err(e) = pool.run_maintenance().await {
                    warn!("pool maintenance failed: {e}");
                }
            }
        });
        *handle_slot = Some(handle);
    }

    /// Retire every current connection. Idle ones close now; active ones
    /// close when their guards release them.
    pub async fn reconnect_all(&self) -> Result<()> {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        let drained = self.drain_idle();
        info!(drained, "pool reconnect: retired current generation");
        self.ensure_min_connections().await
    }

    /// Close all idle connections, keeping active ones untouched. Returns
    /// how many were closed.
    pub fn drain_idle(&self) -> usize {
        let records: Vec<ConnectionRecord> = {
            let mut inner = self.inner.lock();
            let drained: Vec<_> = inner.idle.drain(..).collect();
            inner.total -= drained.len();
            drained
        };
        let count = records.len();
        for record in records {
            self.counters.evicted.fetch_add(1, Ordering::Relaxed);
            self.close_record(record);
        }
        if count > 0 {
            self.returned.notify_one();
        }
        count
    }

    pub fn stats(&self) -> PoolStats {
        let (total, idle, active) = {
            let inner = self.inner.lock();
            (inner.total, inner.idle.len(), inner.active_ids.len())
        };
        PoolStats {
            total_connections: total,
            idle_connections: idle,
            active_connections: active,
            min_connections: self.config.min_connections,
            max_connections: self.config.max_connections,
            created_total: self.counters.created.load(Ordering::Relaxed),
            closed_total: self.counters.closed.load(Ordering::Relaxed),
            evicted_total: self.counters.evicted.load(Ordering::Relaxed),
            acquired_total: self.counters.acquired.load(Ordering::Relaxed),
            acquire_timeouts: self.counters.acquire_timeouts.load(Ordering::Relaxed),
            scale_up_events: self.counters.scale_up_events.load(Ordering::Relaxed),
            scale_down_events: self.counters.scale_down_events.load(Ordering::Relaxed),
            utilization: if total == 0 {
                0.0
            } else {
                active as f64 / total as f64
            },
        }
    }

    /// Graceful shutdown: stop maintenance, close idle connections, and fail
    /// pending acquires with [`LatchError::PoolClosed`].
    pub async fn close(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down connection pool");
        if let Some(handle) = self.maintenance.lock().take() {
            handle.abort();
        }
        self.slots.close();
        self.drain_idle();
        self.returned.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// RAII guard for one pooled connection. Releases back to the pool on drop
/// on every exit path.
pub struct PooledConnection {
    record: Option<ConnectionRecord>,
    pool: ConnectionPool,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id())
            .finish()
    }
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.record.as_ref().map(|r| r.id).unwrap_or(0)
    }

    fn record_mut(&mut self) -> Result<&mut ConnectionRecord> {
        self.record.as_mut().ok_or(LatchError::ConnectionClosed)
    }

    /// Execute one statement on this connection, tracking the consecutive
    /// error count used by pool validation.
    pub async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<QueryOutput> {
        let record = self.record_mut()?;
        match record.conn.execute(sql, params).await {
            Ok(output) => {
                record.consecutive_errors = 0;
                Ok(output)
            }
            Err(e) => {
                record.consecutive_errors += 1;
                Err(e)
            }
        }
    }

    /// Execute a batch inside one IMMEDIATE transaction on this connection.
    pub async fn transaction(&mut self, ops: &[Statement]) -> Result<Vec<QueryOutput>> {
        let record = self.record_mut()?;
        match record.conn.transaction(ops).await {
            Ok(outputs) => {
                record.consecutive_errors = 0;
                Ok(outputs)
            }
            Err(e) => {
                record.consecutive_errors += 1;
                Err(e)
            }
        }
    }

    pub async fn probe(&mut self) -> Result<()> {
        let record = self.record_mut()?;
        record.conn.probe().await
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            self.pool.release(record);
        }
    }
}
