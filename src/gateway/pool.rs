// ABOUTME: Bounded per-server connection pools with idle reclamation
//
// Each server owns a `PoolManager`, which lazily creates one
// `ConnectionPool` per pool name. Connections are handed out as
// `PooledConnection` guards that return them to the pool on drop, so a
// cancelled or failed request can never leak a slot.

//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                 PoolManager (one per server)             │
//! │  pools: HashMap<String, Arc<ConnectionPool>>             │
//! │     - "http"  -> ConnectionPool { idle, active, pending }│
//! │     - "admin" -> ConnectionPool { ... }                  │
//! │                                                          │
//! │  acquire():  idle  ->  create (active + idle < max)      │
//! │                    ->  wait for release (acquire timeout)│
//! └──────────────────────────────────────────────────────────┘
//! ```

use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::error::{RoutingError, Stage};
use super::metrics::{duration_ms, AtomicEma, DEFAULT_SMOOTHING};
use super::record::ServerId;
use super::telemetry::{TelemetryEvent, TelemetryKind, TelemetrySink};
use super::transport::{CallError, Connection, Connector, McpRequest, ServerTarget};
use crate::config::PoolConfig;

struct IdleConnection {
    conn: Box<dyn Connection>,
    idle_since: Instant,
}

#[derive(Default)]
struct PoolState {
    /// Oldest at the front; reuse pops from the back
    idle: VecDeque<IdleConnection>,
    /// Handed-out connections plus slots reserved for connects in progress
    active: usize,
    pending: usize,
    closed: bool,
}

/// Point-in-time view of one pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolSnapshot {
    /// Pool name, unique per server
    pub name: String,
    /// Connections kept warm
    pub min_size: usize,
    /// Upper bound on open connections
    pub max_size: usize,
    /// Connections checked out
    pub active: usize,
    /// Connections ready for reuse
    pub idle: usize,
    /// Callers waiting for a connection
    pub pending: usize,
    /// Whether the last health signal was good
    pub healthy: bool,
    /// Set once the pool has been shut down
    pub closed: bool,
    /// Connections ever opened
    pub total_created: u64,
    /// Connections discarded or reaped
    pub total_closed: u64,
    /// Connect or call errors
    pub total_errors: u64,
    /// Callers that gave up waiting for a slot
    pub total_acquire_timeouts: u64,
    /// Connect attempts that timed out
    pub total_timeouts: u64,
    /// Mean time to open a connection
    pub avg_connect_time_ms: Option<f64>,
}

/// Bounded pool of connections to one server.
pub struct ConnectionPool {
    name: String,
    target: ServerTarget,
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    telemetry: Arc<dyn TelemetrySink>,
    state: Mutex<PoolState>,
    released: Notify,
    healthy: AtomicBool,
    total_created: AtomicU64,
    total_closed: AtomicU64,
    total_errors: AtomicU64,
    total_acquire_timeouts: AtomicU64,
    total_timeouts: AtomicU64,
    connect_time: AtomicEma,
    /// Connections in use, shared with the registry record
    in_use: Arc<AtomicU32>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("server_id", &self.target.server_id)
            .field("name", &self.name)
            .field("healthy", &self.is_healthy())
            .finish_non_exhaustive()
    }
}

enum Take {
    Idle(Box<dyn Connection>),
    Reserved,
    Full,
}

impl ConnectionPool {
    pub fn new(
        name: impl Into<String>,
        target: ServerTarget,
        config: PoolConfig,
        connector: Arc<dyn Connector>,
        telemetry: Arc<dyn TelemetrySink>,
        in_use: Arc<AtomicU32>,
    ) -> Self {
        Self {
            name: name.into(),
            target,
            config,
            connector,
            telemetry,
            state: Mutex::new(PoolState::default()),
            released: Notify::new(),
            healthy: AtomicBool::new(true),
            total_created: AtomicU64::new(0),
            total_closed: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            total_acquire_timeouts: AtomicU64::new(0),
            total_timeouts: AtomicU64::new(0),
            connect_time: AtomicEma::new(DEFAULT_SMOOTHING),
            in_use,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server_id(&self) -> &ServerId {
        &self.target.server_id
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Get a connection: idle first, then a new one while below `max_size`,
    /// otherwise wait for a release up to the acquire timeout.
    ///
    /// # Errors
    ///
    /// - `PoolUnhealthy` immediately while the pool is marked unhealthy
    /// - `PoolExhausted` when no connection was released in time
    /// - `Transport` when establishing a new connection fails
    /// - `Timeout` (acquire stage) when connecting outlives the deadline
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection, RoutingError> {
        if !self.is_healthy() {
            return Err(RoutingError::PoolUnhealthy {
                server_id: self.target.server_id.clone(),
            });
        }
        self.acquire_inner().await
    }

    /// Acquire ignoring the unhealthy flag; health probes are what clear it.
    ///
    /// # Errors
    ///
    /// Same as [`acquire`](Self::acquire) minus `PoolUnhealthy`.
    pub async fn acquire_for_probe(self: &Arc<Self>) -> Result<PooledConnection, RoutingError> {
        self.acquire_inner().await
    }

    async fn acquire_inner(self: &Arc<Self>) -> Result<PooledConnection, RoutingError> {
        let started = Instant::now();
        let deadline = started + self.config.acquire_timeout;
        let mut waiting: Option<PendingGuard<'_>> = None;

        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a release in between is not missed
            notified.as_mut().enable();

            match self.try_take()? {
                Take::Idle(conn) => return Ok(PooledConnection::new(Arc::clone(self), conn)),
                Take::Reserved => {
                    let slot = SlotReservation { pool: self, armed: true };
                    return self.open_connection(slot, deadline).await;
                }
                Take::Full => {}
            }

            if waiting.is_none() {
                waiting = Some(PendingGuard::new(self));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let waited = started.elapsed();
                let total = self.total_acquire_timeouts.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    server = %self.target.server_id,
                    pool = %self.name,
                    waited_ms = duration_ms(waited),
                    "Connection pool exhausted"
                );
                self.telemetry.emit(
                    TelemetryEvent::new(TelemetryKind::PoolExhausted, &self.target.server_id)
                        .with_detail(self.name.clone())
                        .with_counter("max_size", self.config.max_size as u64)
                        .with_counter("total_acquire_timeouts", total),
                );
                return Err(RoutingError::PoolExhausted {
                    server_id: self.target.server_id.clone(),
                    waited,
                });
            }
        }
    }

    fn try_take(&self) -> Result<Take, RoutingError> {
        let mut discarded = Vec::new();
        let take = {
            let mut state = self.lock();
            if state.closed {
                return Err(RoutingError::ServerRemoved {
                    server_id: self.target.server_id.clone(),
                });
            }

            let mut taken = None;
            while let Some(idle) = state.idle.pop_back() {
                if idle.conn.is_open() {
                    taken = Some(idle.conn);
                    break;
                }
                discarded.push(idle.conn);
            }

            if let Some(conn) = taken {
                state.active += 1;
                Take::Idle(conn)
            } else if state.active + state.idle.len() < self.config.max_size {
                state.active += 1;
                Take::Reserved
            } else {
                Take::Full
            }
        };

        if !discarded.is_empty() {
            self.total_closed.fetch_add(discarded.len() as u64, Ordering::Relaxed);
        }
        Ok(take)
    }

    async fn open_connection(
        self: &Arc<Self>,
        mut slot: SlotReservation<'_>,
        deadline: Instant,
    ) -> Result<PooledConnection, RoutingError> {
        let started = Instant::now();
        let connect = self.connector.connect(&self.target);

        match tokio::time::timeout_at(deadline, connect).await {
            Ok(Ok(conn)) => {
                slot.armed = false;
                let created = self.total_created.fetch_add(1, Ordering::Relaxed) + 1;
                let avg = self.connect_time.record(duration_ms(started.elapsed()));
                debug!(
                    server = %self.target.server_id,
                    pool = %self.name,
                    total_created = created,
                    avg_connect_ms = avg,
                    "Opened new connection"
                );
                Ok(PooledConnection::new(Arc::clone(self), conn))
            }
            Ok(Err(e)) => {
                drop(slot);
                self.total_errors.fetch_add(1, Ordering::Relaxed);
                self.mark_unhealthy(&e.to_string());
                Err(RoutingError::Transport {
                    server_id: self.target.server_id.clone(),
                    message: e.to_string(),
                })
            }
            Err(_) => {
                drop(slot);
                self.total_errors.fetch_add(1, Ordering::Relaxed);
                Err(RoutingError::Timeout {
                    server_id: self.target.server_id.clone(),
                    stage: Stage::Acquire,
                    elapsed: started.elapsed(),
                })
            }
        }
    }

    fn give_back(&self, conn: Box<dyn Connection>, broken: bool) {
        let discarded = {
            let mut state = self.lock();
            state.active = state.active.saturating_sub(1);
            if state.closed || broken || !conn.is_open() {
                Some(conn)
            } else {
                state.idle.push_back(IdleConnection {
                    conn,
                    idle_since: Instant::now(),
                });
                None
            }
        };
        if discarded.is_some() {
            self.total_closed.fetch_add(1, Ordering::Relaxed);
        }
        self.released.notify_one();
    }

    fn release_slot(&self) {
        {
            let mut state = self.lock();
            state.active = state.active.saturating_sub(1);
        }
        self.released.notify_one();
    }

    /// Stop handing out connections until [`mark_healthy`](Self::mark_healthy).
    /// Idle connections are closed.
    pub fn mark_unhealthy(&self, reason: &str) {
        if !self.healthy.swap(false, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<_> = self.lock().idle.drain(..).collect();
        self.total_closed.fetch_add(drained.len() as u64, Ordering::Relaxed);

        warn!(
            server = %self.target.server_id,
            pool = %self.name,
            reason,
            "Connection pool marked unhealthy"
        );
        self.telemetry.emit(
            TelemetryEvent::new(TelemetryKind::PoolHealthChanged, &self.target.server_id)
                .with_detail(format!("{}: unhealthy ({reason})", self.name))
                .with_counter("total_errors", self.total_errors.load(Ordering::Relaxed)),
        );
    }

    pub fn mark_healthy(&self) {
        if self.healthy.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(server = %self.target.server_id, pool = %self.name, "Connection pool healthy again");
        self.telemetry.emit(
            TelemetryEvent::new(TelemetryKind::PoolHealthChanged, &self.target.server_id)
                .with_detail(format!("{}: healthy", self.name)),
        );
    }

    /// Count an outbound call that exceeded the processing timeout.
    pub fn record_timeout(&self) {
        self.total_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Close idle connections past the idle timeout, keeping `min_size`.
    pub fn reap_idle(&self) -> usize {
        let reaped: Vec<IdleConnection> = {
            let mut state = self.lock();
            let mut reaped = Vec::new();
            while state.idle.len() > self.config.min_size {
                match state.idle.front() {
                    Some(oldest) if oldest.idle_since.elapsed() >= self.config.idle_timeout => {
                        reaped.extend(state.idle.pop_front());
                    }
                    _ => break,
                }
            }
            reaped
        };

        if !reaped.is_empty() {
            self.total_closed.fetch_add(reaped.len() as u64, Ordering::Relaxed);
            debug!(
                server = %self.target.server_id,
                pool = %self.name,
                reaped = reaped.len(),
                "Reclaimed idle connections"
            );
        }
        reaped.len()
    }

    /// Close the pool: idle connections are dropped, waiters fail and
    /// connections in use are closed when returned.
    pub fn close(&self) -> usize {
        let drained: Vec<_> = {
            let mut state = self.lock();
            state.closed = true;
            state.idle.drain(..).collect()
        };
        self.total_closed.fetch_add(drained.len() as u64, Ordering::Relaxed);
        self.released.notify_waiters();
        drained.len()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.lock();
        PoolSnapshot {
            name: self.name.clone(),
            min_size: self.config.min_size,
            max_size: self.config.max_size,
            active: state.active,
            idle: state.idle.len(),
            pending: state.pending,
            healthy: self.is_healthy(),
            closed: state.closed,
            total_created: self.total_created.load(Ordering::Relaxed),
            total_closed: self.total_closed.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            total_acquire_timeouts: self.total_acquire_timeouts.load(Ordering::Relaxed),
            total_timeouts: self.total_timeouts.load(Ordering::Relaxed),
            avg_connect_time_ms: self.connect_time.get(),
        }
    }
}

/// Counts a caller waiting for a release.
struct PendingGuard<'a> {
    pool: &'a ConnectionPool,
}

impl<'a> PendingGuard<'a> {
    fn new(pool: &'a ConnectionPool) -> Self {
        pool.lock().pending += 1;
        Self { pool }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.pool.lock();
        state.pending = state.pending.saturating_sub(1);
    }
}

/// A slot reserved for a connect in progress; freed unless disarmed.
struct SlotReservation<'a> {
    pool: &'a ConnectionPool,
    armed: bool,
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.release_slot();
        }
    }
}

// === Pooled Connection Guard ===

/// A connection checked out of a pool. Dropping it returns the connection
/// (or closes it when marked broken).
pub struct PooledConnection {
    pool: Arc<ConnectionPool>,
    conn: Option<Box<dyn Connection>>,
    broken: bool,
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.pool.name)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    fn new(pool: Arc<ConnectionPool>, conn: Box<dyn Connection>) -> Self {
        pool.in_use.fetch_add(1, Ordering::Relaxed);
        Self {
            pool,
            conn: Some(conn),
            broken: false,
        }
    }

    fn connection(&mut self) -> Result<&mut Box<dyn Connection>, CallError> {
        self.conn
            .as_mut()
            .ok_or_else(|| CallError::Transport("connection already released".to_string()))
    }

    pub async fn call(&mut self, request: &McpRequest) -> Result<Value, CallError> {
        self.connection()?.call(request).await
    }

    pub async fn ping(&mut self) -> Result<(), CallError> {
        self.connection()?.ping().await
    }

    /// Close instead of returning to the pool.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Return the connection to the pool now.
    pub fn release(self) {}

    /// Close the connection now.
    pub fn discard(mut self) {
        self.broken = true;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.in_use.fetch_sub(1, Ordering::Relaxed);
            self.pool.give_back(conn, self.broken);
        }
    }
}

// === Pool Manager ===

/// Lazily created named pools for one server.
pub struct PoolManager {
    target: ServerTarget,
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    telemetry: Arc<dyn TelemetrySink>,
    in_use: Arc<AtomicU32>,
    pools: RwLock<HashMap<String, Arc<ConnectionPool>>>,
    closed: AtomicBool,
}

impl fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolManager")
            .field("server_id", &self.target.server_id)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl PoolManager {
    pub fn new(
        target: ServerTarget,
        config: PoolConfig,
        connector: Arc<dyn Connector>,
        telemetry: Arc<dyn TelemetrySink>,
        in_use: Arc<AtomicU32>,
    ) -> Self {
        Self {
            target,
            config,
            connector,
            telemetry,
            in_use,
            pools: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Pool used when a request does not name one.
    pub fn default_pool_name(&self) -> &'static str {
        self.target.transport.as_str()
    }

    /// Get the named pool, creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns `ServerRemoved` once the manager has been closed.
    pub fn pool(&self, name: &str) -> Result<Arc<ConnectionPool>, RoutingError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RoutingError::ServerRemoved {
                server_id: self.target.server_id.clone(),
            });
        }
        if let Some(pool) = self.get(name) {
            return Ok(pool);
        }

        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        let pool = pools.entry(name.to_string()).or_insert_with(|| {
            debug!(server = %self.target.server_id, pool = name, "Creating connection pool");
            Arc::new(ConnectionPool::new(
                name,
                self.target.clone(),
                self.config.clone(),
                Arc::clone(&self.connector),
                Arc::clone(&self.telemetry),
                Arc::clone(&self.in_use),
            ))
        });
        Ok(Arc::clone(pool))
    }

    pub fn get(&self, name: &str) -> Option<Arc<ConnectionPool>> {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn all(&self) -> Vec<Arc<ConnectionPool>> {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Whether the named pool exists and is marked unhealthy.
    pub fn is_unhealthy(&self, name: &str) -> bool {
        self.get(name).is_some_and(|pool| !pool.is_healthy())
    }

    pub fn mark_unhealthy(&self, reason: &str) {
        for pool in self.all() {
            pool.mark_unhealthy(reason);
        }
    }

    pub fn mark_healthy(&self) {
        for pool in self.all() {
            pool.mark_healthy();
        }
    }

    pub fn reap_idle(&self) -> usize {
        self.all().iter().map(|pool| pool.reap_idle()).sum()
    }

    /// Close every pool; later `pool()` calls fail with `ServerRemoved`.
    pub fn close(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        self.all().iter().map(|pool| pool.close()).sum()
    }

    /// Connections currently handed out across all pools.
    pub fn active_connections(&self) -> u32 {
        self.in_use.load(Ordering::Relaxed)
    }

    pub fn snapshots(&self) -> Vec<PoolSnapshot> {
        let mut snapshots: Vec<_> = self.all().iter().map(|pool| pool.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}
