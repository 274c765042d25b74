// ABOUTME: MCP gateway routing core: registry, health, breakers, pools, queues and routing
//
// A `Gateway` is an explicit handle created at startup and drained at
// shutdown. Every registered server owns an independent runtime bundle
// (breaker, pools, queue, dispatcher task, health task) stored behind an
// `Arc` in a map keyed by server id; the map lock is only held to clone
// or swap those `Arc`s.
//
//! # Architecture
//!
//! ```text
//!  route(principal, request)
//!        │
//!        ▼
//!  ┌───────────────┐  lookup   ┌────────────────┐
//!  │    Router     │──────────▶│ ServerRegistry │◀── update_health ──┐
//!  └───────┬───────┘           └────────────────┘                    │
//!          │ enqueue (per candidate)                                  │
//!          ▼                                                         │
//!  ┌───────────────┐  next   ┌────────────┐ check ┌──────────────┐   │
//!  │ RequestQueue  │────────▶│ Dispatcher │──────▶│CircuitBreaker│   │
//!  └───────────────┘         └─────┬──────┘       └──────────────┘   │
//!                                  │ acquire / call / release        │
//!                                  ▼                                 │
//!                           ┌─────────────┐  ping  ┌──────────────┐  │
//!                           │ PoolManager │◀───────│HealthMonitor │──┘
//!                           └─────────────┘        └──────────────┘
//! ```

pub mod admin;
pub mod auth;
pub mod breaker;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod http;
pub mod metrics;
pub mod persistence;
pub mod pool;
pub mod queue;
pub mod rate_limit;
pub mod record;
pub mod registry;
pub mod router;
pub mod telemetry;
pub mod transport;

pub use admin::{AdminControl, GatewaySnapshot, ServerSnapshot};
pub use auth::{Principal, ADMIN_ROLE};
pub use breaker::{BreakerSnapshot, BreakerState, CircuitBreaker};
pub use error::{AdminError, GatewayError, RegistryError, RoutingError, Stage};
pub use persistence::{JsonlStore, RegistryStore, StaticStore, StoreError};
pub use queue::Priority;
pub use record::{
    HealthStatus, Outcome, ServerId, ServerRecord, ServerRegistration, TenantId, TransportKind,
};
pub use router::RouteRequest;
pub use telemetry::{ChannelTelemetry, MemoryTelemetry, NoopTelemetry, TelemetryEvent, TelemetryKind, TelemetrySink};
pub use transport::{CallError, Connection, Connector, McpRequest};

use chrono::Utc;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use dispatch::{Dispatcher, PendingCall};
use health::{HealthMonitor, HysteresisPolicy};
use metrics::GatewayMetrics;
use persistence::{PersistenceWriter, RegistryEvent};
use pool::PoolManager;
use queue::RequestQueue;
use registry::ServerRegistry;
use transport::ServerTarget;

/// Result of a deregistration request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeregisterOutcome {
    /// This call removed the server
    Removed,
    /// The server was already gone, or another call removed it
    AlreadyRemoved,
}

/// Per-server state bundle.
struct ServerRuntime {
    id: ServerId,
    breaker: Arc<CircuitBreaker>,
    pools: Arc<PoolManager>,
    queue: Arc<RequestQueue<PendingCall>>,
    dispatcher: Arc<Dispatcher>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
    monitor: HealthMonitor,
    deregistering: AtomicBool,
    removed: watch::Sender<bool>,
}

impl ServerRuntime {
    /// Stop admitting, drain in-flight work up to `grace`, then stop the
    /// background tasks and close every connection. Returns whether the
    /// queue drained in time.
    async fn teardown(&self, grace: Duration) -> bool {
        for entry in self.queue.close() {
            entry.payload.reject(RoutingError::ServerRemoved {
                server_id: self.id.clone(),
            });
        }

        let drained = self.queue.wait_idle(grace).await;
        if !drained {
            warn!(
                server = %self.id,
                in_flight = self.queue.in_flight(),
                grace_ms = grace.as_millis() as u64,
                "Drain grace expired with requests still in flight"
            );
        }

        self.monitor.stop().await;

        let task = self
            .dispatch_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut task) = task {
            if tokio::time::timeout(Duration::from_secs(1), &mut task).await.is_err() {
                task.abort();
            }
        }

        let closed = self.pools.close();
        debug!(server = %self.id, connections = closed, "Server runtime torn down");
        drained
    }
}

struct GatewayInner {
    config: GatewayConfig,
    registry: Arc<ServerRegistry>,
    runtimes: RwLock<HashMap<ServerId, Arc<ServerRuntime>>>,
    connector: Arc<dyn Connector>,
    telemetry: Arc<dyn TelemetrySink>,
    store: Arc<dyn RegistryStore>,
    persistence: PersistenceWriter,
    metrics: GatewayMetrics,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl GatewayInner {
    fn runtime(&self, id: &ServerId) -> Option<Arc<ServerRuntime>> {
        self.runtimes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn all_runtimes(&self) -> Vec<Arc<ServerRuntime>> {
        self.runtimes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn install(&self, registration: ServerRegistration) -> Result<ServerId, RegistryError> {
        let id = self.registry.register(registration)?;
        let (Some(registration), Some(gauge)) = (
            self.registry.registration(&id),
            self.registry.connection_gauge(&id),
        ) else {
            return Err(RegistryError::NotFound(id));
        };

        let target = ServerTarget {
            server_id: id.clone(),
            endpoint: registration.endpoint.clone(),
            transport: registration.transport,
        };
        let breaker = Arc::new(CircuitBreaker::new(
            id.clone(),
            self.config.breaker.clone(),
            Arc::clone(&self.telemetry),
        ));
        let pools = Arc::new(PoolManager::new(
            target,
            self.config.pool.clone(),
            Arc::clone(&self.connector),
            Arc::clone(&self.telemetry),
            gauge,
        ));
        let queue = Arc::new(RequestQueue::new(
            id.clone(),
            self.config.queue.clone(),
            self.config.rate_limit.clone(),
            self.config.health.smoothing,
            Arc::clone(&self.telemetry),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            id.clone(),
            Arc::clone(&queue),
            Arc::clone(&breaker),
            Arc::clone(&pools),
            Arc::clone(&self.registry),
            self.config.max_concurrent(),
        ));
        let monitor = HealthMonitor::new(
            id.clone(),
            &self.config.health,
            Arc::clone(&self.registry),
            Arc::clone(&breaker),
            Arc::clone(&pools),
        );

        let dispatch_task = Arc::clone(&dispatcher).spawn();
        if self.config.health.enabled {
            monitor.start();
        }

        let runtime = Arc::new(ServerRuntime {
            id: id.clone(),
            breaker,
            pools,
            queue,
            dispatcher,
            dispatch_task: Mutex::new(Some(dispatch_task)),
            monitor,
            deregistering: AtomicBool::new(false),
            removed: watch::channel(false).0,
        });
        self.runtimes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), runtime);
        Ok(id)
    }

    async fn sweep_loop(inner: Weak<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let mut reaped = 0;
            let mut pruned = 0;
            for runtime in inner.all_runtimes() {
                reaped += runtime.pools.reap_idle();
                pruned += runtime.queue.rate_limiter().prune_idle();
            }
            if reaped > 0 || pruned > 0 {
                debug!(reaped, pruned, "Idle sweep");
            }
        }
    }
}

/// Handle to a running gateway. Cheap to clone.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("servers", &self.inner.registry.len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Gateway`]; unset seams get production defaults.
pub struct GatewayBuilder {
    config: GatewayConfig,
    connector: Option<Arc<dyn Connector>>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    store: Option<Arc<dyn RegistryStore>>,
}

impl GatewayBuilder {
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    #[must_use]
    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    #[must_use]
    pub fn store(mut self, store: Arc<dyn RegistryStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Build the gateway. Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the default HTTP connector cannot be created.
    pub fn build(self) -> Result<Gateway, GatewayError> {
        let config = self.config;
        let connector: Arc<dyn Connector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(http::HttpConnector::new(config.queue.processing_timeout)?),
        };
        let telemetry = self.telemetry.unwrap_or_else(|| Arc::new(NoopTelemetry));
        let store: Arc<dyn RegistryStore> = match (self.store, &config.persistence.jsonl_path) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(JsonlStore::new(path)),
            (None, None) => Arc::new(StaticStore::default()),
        };

        let registry = Arc::new(ServerRegistry::new(
            HysteresisPolicy::from(&config.health),
            config.health.smoothing,
            Arc::clone(&telemetry),
        ));
        let persistence = PersistenceWriter::spawn(Arc::clone(&store), config.persistence.channel_capacity);

        Ok(Gateway {
            inner: Arc::new(GatewayInner {
                config,
                registry,
                runtimes: RwLock::new(HashMap::new()),
                connector,
                telemetry,
                store,
                persistence,
                metrics: GatewayMetrics::new(),
                sweeper: Mutex::new(None),
            }),
        })
    }
}

impl Gateway {
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder {
            config,
            connector: None,
            telemetry: None,
            store: None,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.inner.registry
    }

    pub fn metrics(&self) -> metrics::GatewayMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Admin surface bound to this gateway.
    pub fn admin(&self) -> AdminControl {
        AdminControl::new(self.clone())
    }

    /// Register configured servers, replay persisted ones and start the
    /// idle sweep.
    ///
    /// # Errors
    ///
    /// Fails if the store cannot be read or a configured server is rejected.
    pub async fn start(&self) -> Result<(), GatewayError> {
        for registration in self.inner.config.servers.clone() {
            let name = registration.name.clone();
            self.inner
                .install(registration)
                .map_err(|source| GatewayError::Registration { name, source })?;
        }

        let persisted = self.inner.store.load_servers().await?;
        for registration in persisted {
            let name = registration.name.clone();
            if let Err(e) = self.inner.install(registration) {
                warn!(name = %name, error = %e, "Skipping persisted server");
            }
        }

        let mut sweeper = self.inner.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if sweeper.is_none() {
            let interval = self.inner.config.pool.sweep_interval.max(Duration::from_secs(1));
            *sweeper = Some(tokio::spawn(GatewayInner::sweep_loop(
                Arc::downgrade(&self.inner),
                interval,
            )));
        }
        info!(servers = self.inner.registry.len(), "Gateway started");
        Ok(())
    }

    /// Register a server and start its runtime. The registration is
    /// persisted in the background.
    ///
    /// # Errors
    ///
    /// `InvalidRegistration` or `Conflict` from the registry.
    pub fn register(&self, registration: ServerRegistration) -> Result<ServerId, RegistryError> {
        let id = self.inner.install(registration)?;
        if let Some(stored) = self.inner.registry.registration(&id) {
            self.inner.persistence.submit(RegistryEvent::Registered {
                registration: stored,
                at: Utc::now(),
            });
        }
        Ok(id)
    }

    /// Remove a server: maintenance, drain up to the grace period, tear
    /// down its tasks and pools, then drop the record. Safe to call
    /// concurrently and repeatedly.
    pub async fn deregister(&self, id: &ServerId) -> DeregisterOutcome {
        let Some(runtime) = self.inner.runtime(id) else {
            return DeregisterOutcome::AlreadyRemoved;
        };

        if runtime.deregistering.swap(true, Ordering::AcqRel) {
            let mut removed = runtime.removed.subscribe();
            let _ = removed.wait_for(|done| *done).await;
            return DeregisterOutcome::AlreadyRemoved;
        }

        info!(server = %id, "Deregistering server");
        if let Err(e) = self.inner.registry.set_maintenance(id, true) {
            debug!(server = %id, error = %e, "Server vanished before maintenance");
        }

        runtime.teardown(self.inner.config.router.drain_grace).await;

        self.inner
            .runtimes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        let record = self.inner.registry.remove(id);

        let mut event = TelemetryEvent::new(TelemetryKind::ServerDeregistered, id);
        if let Some(tenant) = record.as_ref().and_then(|r| r.tenant.as_ref()) {
            event = event.with_tenant(tenant);
        }
        self.inner.telemetry.emit(event);
        self.inner.persistence.submit(RegistryEvent::Deregistered {
            server_id: id.clone(),
            at: Utc::now(),
        });
        info!(server = %id, "Server deregistered");

        runtime.removed.send_replace(true);
        DeregisterOutcome::Removed
    }

    /// Drain every server and stop background tasks. Registrations are
    /// left in the store so they come back on the next start.
    pub async fn shutdown(&self) {
        if let Some(sweeper) = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            sweeper.abort();
        }

        let runtimes: Vec<_> = self
            .inner
            .runtimes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, runtime)| runtime)
            .collect();
        let grace = self.inner.config.router.drain_grace;
        join_all(runtimes.iter().map(|runtime| runtime.teardown(grace))).await;
        for runtime in &runtimes {
            runtime.removed.send_replace(true);
        }

        self.inner.persistence.shutdown().await;
        info!(servers = runtimes.len(), "Gateway shut down");
    }
}
