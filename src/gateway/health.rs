// ABOUTME: Per-server health probing with hysteresis
//
// One `HealthMonitor` per registered server pings it through its own
// connection pool at a fixed interval and reports the result to the
// registry (status + rolling stats) and the circuit breaker.

//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── HealthMonitor ───────────────────────────┐
//! │  interval tick ──▶ HealthProbe::probe_once                           │
//! │                      │  skip if a probe is already in flight         │
//! │                      ├─ pool.acquire_for_probe() + ping (timeout)    │
//! │                      ├─▶ registry.update_health(Probe, outcome)      │
//! │                      ├─▶ breaker.report_outcome(outcome)             │
//! │                      └─▶ pools.mark_healthy() on success             │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::breaker::CircuitBreaker;
use super::error::RoutingError;
use super::metrics::duration_ms;
use super::pool::PoolManager;
use super::record::{HealthStatus, Outcome, ServerId};
use super::registry::{HealthUpdate, ServerRegistry, UpdateSource};
use crate::config::HealthConfig;

// === Hysteresis ===

/// Consecutive-result thresholds for health transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HysteresisPolicy {
    /// Failures for healthy/unknown -> degraded
    pub degrade_after: u32,
    /// Further failures for degraded -> unhealthy
    pub unhealthy_after: u32,
    /// Successes for degraded/unhealthy -> healthy
    pub recover_after: u32,
}

impl Default for HysteresisPolicy {
    fn default() -> Self {
        Self {
            degrade_after: 2,
            unhealthy_after: 2,
            recover_after: 2,
        }
    }
}

impl From<&HealthConfig> for HysteresisPolicy {
    fn from(config: &HealthConfig) -> Self {
        Self {
            degrade_after: config.degrade_after.max(1),
            unhealthy_after: config.unhealthy_after.max(1),
            recover_after: config.recover_after.max(1),
        }
    }
}

/// Consecutive probe results for one server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthTracker {
    consecutive_failures: u32,
    consecutive_successes: u32,
}

impl HealthTracker {
    /// Fold one probe result in and return the resulting status.
    /// Counters reset whenever the status changes.
    pub fn observe(&mut self, current: HealthStatus, success: bool, policy: &HysteresisPolicy) -> HealthStatus {
        if current == HealthStatus::Maintenance {
            self.reset();
            return current;
        }

        let next = if success {
            self.consecutive_failures = 0;
            self.consecutive_successes += 1;
            match current {
                HealthStatus::Unknown => HealthStatus::Healthy,
                HealthStatus::Degraded | HealthStatus::Unhealthy
                    if self.consecutive_successes >= policy.recover_after =>
                {
                    HealthStatus::Healthy
                }
                other => other,
            }
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures += 1;
            match current {
                HealthStatus::Healthy | HealthStatus::Unknown
                    if self.consecutive_failures >= policy.degrade_after =>
                {
                    HealthStatus::Degraded
                }
                HealthStatus::Degraded if self.consecutive_failures >= policy.unhealthy_after => {
                    HealthStatus::Unhealthy
                }
                other => other,
            }
        };

        if next != current {
            self.reset();
        }
        next
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub const fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub const fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes
    }
}

// === Probe ===

/// Result of one probe attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    Healthy { latency: Duration },
    Failed { error: String },
    TimedOut,
    /// Nothing was reported: a probe was already running, or the pool had
    /// no connection to spare
    Skipped,
}

impl ProbeResult {
    pub const fn outcome(&self) -> Option<Outcome> {
        match self {
            Self::Healthy { .. } => Some(Outcome::Success),
            Self::Failed { .. } => Some(Outcome::Failure),
            Self::TimedOut => Some(Outcome::Timeout),
            Self::Skipped => None,
        }
    }
}

/// Everything needed to probe one server.
pub struct HealthProbe {
    server_id: ServerId,
    timeout: Duration,
    registry: Arc<ServerRegistry>,
    breaker: Arc<CircuitBreaker>,
    pools: Arc<PoolManager>,
    in_flight: AtomicBool,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl HealthProbe {
    pub fn new(
        server_id: ServerId,
        timeout: Duration,
        registry: Arc<ServerRegistry>,
        breaker: Arc<CircuitBreaker>,
        pools: Arc<PoolManager>,
    ) -> Self {
        Self {
            server_id,
            timeout,
            registry,
            breaker,
            pools,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Ping the server once and report the result.
    pub async fn probe_once(&self) -> ProbeResult {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            debug!(server = %self.server_id, "Previous probe still running, skipping");
            return ProbeResult::Skipped;
        }
        let _in_flight = InFlight(&self.in_flight);

        let Ok(pool) = self.pools.pool(self.pools.default_pool_name()) else {
            return ProbeResult::Skipped;
        };

        // Acquisition is bounded by the pool's own acquire timeout; the
        // probe timeout covers the ping.
        let started = Instant::now();
        let result = match pool.acquire_for_probe().await {
            Err(e @ (RoutingError::Transport { .. } | RoutingError::Timeout { .. })) => {
                ProbeResult::Failed { error: e.to_string() }
            }
            Err(e) => {
                // A full or closing pool says nothing about the server
                debug!(server = %self.server_id, reason = e.reason(), "No connection for probe, skipping");
                ProbeResult::Skipped
            }
            Ok(mut conn) => match tokio::time::timeout(self.timeout, conn.ping()).await {
                Ok(Ok(())) => ProbeResult::Healthy {
                    latency: started.elapsed(),
                },
                Ok(Err(e)) => {
                    conn.mark_broken();
                    ProbeResult::Failed { error: e.to_string() }
                }
                Err(_) => {
                    conn.mark_broken();
                    ProbeResult::TimedOut
                }
            },
        };

        self.report(&result);
        result
    }

    fn report(&self, result: &ProbeResult) {
        let Some(outcome) = result.outcome() else {
            return;
        };
        let latency = match result {
            ProbeResult::Healthy { latency } => Some(*latency),
            _ => None,
        };

        self.registry.update_health(
            &self.server_id,
            HealthUpdate {
                source: UpdateSource::Probe,
                outcome,
                latency,
            },
        );
        self.breaker.report_outcome(outcome);

        match result {
            ProbeResult::Healthy { latency } => {
                debug!(server = %self.server_id, latency_ms = duration_ms(*latency), "Probe succeeded");
                self.pools.mark_healthy();
            }
            ProbeResult::Failed { error } => {
                warn!(server = %self.server_id, error = %error, "Probe failed");
            }
            ProbeResult::TimedOut => {
                warn!(server = %self.server_id, timeout_ms = duration_ms(self.timeout), "Probe timed out");
            }
            ProbeResult::Skipped => {}
        }
    }
}

// === Monitor ===

/// Scheduled probing task for one server, cancelled on deregistration.
pub struct HealthMonitor {
    probe: Arc<HealthProbe>,
    interval: Duration,
    shutdown: Arc<Notify>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    /// The interval is floored and the probe timeout clamped per `config`.
    pub fn new(
        server_id: ServerId,
        config: &HealthConfig,
        registry: Arc<ServerRegistry>,
        breaker: Arc<CircuitBreaker>,
        pools: Arc<PoolManager>,
    ) -> Self {
        let probe = HealthProbe::new(
            server_id,
            config.effective_probe_timeout(),
            registry,
            breaker,
            pools,
        );
        Self {
            probe: Arc::new(probe),
            interval: config.effective_interval(),
            shutdown: Arc::new(Notify::new()),
            handle: Mutex::new(None),
        }
    }

    pub fn probe(&self) -> &Arc<HealthProbe> {
        &self.probe
    }

    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Start the probing loop; the first probe runs immediately.
    pub fn start(&self) {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if handle.is_some() {
            return;
        }

        let probe = Arc::clone(&self.probe);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.interval;
        *handle = Some(tokio::spawn(async move {
            Self::probe_loop(probe, interval, shutdown).await;
        }));
        info!(
            server = %self.probe.server_id,
            interval_secs = self.interval.as_secs(),
            "Health monitor started"
        );
    }

    async fn probe_loop(probe: Arc<HealthProbe>, interval: Duration, shutdown: Arc<Notify>) {
        let mut ticker = tokio::time::interval_at(Instant::now(), interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = shutdown.notified() => break,
                _ = ticker.tick() => {
                    probe.probe_once().await;
                }
            }
        }
        debug!(server = %probe.server_id, "Health monitor loop exited");
    }

    /// Stop the loop, waiting briefly for an in-progress probe.
    pub async fn stop(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut handle) = handle else {
            return;
        };

        self.shutdown.notify_one();
        if tokio::time::timeout(Duration::from_secs(5), &mut handle).await.is_err() {
            handle.abort();
        }
        info!(server = %self.probe.server_id, "Health monitor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self
            .handle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}
