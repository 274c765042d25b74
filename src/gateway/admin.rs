// ABOUTME: Operator control surface: maintenance, breaker overrides, probes and snapshots
//
// Mutating operations require the admin role and leave an audit line on
// the `audit` tracing target. Snapshots are read-only and open to anyone
// holding a gateway handle.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use super::auth::Principal;
use super::breaker::{BreakerSnapshot, BreakerState};
use super::error::{AdminError, RegistryError};
use super::health::ProbeResult;
use super::metrics::GatewayMetricsSnapshot;
use super::pool::PoolSnapshot;
use super::queue::QueueSnapshot;
use super::record::{HealthStatus, ServerId, ServerRecord};
use super::registry::HealthTransition;
use super::{Gateway, ServerRuntime};

/// Auditable admin actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminAction {
    MaintenanceEntered,
    MaintenanceExited,
    BreakerForced,
    ProbeRequested,
}

impl std::fmt::Display for AdminAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdminAction::MaintenanceEntered => write!(f, "MAINTENANCE_ENTERED"),
            AdminAction::MaintenanceExited => write!(f, "MAINTENANCE_EXITED"),
            AdminAction::BreakerForced => write!(f, "BREAKER_FORCED"),
            AdminAction::ProbeRequested => write!(f, "PROBE_REQUESTED"),
        }
    }
}

/// Everything known about one server at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerSnapshot {
    pub record: ServerRecord,
    pub breaker: BreakerSnapshot,
    pub pools: Vec<PoolSnapshot>,
    pub queue: QueueSnapshot,
    pub health_monitor_running: bool,
    pub dispatch_permits_available: usize,
}

/// Read-only dump of the whole gateway.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewaySnapshot {
    pub taken_at: DateTime<Utc>,
    pub metrics: GatewayMetricsSnapshot,
    pub servers: Vec<ServerSnapshot>,
}

impl GatewaySnapshot {
    pub fn server(&self, id: &ServerId) -> Option<&ServerSnapshot> {
        self.servers.iter().find(|s| &s.record.id == id)
    }

    /// Count of servers per health status.
    pub fn health_counts(&self) -> std::collections::BTreeMap<&'static str, usize> {
        let mut counts = std::collections::BTreeMap::new();
        for server in &self.servers {
            *counts.entry(server.record.health.as_str()).or_insert(0) += 1;
        }
        counts
    }
}

/// Admin operations bound to one gateway.
#[derive(Debug, Clone)]
pub struct AdminControl {
    gateway: Gateway,
}

impl AdminControl {
    pub(super) fn new(gateway: Gateway) -> Self {
        Self { gateway }
    }

    fn authorize(principal: &Principal, action: AdminAction) -> Result<(), AdminError> {
        if principal.is_admin() {
            return Ok(());
        }
        warn!(
            target: "audit",
            action = %action,
            principal = %principal.principal,
            "Admin action denied"
        );
        Err(AdminError::Forbidden {
            principal: principal.principal.clone(),
            action: action.to_string().to_lowercase(),
        })
    }

    fn runtime(&self, id: &ServerId) -> Result<Arc<ServerRuntime>, AdminError> {
        self.gateway
            .inner
            .runtime(id)
            .ok_or_else(|| AdminError::Registry(RegistryError::NotFound(id.clone())))
    }

    fn audit(action: AdminAction, principal: &Principal, server: &ServerId, detail: &str) {
        info!(
            target: "audit",
            action = %action,
            principal = %principal.principal,
            server = %server,
            detail,
            "Admin action"
        );
    }

    /// Put a server into or out of maintenance. Maintenance servers only
    /// receive traffic when nothing else can serve it.
    ///
    /// # Errors
    ///
    /// `Forbidden` without the admin role, `NotFound` for unknown servers.
    pub fn set_maintenance(
        &self,
        principal: &Principal,
        id: &ServerId,
        enabled: bool,
    ) -> Result<Option<HealthTransition>, AdminError> {
        let action = if enabled {
            AdminAction::MaintenanceEntered
        } else {
            AdminAction::MaintenanceExited
        };
        Self::authorize(principal, action)?;
        let transition = self.gateway.inner.registry.set_maintenance(id, enabled)?;
        let status = self
            .gateway
            .inner
            .registry
            .health(id)
            .map_or("unknown", HealthStatus::as_str);
        Self::audit(action, principal, id, status);
        Ok(transition)
    }

    /// Override a server's breaker state. Returns the previous state.
    ///
    /// # Errors
    ///
    /// `Forbidden` without the admin role, `NotFound` for unknown servers.
    pub fn force_breaker_state(
        &self,
        principal: &Principal,
        id: &ServerId,
        state: BreakerState,
    ) -> Result<BreakerState, AdminError> {
        Self::authorize(principal, AdminAction::BreakerForced)?;
        let runtime = self.runtime(id)?;
        let previous = runtime.breaker.force_state(state, &principal.principal);
        Self::audit(
            AdminAction::BreakerForced,
            principal,
            id,
            &format!("{previous} -> {state}"),
        );
        Ok(previous)
    }

    /// Probe a server now, outside its schedule.
    ///
    /// # Errors
    ///
    /// `Forbidden` without the admin role, `NotFound` for unknown servers.
    pub async fn probe_now(&self, principal: &Principal, id: &ServerId) -> Result<ProbeResult, AdminError> {
        Self::authorize(principal, AdminAction::ProbeRequested)?;
        let runtime = self.runtime(id)?;
        let result = runtime.monitor.probe().probe_once().await;
        Self::audit(AdminAction::ProbeRequested, principal, id, &format!("{result:?}"));
        Ok(result)
    }

    /// Snapshot of one server.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown servers.
    pub fn server_snapshot(&self, id: &ServerId) -> Result<ServerSnapshot, AdminError> {
        let runtime = self.runtime(id)?;
        let record = self
            .gateway
            .inner
            .registry
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        Ok(Self::describe(record, &runtime))
    }

    fn describe(record: ServerRecord, runtime: &ServerRuntime) -> ServerSnapshot {
        ServerSnapshot {
            record,
            breaker: runtime.breaker.snapshot(),
            pools: runtime.pools.snapshots(),
            queue: runtime.queue.snapshot(),
            health_monitor_running: runtime.monitor.is_running(),
            dispatch_permits_available: runtime.dispatcher.available_permits(),
        }
    }

    /// Snapshot of every server, sorted by name.
    pub fn snapshot(&self) -> GatewaySnapshot {
        let inner = &self.gateway.inner;
        let servers = inner
            .registry
            .list()
            .into_iter()
            .filter_map(|record| {
                let runtime = inner.runtime(&record.id)?;
                Some(Self::describe(record, &runtime))
            })
            .collect();
        GatewaySnapshot {
            taken_at: Utc::now(),
            metrics: inner.metrics.snapshot(),
            servers,
        }
    }
}
