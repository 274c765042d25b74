// ABOUTME: Authoritative in-memory registry of MCP servers and their health
//
// Entries live behind `Arc`s in a map whose lock is only held long enough
// to clone them; each entry synchronizes its own health state. All health
// and statistics changes go through `update_health`.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info};

use super::error::RegistryError;
use super::health::{HealthTracker, HysteresisPolicy};
use super::metrics::{duration_ms, AtomicEma};
use super::record::{HealthStatus, Outcome, ServerId, ServerRecord, ServerRegistration, TenantId};
use super::telemetry::{TelemetryEvent, TelemetryKind, TelemetrySink};

/// Who is reporting an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    /// Health monitor probe; drives status transitions
    Probe,
    /// Routed request; feeds rolling statistics only
    Request,
}

/// One outcome report for a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthUpdate {
    pub source: UpdateSource,
    pub outcome: Outcome,
    pub latency: Option<Duration>,
}

/// A status change caused by an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTransition {
    pub server_id: ServerId,
    pub from: HealthStatus,
    pub to: HealthStatus,
}

#[derive(Debug)]
struct HealthState {
    status: HealthStatus,
    tracker: HealthTracker,
    last_check: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct RegistryEntry {
    id: ServerId,
    registration: ServerRegistration,
    health: Mutex<HealthState>,
    response_time: AtomicEma,
    success_rate: AtomicEma,
    active_connections: Arc<AtomicU32>,
}

impl RegistryEntry {
    fn health(&self) -> MutexGuard<'_, HealthState> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self) -> ServerRecord {
        let (health, last_health_check) = {
            let state = self.health();
            (state.status, state.last_check)
        };
        let reg = &self.registration;
        ServerRecord {
            id: self.id.clone(),
            name: reg.name.clone(),
            endpoint: reg.endpoint.clone(),
            transport: reg.transport,
            capabilities: reg.capabilities.clone(),
            tenant: reg.tenant.clone(),
            owner_id: reg.owner_id.clone(),
            health,
            last_health_check,
            avg_response_time_ms: self.response_time.get(),
            success_rate: self.success_rate.value_or(1.0),
            active_connections: self.active_connections.load(Ordering::Relaxed),
        }
    }
}

/// Registry of known servers.
pub struct ServerRegistry {
    entries: RwLock<HashMap<ServerId, Arc<RegistryEntry>>>,
    policy: HysteresisPolicy,
    smoothing: f64,
    telemetry: Arc<dyn TelemetrySink>,
}

impl std::fmt::Debug for ServerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRegistry")
            .field("servers", &self.len())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ServerRegistry {
    pub fn new(policy: HysteresisPolicy, smoothing: f64, telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            policy,
            smoothing,
            telemetry,
        }
    }

    fn entry(&self, id: &ServerId) -> Option<Arc<RegistryEntry>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn all(&self) -> Vec<Arc<RegistryEntry>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Add a server. New servers start in `Unknown` health.
    ///
    /// # Errors
    ///
    /// - `InvalidRegistration` when the registration fails validation
    /// - `Conflict` on a duplicate id, or a duplicate name or endpoint
    ///   within the same tenant scope
    pub fn register(&self, registration: ServerRegistration) -> Result<ServerId, RegistryError> {
        registration.validate()?;
        let id = registration.id.clone().unwrap_or_else(ServerId::generate);

        {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            if entries.contains_key(&id) {
                return Err(RegistryError::Conflict(format!("server id '{id}' already registered")));
            }
            for existing in entries.values() {
                let other = &existing.registration;
                if other.tenant != registration.tenant {
                    continue;
                }
                if other.name == registration.name {
                    return Err(RegistryError::Conflict(format!(
                        "server name '{}' already registered in this tenant scope",
                        registration.name
                    )));
                }
                if other.endpoint.trim() == registration.endpoint.trim() {
                    return Err(RegistryError::Conflict(format!(
                        "endpoint '{}' already registered in this tenant scope",
                        registration.endpoint
                    )));
                }
            }

            let mut registration = registration;
            registration.id = Some(id.clone());
            entries.insert(
                id.clone(),
                Arc::new(RegistryEntry {
                    id: id.clone(),
                    health: Mutex::new(HealthState {
                        status: HealthStatus::Unknown,
                        tracker: HealthTracker::default(),
                        last_check: None,
                    }),
                    response_time: AtomicEma::new(self.smoothing),
                    success_rate: AtomicEma::with_initial(self.smoothing, 1.0),
                    active_connections: Arc::new(AtomicU32::new(0)),
                    registration,
                }),
            );
        }

        let entry = self.entry(&id);
        let (name, tenant) = entry
            .as_ref()
            .map(|e| (e.registration.name.clone(), e.registration.tenant.clone()))
            .unwrap_or_default();
        info!(server = %id, name = %name, tenant = ?tenant.as_ref().map(TenantId::as_str), "Server registered");
        let mut event = TelemetryEvent::new(TelemetryKind::ServerRegistered, &id).with_detail(name);
        if let Some(tenant) = &tenant {
            event = event.with_tenant(tenant);
        }
        self.telemetry.emit(event);
        Ok(id)
    }

    /// Drop a server's record. Returns its final state if it was present.
    pub fn remove(&self, id: &ServerId) -> Option<ServerRecord> {
        let removed = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)?;
        debug!(server = %id, "Server removed from registry");
        Some(removed.record())
    }

    /// Candidate servers for `capability` visible to `tenant`, best first.
    ///
    /// Ordered by health (healthy, degraded, unknown, unhealthy,
    /// maintenance) then ascending average response time. Unhealthy and
    /// maintenance servers are only returned when nothing routable is left.
    pub fn lookup(&self, capability: &str, tenant: Option<&TenantId>) -> Vec<ServerRecord> {
        let mut candidates: Vec<ServerRecord> = self
            .all()
            .iter()
            .filter(|entry| entry.registration.capabilities.contains(capability))
            .map(|entry| entry.record())
            .filter(|record| record.is_visible_to(tenant))
            .collect();

        candidates.sort_by(|a, b| {
            a.health.rank().cmp(&b.health.rank()).then_with(|| {
                let a_ms = a.avg_response_time_ms.unwrap_or(f64::INFINITY);
                let b_ms = b.avg_response_time_ms.unwrap_or(f64::INFINITY);
                a_ms.total_cmp(&b_ms)
            })
        });

        if candidates.iter().any(|record| record.health.is_routable()) {
            candidates.retain(|record| record.health.is_routable());
        }
        candidates
    }

    /// Fold one outcome into the server's statistics and, for probes, its
    /// health status. This is the only place health fields change besides
    /// the maintenance override.
    pub fn update_health(&self, id: &ServerId, update: HealthUpdate) -> Option<HealthTransition> {
        let entry = self.entry(id)?;

        if let Some(latency) = update.latency {
            entry.response_time.record(duration_ms(latency));
        }
        entry
            .success_rate
            .record(if update.outcome.is_success() { 1.0 } else { 0.0 });

        if update.source != UpdateSource::Probe {
            return None;
        }

        let transition = {
            let mut state = entry.health();
            state.last_check = Some(Utc::now());
            let from = state.status;
            let to = state.tracker.observe(from, update.outcome.is_success(), &self.policy);
            state.status = to;
            (from != to).then(|| HealthTransition {
                server_id: id.clone(),
                from,
                to,
            })
        };

        if let Some(t) = &transition {
            self.announce(&entry, t, TelemetryKind::HealthTransition);
        }
        transition
    }

    /// Operator maintenance override. Leaving maintenance resets the server
    /// to `Unknown` until the next probe.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown server.
    pub fn set_maintenance(&self, id: &ServerId, enabled: bool) -> Result<Option<HealthTransition>, RegistryError> {
        let entry = self.entry(id).ok_or_else(|| RegistryError::NotFound(id.clone()))?;

        let transition = {
            let mut state = entry.health();
            let from = state.status;
            let to = match (enabled, from) {
                (true, _) => HealthStatus::Maintenance,
                (false, HealthStatus::Maintenance) => HealthStatus::Unknown,
                (false, other) => other,
            };
            if from != to {
                state.status = to;
                state.tracker.reset();
            }
            (from != to).then(|| HealthTransition {
                server_id: id.clone(),
                from,
                to,
            })
        };

        if let Some(t) = &transition {
            self.announce(&entry, t, TelemetryKind::MaintenanceChanged);
        }
        Ok(transition)
    }

    fn announce(&self, entry: &RegistryEntry, transition: &HealthTransition, kind: TelemetryKind) {
        info!(
            server = %transition.server_id,
            from = %transition.from,
            to = %transition.to,
            "Server health changed"
        );
        let mut event = TelemetryEvent::new(kind, &transition.server_id)
            .with_detail(format!("{} -> {}", transition.from, transition.to))
            .with_counter(
                "active_connections",
                u64::from(entry.active_connections.load(Ordering::Relaxed)),
            );
        if let Some(tenant) = &entry.registration.tenant {
            event = event.with_tenant(tenant);
        }
        self.telemetry.emit(event);
    }

    pub fn get(&self, id: &ServerId) -> Option<ServerRecord> {
        self.entry(id).map(|entry| entry.record())
    }

    pub fn health(&self, id: &ServerId) -> Option<HealthStatus> {
        self.entry(id).map(|entry| entry.health().status)
    }

    /// Registration as stored, with its id filled in.
    pub fn registration(&self, id: &ServerId) -> Option<ServerRegistration> {
        self.entry(id).map(|entry| entry.registration.clone())
    }

    /// Gauge the server's pools update with connections in use.
    pub fn connection_gauge(&self, id: &ServerId) -> Option<Arc<AtomicU32>> {
        self.entry(id).map(|entry| Arc::clone(&entry.active_connections))
    }

    pub fn contains(&self, id: &ServerId) -> bool {
        self.entry(id).is_some()
    }

    /// Every record, sorted by name.
    pub fn list(&self) -> Vec<ServerRecord> {
        let mut records: Vec<_> = self.all().iter().map(|entry| entry.record()).collect();
        records.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        records
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::record::TransportKind;
    use crate::gateway::telemetry::MemoryTelemetry;
    use pretty_assertions::assert_eq;

    fn registry() -> (ServerRegistry, Arc<MemoryTelemetry>) {
        let telemetry = Arc::new(MemoryTelemetry::new());
        (
            ServerRegistry::new(HysteresisPolicy::default(), 0.2, telemetry.clone()),
            telemetry,
        )
    }

    fn http(name: &str) -> ServerRegistration {
        ServerRegistration::new(name, format!("http://{name}.local/mcp"), TransportKind::Http)
            .with_capability("toolX")
    }

    fn probe(registry: &ServerRegistry, id: &ServerId, ok: bool) -> Option<HealthTransition> {
        registry.update_health(
            id,
            HealthUpdate {
                source: UpdateSource::Probe,
                outcome: if ok { Outcome::Success } else { Outcome::Failure },
                latency: ok.then(|| Duration::from_millis(10)),
            },
        )
    }

    #[test]
    fn test_register_assigns_id_and_unknown_health() {
        let (registry, telemetry) = registry();
        let id = registry.register(http("alpha")).unwrap();
        let record = registry.get(&id).unwrap();
        assert_eq!(record.health, HealthStatus::Unknown);
        assert_eq!(record.success_rate, 1.0);
        assert_eq!(registry.registration(&id).unwrap().id, Some(id.clone()));
        assert_eq!(telemetry.count(TelemetryKind::ServerRegistered), 1);
    }

    #[test]
    fn test_duplicate_name_in_tenant_conflicts() {
        let (registry, _) = registry();
        registry.register(http("alpha").with_tenant("t1")).unwrap();

        let dup = ServerRegistration::new("alpha", "http://other.local/mcp", TransportKind::Http)
            .with_tenant("t1");
        assert!(matches!(registry.register(dup), Err(RegistryError::Conflict(_))));

        // Same name in another tenant scope is fine
        assert!(registry.register(http("alpha").with_tenant("t2")).is_ok());
        assert!(registry.register(http("alpha")).is_ok());
    }

    #[test]
    fn test_duplicate_endpoint_in_tenant_conflicts() {
        let (registry, _) = registry();
        registry.register(http("alpha")).unwrap();
        let same_endpoint =
            ServerRegistration::new("beta", "http://alpha.local/mcp", TransportKind::Http);
        assert!(matches!(
            registry.register(same_endpoint),
            Err(RegistryError::Conflict(_))
        ));
    }

    #[test]
    fn test_duplicate_id_conflicts() {
        let (registry, _) = registry();
        registry.register(http("alpha").with_id("fixed")).unwrap();
        assert!(matches!(
            registry.register(http("beta").with_id("fixed")),
            Err(RegistryError::Conflict(_))
        ));
    }

    #[test]
    fn test_invalid_registration_rejected() {
        let (registry, _) = registry();
        let bad = ServerRegistration::new("Bad Name", "http://x.local", TransportKind::Http);
        assert!(matches!(
            registry.register(bad),
            Err(RegistryError::InvalidRegistration(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_lookup_orders_by_health_then_latency() {
        let (registry, _) = registry();
        let slow = registry.register(http("slow")).unwrap();
        let fast = registry.register(http("fast")).unwrap();
        let degraded = registry.register(http("degraded")).unwrap();
        let unknown = registry.register(http("unknown")).unwrap();
        registry.register(http("other").with_tenant("t2")).unwrap();

        probe(&registry, &slow, true);
        registry.update_health(
            &slow,
            HealthUpdate {
                source: UpdateSource::Request,
                outcome: Outcome::Success,
                latency: Some(Duration::from_millis(500)),
            },
        );
        probe(&registry, &fast, true);
        probe(&registry, &degraded, false);
        probe(&registry, &degraded, false);

        let t1 = TenantId::from("t1");
        let ids: Vec<_> = registry
            .lookup("toolX", Some(&t1))
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![fast, slow, degraded, unknown]);
    }

    #[test]
    fn test_lookup_scopes_by_tenant_and_capability() {
        let (registry, _) = registry();
        let public = registry.register(http("public")).unwrap();
        let mine = registry.register(http("mine").with_tenant("t1")).unwrap();
        registry.register(http("theirs").with_tenant("t2")).unwrap();
        registry
            .register(ServerRegistration::new("nocap", "http://nocap.local", TransportKind::Http).with_capability("toolY"))
            .unwrap();

        let mut ids: Vec<_> = registry
            .lookup("toolX", Some(&TenantId::from("t1")))
            .into_iter()
            .map(|r| r.id)
            .collect();
        ids.sort();
        let mut expected = vec![public.clone(), mine];
        expected.sort();
        assert_eq!(ids, expected);

        let anonymous: Vec<_> = registry.lookup("toolX", None).into_iter().map(|r| r.id).collect();
        assert_eq!(anonymous, vec![public]);
        assert!(registry.lookup("toolZ", None).is_empty());
    }

    #[test]
    fn test_lookup_excludes_unhealthy_unless_no_alternative() {
        let (registry, _) = registry();
        let sick = registry.register(http("sick")).unwrap();
        for _ in 0..4 {
            probe(&registry, &sick, false);
        }
        assert_eq!(registry.health(&sick), Some(HealthStatus::Unhealthy));

        // Only candidate: still returned
        assert_eq!(registry.lookup("toolX", None).len(), 1);

        let ok = registry.register(http("ok")).unwrap();
        let ids: Vec<_> = registry.lookup("toolX", None).into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![ok]);
    }

    #[test]
    fn test_request_updates_do_not_change_status() {
        let (registry, _) = registry();
        let id = registry.register(http("alpha")).unwrap();
        for _ in 0..10 {
            let transition = registry.update_health(
                &id,
                HealthUpdate {
                    source: UpdateSource::Request,
                    outcome: Outcome::Failure,
                    latency: None,
                },
            );
            assert!(transition.is_none());
        }
        let record = registry.get(&id).unwrap();
        assert_eq!(record.health, HealthStatus::Unknown);
        assert!(record.success_rate < 0.2);
        assert!(record.last_health_check.is_none());
    }

    #[test]
    fn test_probe_transitions_emit_telemetry() {
        let (registry, telemetry) = registry();
        let id = registry.register(http("alpha")).unwrap();
        let transition = probe(&registry, &id, true).unwrap();
        assert_eq!(transition.from, HealthStatus::Unknown);
        assert_eq!(transition.to, HealthStatus::Healthy);
        assert!(probe(&registry, &id, true).is_none());
        assert_eq!(telemetry.count(TelemetryKind::HealthTransition), 1);
    }

    #[test]
    fn test_maintenance_override() {
        let (registry, telemetry) = registry();
        let id = registry.register(http("alpha")).unwrap();
        probe(&registry, &id, true);

        registry.set_maintenance(&id, true).unwrap();
        assert_eq!(registry.health(&id), Some(HealthStatus::Maintenance));

        // Probes never lift maintenance
        probe(&registry, &id, true);
        probe(&registry, &id, true);
        assert_eq!(registry.health(&id), Some(HealthStatus::Maintenance));

        registry.set_maintenance(&id, false).unwrap();
        assert_eq!(registry.health(&id), Some(HealthStatus::Unknown));
        assert_eq!(telemetry.count(TelemetryKind::MaintenanceChanged), 2);

        assert!(matches!(
            registry.set_maintenance(&ServerId::from("missing"), true),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn test_remove() {
        let (registry, _) = registry();
        let id = registry.register(http("alpha")).unwrap();
        assert!(registry.remove(&id).is_some());
        assert!(registry.remove(&id).is_none());
        assert!(!registry.contains(&id));
        assert!(registry.update_health(
            &id,
            HealthUpdate {
                source: UpdateSource::Probe,
                outcome: Outcome::Success,
                latency: None
            }
        )
        .is_none());
    }

    #[test]
    fn test_concurrent_reporters_do_not_lose_updates() {
        let (registry, _) = registry();
        let registry = Arc::new(registry);
        let id = registry.register(http("alpha")).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let id = id.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        registry.update_health(
                            &id,
                            HealthUpdate {
                                source: UpdateSource::Request,
                                outcome: Outcome::Success,
                                latency: Some(Duration::from_millis(20)),
                            },
                        );
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let record = registry.get(&id).unwrap();
        assert!((record.avg_response_time_ms.unwrap() - 20.0).abs() < 1e-6);
        assert!((record.success_rate - 1.0).abs() < 1e-9);
    }
}
