// ABOUTME: Structured telemetry events emitted by the routing core
//
// Every breaker transition, pool exhaustion, queue rejection and health
// transition becomes a `TelemetryEvent`. Emission never blocks the request
// path: the channel sink drops events when its buffer is full and a drain
// task forwards them to tracing and, optionally, a JSON Lines file for the
// external audit/monitoring layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::record::{ServerId, TenantId};

/// Kinds of events the core emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryKind {
    ServerRegistered,
    ServerDeregistered,
    HealthTransition,
    MaintenanceChanged,
    BreakerTransition,
    BreakerForced,
    PoolExhausted,
    PoolHealthChanged,
    QueueRejected,
    RateLimited,
    RequestTimeout,
}

/// One structured event for the monitoring layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub timestamp: DateTime<Utc>,
    pub server_id: ServerId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<TenantId>,
    pub kind: TelemetryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<String, u64>,
}

impl TelemetryEvent {
    pub fn new(kind: TelemetryKind, server_id: &ServerId) -> Self {
        Self {
            timestamp: Utc::now(),
            server_id: server_id.clone(),
            tenant_id: None,
            kind,
            detail: None,
            counters: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_tenant(mut self, tenant: &TenantId) -> Self {
        self.tenant_id = Some(tenant.clone());
        self
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    #[must_use]
    pub fn with_counter(mut self, name: &str, value: u64) -> Self {
        self.counters.insert(name.to_string(), value);
        self
    }
}

/// Destination for telemetry events. Implementations must not block.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: TelemetryEvent);
}

/// Discards every event.
#[derive(Debug, Default)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn emit(&self, _event: TelemetryEvent) {}
}

/// Keeps events in memory; used by tests and the snapshot CLI.
#[derive(Debug, Default)]
pub struct MemoryTelemetry {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl MemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn of_kind(&self, kind: TelemetryKind) -> Vec<TelemetryEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.kind == kind)
            .collect()
    }

    pub fn count(&self, kind: TelemetryKind) -> usize {
        self.of_kind(kind).len()
    }
}

impl TelemetrySink for MemoryTelemetry {
    fn emit(&self, event: TelemetryEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

// === Channel Sink ===

/// Bounded, drop-on-full sink drained by a background task.
#[derive(Debug)]
pub struct ChannelTelemetry {
    tx: mpsc::Sender<TelemetryEvent>,
    dropped: AtomicU64,
}

impl ChannelTelemetry {
    /// Create the sink and the drain that consumes it.
    pub fn new(capacity: usize) -> (Self, TelemetryDrain) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            TelemetryDrain {
                rx,
                jsonl_path: None,
            },
        )
    }

    /// Events dropped because the buffer was full or the drain stopped.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl TelemetrySink for ChannelTelemetry {
    fn emit(&self, event: TelemetryEvent) {
        if let Err(e) = self.tx.try_send(event) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            // Log the first drop and then every thousandth
            if dropped == 1 || dropped % 1000 == 0 {
                warn!(dropped, error = %e, "Telemetry buffer full, dropping events");
            }
        }
    }
}

/// Consumer side of [`ChannelTelemetry`].
pub struct TelemetryDrain {
    rx: mpsc::Receiver<TelemetryEvent>,
    jsonl_path: Option<PathBuf>,
}

impl TelemetryDrain {
    /// Also append every event to a JSON Lines file.
    #[must_use]
    pub fn with_jsonl(mut self, path: impl Into<PathBuf>) -> Self {
        self.jsonl_path = Some(path.into());
        self
    }

    /// Run the drain until every sender is dropped.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut writer = match &self.jsonl_path {
            Some(path) => match JsonlWriter::open(path).await {
                Ok(writer) => Some(writer),
                Err(e) => {
                    error!(path = %path.display(), error = %e, "Failed to open telemetry log");
                    None
                }
            },
            None => None,
        };

        while let Some(event) = self.rx.recv().await {
            log_event(&event);
            if let Some(w) = writer.as_mut() {
                if let Err(e) = w.write(&event).await {
                    error!(error = %e, "Failed to write telemetry event");
                }
            }
        }

        debug!("Telemetry drain stopped");
    }
}

fn log_event(event: &TelemetryEvent) {
    info!(
        target: "telemetry",
        kind = ?event.kind,
        server = %event.server_id,
        tenant = ?event.tenant_id.as_ref().map(TenantId::as_str),
        detail = ?event.detail,
        counters = ?event.counters,
        "TELEMETRY"
    );
}

/// Appends serialized values as JSON Lines.
pub struct JsonlWriter {
    file: tokio::io::BufWriter<tokio::fs::File>,
}

impl JsonlWriter {
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            file: tokio::io::BufWriter::new(file),
        })
    }

    pub async fn write<T: Serialize + Sync>(&mut self, value: &T) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(value)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        line.push(b'\n');
        self.file.write_all(&line).await?;
        self.file.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn event(kind: TelemetryKind) -> TelemetryEvent {
        TelemetryEvent::new(kind, &ServerId::from("s1"))
            .with_tenant(&TenantId::from("t1"))
            .with_counter("total_requests", 3)
    }

    #[test]
    fn test_event_builder() {
        let e = event(TelemetryKind::QueueRejected).with_detail("queue_full");
        assert_eq!(e.server_id, ServerId::from("s1"));
        assert_eq!(e.tenant_id, Some(TenantId::from("t1")));
        assert_eq!(e.detail.as_deref(), Some("queue_full"));
        assert_eq!(e.counters.get("total_requests"), Some(&3));
    }

    #[test]
    fn test_event_serialization_skips_empty_fields() {
        let json = serde_json::to_value(TelemetryEvent::new(
            TelemetryKind::BreakerTransition,
            &ServerId::from("s1"),
        ))
        .unwrap();
        assert_eq!(json["kind"], "breaker_transition");
        assert!(json.get("tenant_id").is_none());
        assert!(json.get("counters").is_none());
    }

    #[test]
    fn test_memory_sink_filters_by_kind() {
        let sink = MemoryTelemetry::new();
        sink.emit(event(TelemetryKind::QueueRejected));
        sink.emit(event(TelemetryKind::RateLimited));
        sink.emit(event(TelemetryKind::QueueRejected));
        assert_eq!(sink.events().len(), 3);
        assert_eq!(sink.count(TelemetryKind::QueueRejected), 2);
    }

    #[tokio::test]
    async fn test_channel_sink_drops_when_full() {
        let (sink, _drain) = ChannelTelemetry::new(1);
        sink.emit(event(TelemetryKind::PoolExhausted));
        sink.emit(event(TelemetryKind::PoolExhausted));
        sink.emit(event(TelemetryKind::PoolExhausted));
        assert_eq!(sink.dropped(), 2);
    }

    #[tokio::test]
    async fn test_drain_writes_jsonl() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("logs").join("telemetry.jsonl");

        let (sink, drain) = ChannelTelemetry::new(16);
        let handle = drain.with_jsonl(&path).spawn();

        sink.emit(event(TelemetryKind::HealthTransition));
        sink.emit(event(TelemetryKind::BreakerTransition));
        drop(sink);
        handle.await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<TelemetryEvent> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].kind, TelemetryKind::HealthTransition);
        assert_eq!(lines[1].kind, TelemetryKind::BreakerTransition);
    }
}
