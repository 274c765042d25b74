// ABOUTME: Registry persistence seam with in-memory and JSON Lines stores
//
// Registration changes are handed to a bounded write-behind channel so the
// routing path never waits on storage. A full channel drops the event with
// a warning; the store is a convenience, the live registry is the truth.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::record::{ServerId, ServerRegistration};
use super::telemetry::JsonlWriter;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed record at {path}:{line}: {message}")]
    Malformed {
        path: PathBuf,
        line: usize,
        message: String,
    },
}

/// One change to the set of registered servers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RegistryEvent {
    Registered {
        registration: ServerRegistration,
        at: DateTime<Utc>,
    },
    Deregistered {
        server_id: ServerId,
        at: DateTime<Utc>,
    },
}

/// Durable home for dynamically registered servers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Servers to re-register on startup.
    async fn load_servers(&self) -> Result<Vec<ServerRegistration>, StoreError>;

    async fn record_registered(&self, registration: &ServerRegistration) -> Result<(), StoreError>;

    async fn record_deregistered(&self, server_id: &ServerId) -> Result<(), StoreError>;
}

// === Static Store ===

/// In-memory store seeded with a fixed server list. Changes are kept for
/// the life of the process only.
#[derive(Debug, Default)]
pub struct StaticStore {
    servers: Mutex<Vec<ServerRegistration>>,
}

impl StaticStore {
    pub fn new(servers: Vec<ServerRegistration>) -> Self {
        Self {
            servers: Mutex::new(servers),
        }
    }

    pub fn servers(&self) -> Vec<ServerRegistration> {
        self.servers.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl RegistryStore for StaticStore {
    async fn load_servers(&self) -> Result<Vec<ServerRegistration>, StoreError> {
        Ok(self.servers())
    }

    async fn record_registered(&self, registration: &ServerRegistration) -> Result<(), StoreError> {
        let mut servers = self.servers.lock().unwrap_or_else(PoisonError::into_inner);
        servers.retain(|s| s.id.is_none() || s.id != registration.id);
        servers.push(registration.clone());
        Ok(())
    }

    async fn record_deregistered(&self, server_id: &ServerId) -> Result<(), StoreError> {
        self.servers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|s| s.id.as_ref() != Some(server_id));
        Ok(())
    }
}

// === JSONL Store ===

/// Append-only event log; replayed on load.
pub struct JsonlStore {
    path: PathBuf,
    writer: tokio::sync::Mutex<Option<JsonlWriter>>,
}

impl std::fmt::Debug for JsonlStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonlStore").field("path", &self.path).finish_non_exhaustive()
    }
}

impl JsonlStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: tokio::sync::Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    async fn append(&self, event: &RegistryEvent) -> Result<(), StoreError> {
        let mut writer = self.writer.lock().await;
        if writer.is_none() {
            *writer = Some(JsonlWriter::open(&self.path).await.map_err(|e| self.io_error(e))?);
        }
        match writer.as_mut() {
            Some(w) => w.write(event).await.map_err(|e| self.io_error(e)),
            None => Ok(()),
        }
    }
}

/// Fold an event log into the surviving registrations, in first-seen order.
pub fn replay(events: impl IntoIterator<Item = RegistryEvent>) -> Vec<ServerRegistration> {
    let mut servers: Vec<ServerRegistration> = Vec::new();
    for event in events {
        match event {
            RegistryEvent::Registered { registration, .. } => {
                servers.retain(|s| s.id != registration.id);
                servers.push(registration);
            }
            RegistryEvent::Deregistered { server_id, .. } => {
                servers.retain(|s| s.id.as_ref() != Some(&server_id));
            }
        }
    }
    servers
}

#[async_trait]
impl RegistryStore for JsonlStore {
    async fn load_servers(&self) -> Result<Vec<ServerRegistration>, StoreError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_error(e)),
        };

        let mut events = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RegistryEvent>(line) {
                Ok(event) => events.push(event),
                // A torn final line is expected after a crash; skip it
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = index + 1,
                    error = %e,
                    "Skipping malformed registry record"
                ),
            }
        }

        let servers = replay(events);
        info!(path = %self.path.display(), count = servers.len(), "Loaded persisted servers");
        Ok(servers)
    }

    async fn record_registered(&self, registration: &ServerRegistration) -> Result<(), StoreError> {
        self.append(&RegistryEvent::Registered {
            registration: registration.clone(),
            at: Utc::now(),
        })
        .await
    }

    async fn record_deregistered(&self, server_id: &ServerId) -> Result<(), StoreError> {
        self.append(&RegistryEvent::Deregistered {
            server_id: server_id.clone(),
            at: Utc::now(),
        })
        .await
    }
}

// === Write-behind ===

/// Bounded channel in front of a store, drained by one task.
pub struct PersistenceWriter {
    tx: Mutex<Option<mpsc::Sender<RegistryEvent>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    dropped: AtomicU64,
}

impl std::fmt::Debug for PersistenceWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceWriter")
            .field("dropped", &self.dropped())
            .finish_non_exhaustive()
    }
}

impl PersistenceWriter {
    pub fn spawn(store: Arc<dyn RegistryStore>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<RegistryEvent>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let result = match &event {
                    RegistryEvent::Registered { registration, .. } => {
                        store.record_registered(registration).await
                    }
                    RegistryEvent::Deregistered { server_id, .. } => {
                        store.record_deregistered(server_id).await
                    }
                };
                if let Err(e) = result {
                    error!(error = %e, "Failed to persist registry change");
                }
            }
            debug!("Persistence writer stopped");
        });
        Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue an event without waiting. Returns `false` if it was dropped.
    pub fn submit(&self, event: RegistryEvent) -> bool {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let Some(tx) = tx else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        match tx.try_send(event) {
            Ok(()) => true,
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Registry persistence backlog full, dropping event");
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting events and wait for the backlog to be written.
    pub async fn shutdown(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Persistence writer task failed");
            }
        }
    }
}
