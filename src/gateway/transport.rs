// ABOUTME: Transport seam between the routing core and backend MCP servers
//
// A `Connector` opens `Connection`s to a server; the pool owns them and the
// dispatcher issues JSON-RPC calls through them. Health probes use `ping`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::record::{ServerId, TransportKind};

/// One JSON-RPC request forwarded to a backend server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpRequest {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl McpRequest {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    /// MCP liveness check.
    pub fn ping() -> Self {
        Self::new("ping", None)
    }

    /// `tools/call` for the named tool.
    pub fn tool_call(name: &str, arguments: Value) -> Self {
        Self::new(
            "tools/call",
            Some(serde_json::json!({ "name": name, "arguments": arguments })),
        )
    }
}

/// Failure talking to a backend server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("server returned error {code}: {message}")]
    Protocol { code: i64, message: String },

    #[error("transport {0} is not supported by this connector")]
    Unsupported(TransportKind),
}

/// Addressing information handed to a connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerTarget {
    pub server_id: ServerId,
    pub endpoint: String,
    pub transport: TransportKind,
}

/// Opens connections to backend servers.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &ServerTarget) -> Result<Box<dyn Connection>, CallError>;
}

/// An open, reusable connection to one server.
#[async_trait]
pub trait Connection: Send {
    async fn call(&mut self, request: &McpRequest) -> Result<Value, CallError>;

    async fn ping(&mut self) -> Result<(), CallError> {
        self.call(&McpRequest::ping()).await.map(|_| ())
    }

    /// Whether the connection can be returned to the pool.
    fn is_open(&self) -> bool {
        true
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scriptable in-memory connector for unit tests.

    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug, Default)]
    pub struct FakeState {
        pub fail_connect: AtomicBool,
        pub fail_calls: AtomicBool,
        pub delay_ms: AtomicU64,
        pub connects: AtomicU64,
        pub calls: AtomicU64,
    }

    #[derive(Debug, Clone, Default)]
    pub struct FakeConnector {
        pub state: Arc<FakeState>,
    }

    impl FakeConnector {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn connects(&self) -> u64 {
            self.state.connects.load(Ordering::SeqCst)
        }

        pub fn calls(&self) -> u64 {
            self.state.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self, target: &ServerTarget) -> Result<Box<dyn Connection>, CallError> {
            self.state.connects.fetch_add(1, Ordering::SeqCst);
            if self.state.fail_connect.load(Ordering::SeqCst) {
                return Err(CallError::Transport(format!("connection refused: {}", target.endpoint)));
            }
            Ok(Box::new(FakeConnection {
                state: Arc::clone(&self.state),
            }))
        }
    }

    struct FakeConnection {
        state: Arc<FakeState>,
    }

    #[async_trait]
    impl Connection for FakeConnection {
        async fn call(&mut self, request: &McpRequest) -> Result<Value, CallError> {
            self.state.calls.fetch_add(1, Ordering::SeqCst);
            let delay = self.state.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if self.state.fail_calls.load(Ordering::SeqCst) {
                return Err(CallError::Transport("connection reset".to_string()));
            }
            Ok(serde_json::json!({ "method": request.method }))
        }
    }
}
