// ABOUTME: Shared fixtures for gateway integration tests
//
// Provides:
// - ScriptedConnector: in-memory MCP servers keyed by endpoint, scriptable per test
// - test_config(): fast, deterministic gateway settings (scheduled probes off)
// - TestGateway: a gateway wired to the scripted connector and memory telemetry

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mcp_gateway::config::GatewayConfig;
use mcp_gateway::gateway::transport::ServerTarget;
use mcp_gateway::gateway::{
    CallError, Connection, Connector, Gateway, McpRequest, MemoryTelemetry, ServerId, ServerRegistration,
    StaticStore, TransportKind,
};

/// Behaviour of one fake server.
#[derive(Debug, Default)]
pub struct ScriptedServer {
    pub fail_connect: AtomicBool,
    pub fail_calls: AtomicBool,
    pub protocol_error: AtomicBool,
    pub delay_ms: AtomicU64,
    pub connects: AtomicU64,
    pub calls: AtomicU64,
    pub pings: AtomicU64,
}

impl ScriptedServer {
    pub fn set_failing(&self, failing: bool) {
        self.fail_calls.store(failing, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> u64 {
        self.pings.load(Ordering::SeqCst)
    }
}

/// Connector serving every endpoint from an in-memory script.
#[derive(Debug, Default)]
pub struct ScriptedConnector {
    servers: Mutex<HashMap<String, Arc<ScriptedServer>>>,
}

impl ScriptedConnector {
    /// Script for `endpoint`, created on first use.
    pub fn server(&self, endpoint: &str) -> Arc<ScriptedServer> {
        let mut servers = self.servers.lock().unwrap();
        Arc::clone(servers.entry(endpoint.to_string()).or_default())
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, target: &ServerTarget) -> Result<Box<dyn Connection>, CallError> {
        let script = self.server(&target.endpoint);
        script.connects.fetch_add(1, Ordering::SeqCst);
        if script.fail_connect.load(Ordering::SeqCst) {
            return Err(CallError::Transport("connection refused".to_string()));
        }
        Ok(Box::new(ScriptedConnection {
            endpoint: target.endpoint.clone(),
            script,
        }))
    }
}

struct ScriptedConnection {
    endpoint: String,
    script: Arc<ScriptedServer>,
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn call(&mut self, request: &McpRequest) -> Result<Value, CallError> {
        if request.method == "ping" {
            self.script.pings.fetch_add(1, Ordering::SeqCst);
        } else {
            self.script.calls.fetch_add(1, Ordering::SeqCst);
        }

        let delay = self.script.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self.script.fail_calls.load(Ordering::SeqCst) {
            return Err(CallError::Transport("connection reset by peer".to_string()));
        }
        if self.script.protocol_error.load(Ordering::SeqCst) && request.method != "ping" {
            return Err(CallError::Protocol {
                code: -32602,
                message: "Invalid params".to_string(),
            });
        }
        Ok(json!({ "server": self.endpoint, "method": request.method }))
    }
}

/// Settings tuned for tests: scheduled probes off, short timeouts.
pub fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.health.enabled = false;
    config.breaker.failure_threshold = 3;
    config.breaker.timeout = Duration::from_secs(60);
    config.pool.max_size = 2;
    config.pool.acquire_timeout = Duration::from_secs(1);
    config.queue.max_size = 16;
    config.queue.processing_timeout = Duration::from_secs(5);
    config.queue.max_wait = Duration::from_secs(10);
    config.router.drain_grace = Duration::from_secs(10);
    config
}

pub fn endpoint(name: &str) -> String {
    format!("http://{name}.test/mcp")
}

pub fn http_server(name: &str, capability: &str) -> ServerRegistration {
    ServerRegistration::new(name, endpoint(name), TransportKind::Http)
        .with_id(name)
        .with_capability(capability)
}

/// A started gateway and its test seams.
pub struct TestGateway {
    pub gateway: Gateway,
    pub connector: Arc<ScriptedConnector>,
    pub telemetry: Arc<MemoryTelemetry>,
    pub store: Arc<StaticStore>,
}

impl TestGateway {
    pub async fn start(config: GatewayConfig) -> Self {
        let connector = Arc::new(ScriptedConnector::default());
        let telemetry = Arc::new(MemoryTelemetry::new());
        let store = Arc::new(StaticStore::default());
        let gateway = Gateway::builder(config)
            .connector(connector.clone())
            .telemetry(telemetry.clone())
            .store(store.clone())
            .build()
            .unwrap();
        gateway.start().await.unwrap();
        Self {
            gateway,
            connector,
            telemetry,
            store,
        }
    }

    pub fn register(&self, registration: ServerRegistration) -> ServerId {
        self.gateway.register(registration).unwrap()
    }

    pub fn script(&self, name: &str) -> Arc<ScriptedServer> {
        self.connector.server(&endpoint(name))
    }
}

/// Which fake server produced a routed response.
pub fn served_by(response: &Value) -> &str {
    response["server"].as_str().unwrap_or_default()
}
