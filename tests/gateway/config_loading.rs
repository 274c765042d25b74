// ABOUTME: Config-driven startup: TOML servers are registered and persisted servers replayed

use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

use mcp_gateway::config::GatewayConfig;
use mcp_gateway::gateway::{
    Gateway, JsonlStore, MemoryTelemetry, Principal, RegistryStore, RouteRequest, ServerId,
};

use super::fixtures::{http_server, ScriptedConnector};

const CONFIG: &str = r#"
[health]
enabled = false

[[servers]]
id = "search-1"
name = "search"
endpoint = "http://search.test/mcp"
transport = "http"
capabilities = ["search"]

[[servers]]
name = "files"
endpoint = "http://files.test/mcp"
transport = "sse"
capabilities = ["read_file"]
tenant = "t1"
"#;

#[tokio::test]
async fn test_configured_servers_are_registered_on_start() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("mcp-gateway.toml");
    std::fs::write(&path, CONFIG).unwrap();

    let config = GatewayConfig::load(Some(&path)).unwrap();
    let gateway = Gateway::builder(config)
        .connector(Arc::new(ScriptedConnector::default()))
        .telemetry(Arc::new(MemoryTelemetry::new()))
        .build()
        .unwrap();
    gateway.start().await.unwrap();

    let names: Vec<_> = gateway.registry().list().into_iter().map(|r| r.name).collect();
    assert_eq!(names, vec!["files".to_string(), "search".to_string()]);
    assert!(gateway.registry().contains(&ServerId::from("search-1")));

    let response = gateway
        .route(&Principal::new("user"), RouteRequest::tool_call("search", json!({})))
        .await
        .unwrap();
    assert_eq!(response["server"], "http://search.test/mcp");

    // Private to t1
    let anonymous = gateway
        .route(&Principal::new("user"), RouteRequest::tool_call("read_file", json!({})))
        .await;
    assert!(anonymous.is_err());
    let tenant = Principal::new("user").with_tenant("t1");
    assert!(gateway
        .route(&tenant, RouteRequest::tool_call("read_file", json!({})))
        .await
        .is_ok());

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_persisted_servers_survive_restart() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("registry.jsonl");

    let mut config = GatewayConfig::default();
    config.health.enabled = false;
    config.persistence.jsonl_path = Some(log.clone());

    let first = Gateway::builder(config.clone())
        .connector(Arc::new(ScriptedConnector::default()))
        .build()
        .unwrap();
    first.start().await.unwrap();
    first.register(http_server("dynamic", "search")).unwrap();
    let gone = first.register(http_server("gone", "search")).unwrap();
    first.deregister(&gone).await;
    first.shutdown().await;

    let persisted = JsonlStore::new(&log).load_servers().await.unwrap();
    assert_eq!(persisted.len(), 1);

    let second = Gateway::builder(config)
        .connector(Arc::new(ScriptedConnector::default()))
        .build()
        .unwrap();
    second.start().await.unwrap();
    assert!(second.registry().contains(&ServerId::from("dynamic")));
    assert!(!second.registry().contains(&ServerId::from("gone")));
    second.shutdown().await;
}

#[test]
fn test_invalid_config_is_rejected() {
    let err = GatewayConfig::from_toml_str(
        r#"
[[servers]]
name = "Bad Name"
endpoint = "http://x.test"
transport = "http"
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("Invalid configuration"));
}
