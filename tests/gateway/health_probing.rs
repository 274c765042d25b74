// ABOUTME: Health probing through the gateway: hysteresis, scheduling, pool recovery and admin gating

use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::atomic::Ordering;
use std::time::Duration;

use mcp_gateway::gateway::{AdminError, HealthStatus, Principal, RouteRequest, RoutingError};

use super::fixtures::{http_server, test_config, TestGateway};

/// Two failures then two successes on an unhealthy server: no change after
/// the first success, healthy after the second.
#[tokio::test]
async fn test_unhealthy_server_recovers_after_two_successes() {
    let gw = TestGateway::start(test_config()).await;
    let id = gw.register(http_server("alpha", "search"));
    let admin = gw.gateway.admin();
    let system = Principal::system();
    let script = gw.script("alpha");
    let health = || gw.gateway.registry().health(&id);

    script.set_failing(true);
    for _ in 0..4 {
        admin.probe_now(&system, &id).await.unwrap();
    }
    assert_eq!(health(), Some(HealthStatus::Unhealthy));

    script.set_failing(false);
    admin.probe_now(&system, &id).await.unwrap();
    assert_eq!(health(), Some(HealthStatus::Unhealthy));
    admin.probe_now(&system, &id).await.unwrap();
    assert_eq!(health(), Some(HealthStatus::Healthy));
}

#[tokio::test(start_paused = true)]
async fn test_monitor_probes_on_schedule_until_deregistered() {
    let mut config = test_config();
    config.health.enabled = true;
    config.health.interval = Duration::from_secs(10);
    let gw = TestGateway::start(config).await;
    let id = gw.register(http_server("alpha", "search"));
    let script = gw.script("alpha");

    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(script.pings(), 3);
    assert_eq!(gw.gateway.registry().health(&id), Some(HealthStatus::Healthy));
    assert!(gw.gateway.admin().server_snapshot(&id).unwrap().health_monitor_running);

    gw.gateway.deregister(&id).await;
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(script.pings(), 3, "probing stops with the server");
}

#[tokio::test]
async fn test_connect_failure_gates_pool_until_probe_succeeds() {
    let gw = TestGateway::start(test_config()).await;
    let id = gw.register(http_server("alpha", "search"));
    let script = gw.script("alpha");
    let user = Principal::new("user");
    let request = || RouteRequest::tool_call("search", json!({}));

    script.fail_connect.store(true, Ordering::SeqCst);
    let err = gw.gateway.route(&user, request()).await.unwrap_err();
    assert!(matches!(err, RoutingError::NoAvailableServer { .. }), "got {err:?}");
    assert!(!gw.gateway.admin().server_snapshot(&id).unwrap().pools[0].healthy);

    // Unhealthy pool is skipped without touching the connector
    let connects = script.connects.load(Ordering::SeqCst);
    let err = gw.gateway.route(&user, request()).await.unwrap_err();
    assert!(matches!(err, RoutingError::AllServersDown { .. }), "got {err:?}");
    assert_eq!(script.connects.load(Ordering::SeqCst), connects);

    script.fail_connect.store(false, Ordering::SeqCst);
    gw.gateway
        .admin()
        .probe_now(&Principal::system(), &id)
        .await
        .unwrap();
    assert!(gw.gateway.admin().server_snapshot(&id).unwrap().pools[0].healthy);
    assert!(gw.gateway.route(&user, request()).await.is_ok());
}

#[tokio::test]
async fn test_admin_operations_require_admin_role() {
    let gw = TestGateway::start(test_config()).await;
    let id = gw.register(http_server("alpha", "search"));
    let admin = gw.gateway.admin();
    let user = Principal::new("mallory").with_tenant("t1");

    let err = admin.probe_now(&user, &id).await.unwrap_err();
    assert!(matches!(err, AdminError::Forbidden { .. }));
    let err = admin.set_maintenance(&user, &id, true).unwrap_err();
    assert!(matches!(err, AdminError::Forbidden { .. }));
    assert_eq!(gw.script("alpha").pings(), 0);
    assert_eq!(gw.gateway.registry().health(&id), Some(HealthStatus::Unknown));
}

#[tokio::test]
async fn test_maintenance_server_used_only_without_alternative() {
    let gw = TestGateway::start(test_config()).await;
    let alpha = gw.register(http_server("alpha", "search"));
    let admin = gw.gateway.admin();
    let system = Principal::system();
    let user = Principal::new("user");
    let request = || RouteRequest::tool_call("search", json!({}));

    admin.set_maintenance(&system, &alpha, true).unwrap();
    // Sole candidate still serves
    assert!(gw.gateway.route(&user, request()).await.is_ok());

    gw.register(http_server("beta", "search"));
    let before = gw.script("alpha").calls();
    for _ in 0..3 {
        gw.gateway.route(&user, request()).await.unwrap();
    }
    assert_eq!(gw.script("alpha").calls(), before);
    assert_eq!(gw.script("beta").calls(), 3);

    // Probes never lift maintenance
    admin.probe_now(&system, &alpha).await.unwrap();
    assert_eq!(gw.gateway.registry().health(&alpha), Some(HealthStatus::Maintenance));
    admin.set_maintenance(&system, &alpha, false).unwrap();
    assert_eq!(gw.gateway.registry().health(&alpha), Some(HealthStatus::Unknown));
}
