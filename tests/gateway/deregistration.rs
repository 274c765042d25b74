// ABOUTME: Deregistration lifecycle: idempotence, draining in-flight work, backlog rejection, persistence

use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;

use mcp_gateway::gateway::{
    DeregisterOutcome, HealthStatus, Principal, RouteRequest, RoutingError, ServerId, TelemetryKind,
};

use super::fixtures::{endpoint, http_server, served_by, test_config, TestGateway};

fn search() -> RouteRequest {
    RouteRequest::tool_call("search", json!({}))
}

#[tokio::test]
async fn test_deregister_is_idempotent() {
    let gw = TestGateway::start(test_config()).await;
    let id = gw.register(http_server("alpha", "search"));

    assert_eq!(gw.gateway.deregister(&id).await, DeregisterOutcome::Removed);
    assert_eq!(gw.gateway.deregister(&id).await, DeregisterOutcome::AlreadyRemoved);
    assert_eq!(
        gw.gateway.deregister(&ServerId::from("never-registered")).await,
        DeregisterOutcome::AlreadyRemoved
    );

    assert!(!gw.gateway.registry().contains(&id));
    assert_eq!(gw.telemetry.count(TelemetryKind::ServerDeregistered), 1);

    let err = gw.gateway.route(&Principal::new("user"), search()).await.unwrap_err();
    assert!(matches!(err, RoutingError::NoCapableServer { .. }));
}

#[tokio::test]
async fn test_concurrent_deregistration_removes_once() {
    let gw = TestGateway::start(test_config()).await;
    let id = gw.register(http_server("alpha", "search"));

    let (first, second) = tokio::join!(gw.gateway.deregister(&id), gw.gateway.deregister(&id));
    let mut outcomes = vec![first, second];
    outcomes.sort_by_key(|o| *o == DeregisterOutcome::AlreadyRemoved);
    assert_eq!(
        outcomes,
        vec![DeregisterOutcome::Removed, DeregisterOutcome::AlreadyRemoved]
    );
    assert_eq!(gw.telemetry.count(TelemetryKind::ServerDeregistered), 1);
}

#[tokio::test(start_paused = true)]
async fn test_deregister_waits_for_in_flight_requests() {
    let gw = TestGateway::start(test_config()).await;
    let id = gw.register(http_server("alpha", "search"));
    gw.script("alpha").set_delay(Duration::from_secs(3));

    let gateway = gw.gateway.clone();
    let in_flight = tokio::spawn(async move { gateway.route(&Principal::new("user"), search()).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let outcome = gw.gateway.deregister(&id).await;
    assert_eq!(outcome, DeregisterOutcome::Removed);

    let response = in_flight.await.unwrap().unwrap();
    assert_eq!(served_by(&response), endpoint("alpha"));
    assert_eq!(gw.script("alpha").calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_deregister_rejects_queued_backlog() {
    let mut config = test_config();
    config.queue.max_concurrent = Some(1);
    let gw = TestGateway::start(config).await;
    let id = gw.register(http_server("alpha", "search"));
    gw.script("alpha").set_delay(Duration::from_secs(5));

    let first = {
        let gateway = gw.gateway.clone();
        tokio::spawn(async move { gateway.route(&Principal::new("user"), search()).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = {
        let gateway = gw.gateway.clone();
        tokio::spawn(async move { gateway.route(&Principal::new("user"), search()).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let snapshot = gw.gateway.admin().server_snapshot(&id).unwrap();
    assert_eq!(snapshot.queue.in_flight, 1);
    assert_eq!(snapshot.queue.size, 1);

    assert_eq!(gw.gateway.deregister(&id).await, DeregisterOutcome::Removed);

    assert!(first.await.unwrap().is_ok());
    let err = second.await.unwrap().unwrap_err();
    assert!(
        matches!(err, RoutingError::NoAvailableServer { .. }),
        "backlog falls through and finds nothing else, got {err:?}"
    );
    assert_eq!(gw.script("alpha").calls(), 1);
}

#[tokio::test]
async fn test_deregistration_enters_maintenance_first() {
    let gw = TestGateway::start(test_config()).await;
    let id = gw.register(http_server("alpha", "search"));
    gw.gateway.deregister(&id).await;

    let events = gw.telemetry.of_kind(TelemetryKind::MaintenanceChanged);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].server_id, id);
    assert_eq!(
        events[0].detail.as_deref(),
        Some(format!("{} -> {}", HealthStatus::Unknown, HealthStatus::Maintenance).as_str())
    );
}

#[tokio::test]
async fn test_registrations_are_persisted_in_background() {
    let gw = TestGateway::start(test_config()).await;
    let keep = gw.register(http_server("keep", "search"));
    let drop_me = gw.register(http_server("drop-me", "search"));
    gw.gateway.deregister(&drop_me).await;
    gw.gateway.shutdown().await;

    let stored: Vec<_> = gw.store.servers().into_iter().filter_map(|s| s.id).collect();
    assert_eq!(stored, vec![keep]);
}
