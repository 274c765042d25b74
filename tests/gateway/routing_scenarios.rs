// ABOUTME: End-to-end routing behaviour: candidate order, breaker gating, fall-through and errors

use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;

use mcp_gateway::gateway::{
    BreakerState, HealthStatus, Principal, RouteRequest, RoutingError, Stage, TenantId,
};

use super::fixtures::{endpoint, http_server, served_by, test_config, TestGateway};

fn search() -> RouteRequest {
    RouteRequest::tool_call("search", json!({ "q": "rust" }))
}

#[tokio::test]
async fn test_routes_to_healthy_server_first() {
    let gw = TestGateway::start(test_config()).await;
    gw.register(http_server("alpha", "search"));
    let beta = gw.register(http_server("beta", "search"));

    // Only beta has been probed, so it ranks ahead of the unknown alpha
    gw.gateway
        .admin()
        .probe_now(&Principal::system(), &beta)
        .await
        .unwrap();
    assert_eq!(gw.gateway.registry().health(&beta), Some(HealthStatus::Healthy));

    let response = gw.gateway.route(&Principal::new("user"), search()).await.unwrap();
    assert_eq!(served_by(&response), endpoint("beta"));
    assert_eq!(response["method"], "tools/call");
}

/// Three failed calls open the breaker; the next request never reaches the
/// server. The breaker itself answers `CircuitOpen`; at route level every
/// candidate being gated surfaces as `AllServersDown` (see DESIGN.md,
/// "All candidates gated").
#[tokio::test]
async fn test_breaker_opens_after_threshold_and_stops_traffic() {
    let gw = TestGateway::start(test_config()).await;
    let id = gw.register(http_server("flaky", "search"));
    let script = gw.script("flaky");
    script.set_failing(true);

    for _ in 0..3 {
        let err = gw.gateway.route(&Principal::new("user"), search()).await.unwrap_err();
        assert!(matches!(err, RoutingError::Transport { .. }), "got {err:?}");
    }
    assert_eq!(script.calls(), 3);

    let snapshot = gw.gateway.admin().server_snapshot(&id).unwrap();
    assert_eq!(snapshot.breaker.state, BreakerState::Open);
    assert_eq!(snapshot.breaker.times_opened, 1);

    let err = gw.gateway.route(&Principal::new("user"), search()).await.unwrap_err();
    match err {
        RoutingError::AllServersDown { retry_after, .. } => {
            let retry_after = retry_after.expect("breaker supplies a retry hint");
            assert!(retry_after <= Duration::from_secs(60));
            assert!(retry_after > Duration::from_secs(50));
        }
        other => panic!("expected AllServersDown, got {other:?}"),
    }
    assert_eq!(script.calls(), 3, "open breaker must not contact the server");
}

#[tokio::test]
async fn test_falls_through_past_open_breaker() {
    let gw = TestGateway::start(test_config()).await;
    let alpha = gw.register(http_server("alpha", "search"));
    let beta = gw.register(http_server("beta", "search"));
    let admin = gw.gateway.admin();
    let system = Principal::system();

    admin.probe_now(&system, &alpha).await.unwrap();
    admin.probe_now(&system, &beta).await.unwrap();
    admin
        .force_breaker_state(&system, &alpha, BreakerState::Open)
        .unwrap();

    for _ in 0..3 {
        let response = gw.gateway.route(&Principal::new("user"), search()).await.unwrap();
        assert_eq!(served_by(&response), endpoint("beta"));
    }
    assert_eq!(gw.script("alpha").calls(), 0);
}

#[tokio::test]
async fn test_tenant_cannot_reach_other_tenants_servers() {
    let gw = TestGateway::start(test_config()).await;
    gw.register(http_server("private", "search").with_tenant("t2"));

    let t1 = Principal::new("alice").with_tenant("t1");
    let err = gw.gateway.route(&t1, search()).await.unwrap_err();
    assert!(matches!(err, RoutingError::NoCapableServer { .. }));

    let t2 = Principal::new("bob").with_tenant("t2");
    let response = gw.gateway.route(&t2, search()).await.unwrap();
    assert_eq!(served_by(&response), endpoint("private"));

    let visible = gw.gateway.registry().lookup("search", Some(&TenantId::from("t1")));
    assert!(visible.is_empty());
}

#[tokio::test]
async fn test_rate_limited_requests_are_rejected_with_retry_hint() {
    let mut config = test_config();
    config.rate_limit.enabled = true;
    config.rate_limit.burst = 1;
    config.rate_limit.per_second = 0.5;
    let gw = TestGateway::start(config).await;
    gw.register(http_server("alpha", "search"));

    let user = Principal::new("user").with_tenant("t1");
    gw.gateway.route(&user, search()).await.unwrap();

    let err = gw.gateway.route(&user, search()).await.unwrap_err();
    match err {
        RoutingError::NoAvailableServer { retry_after, .. } => {
            assert!(retry_after.is_some_and(|d| d <= Duration::from_secs(2)));
        }
        other => panic!("expected NoAvailableServer, got {other:?}"),
    }

    // Buckets are per tenant
    let other = Principal::new("carol").with_tenant("t3");
    assert!(gw.gateway.route(&other, search()).await.is_ok());
}

#[tokio::test]
async fn test_protocol_errors_pass_through_with_upstream_code() {
    let gw = TestGateway::start(test_config()).await;
    gw.register(http_server("alpha", "search"));
    gw.script("alpha")
        .protocol_error
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let err = gw.gateway.route(&Principal::new("user"), search()).await.unwrap_err();
    assert!(matches!(err, RoutingError::Protocol { code: -32602, .. }));

    let rpc = err.to_jsonrpc_error(Some(json!(7)));
    assert_eq!(rpc["error"]["code"], -32602);
    assert_eq!(rpc["error"]["message"], "Invalid params");
    assert_eq!(rpc["error"]["data"]["reason"], "protocol_error");
    assert_eq!(rpc["id"], 7);
}

#[tokio::test(start_paused = true)]
async fn test_slow_call_times_out_and_counts_everywhere() {
    let gw = TestGateway::start(test_config()).await;
    let id = gw.register(http_server("slow", "search"));
    gw.script("slow").set_delay(Duration::from_secs(30));

    let err = gw.gateway.route(&Principal::new("user"), search()).await.unwrap_err();
    match err {
        RoutingError::Timeout { stage, elapsed, .. } => {
            assert_eq!(stage, Stage::Call);
            assert!(elapsed >= Duration::from_secs(5));
        }
        other => panic!("expected call timeout, got {other:?}"),
    }

    let snapshot = gw.gateway.admin().server_snapshot(&id).unwrap();
    assert_eq!(snapshot.breaker.total_timeouts, 1);
    assert_eq!(snapshot.breaker.consecutive_failures, 1);
    assert_eq!(snapshot.queue.total_timeouts, 1);
    assert_eq!(snapshot.queue.in_flight, 0);
    assert_eq!(snapshot.pools[0].total_timeouts, 1);
    assert_eq!(snapshot.pools[0].active, 0);
}

#[tokio::test]
async fn test_metrics_track_outcomes() {
    let gw = TestGateway::start(test_config()).await;
    gw.register(http_server("alpha", "search"));
    let user = Principal::new("user");

    gw.gateway.route(&user, search()).await.unwrap();
    let missing = RouteRequest::tool_call("translate", json!({}));
    assert!(gw.gateway.route(&user, missing).await.is_err());

    let metrics = gw.gateway.metrics();
    assert_eq!(metrics.requests_total, 2);
    assert_eq!(metrics.requests_succeeded, 1);
    assert_eq!(metrics.requests_rejected, 1);
    assert_eq!(metrics.requests_failed, 0);
}

#[tokio::test]
async fn test_successful_calls_update_rolling_statistics() {
    let gw = TestGateway::start(test_config()).await;
    let id = gw.register(http_server("alpha", "search"));

    for _ in 0..5 {
        gw.gateway.route(&Principal::new("user"), search()).await.unwrap();
    }

    let record = gw.gateway.registry().get(&id).unwrap();
    assert!(record.avg_response_time_ms.is_some());
    assert!((record.success_rate - 1.0).abs() < f64::EPSILON);
    // Request outcomes never move health on their own
    assert_eq!(record.health, HealthStatus::Unknown);

    let snapshot = gw.gateway.admin().server_snapshot(&id).unwrap();
    assert_eq!(snapshot.queue.total_processed, 5);
    assert_eq!(snapshot.pools[0].total_created, 1, "connection is reused");
}

/// A caller that stops waiting while its request is queued gives the slot
/// back at once.
#[tokio::test(start_paused = true)]
async fn test_abandoned_queued_request_frees_its_slot() {
    let mut config = test_config();
    config.queue.max_size = 1;
    config.queue.max_concurrent = Some(1);
    let gw = TestGateway::start(config).await;
    let id = gw.register(http_server("busy", "search"));
    gw.script("busy").set_delay(Duration::from_secs(4));

    let first = {
        let gateway = gw.gateway.clone();
        tokio::spawn(async move { gateway.route(&Principal::new("user"), search()).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let gave_up = tokio::time::timeout(
        Duration::from_millis(100),
        gw.gateway.route(&Principal::new("user"), search()),
    )
    .await;
    assert!(gave_up.is_err());

    let snapshot = gw.gateway.admin().server_snapshot(&id).unwrap();
    assert_eq!(snapshot.queue.size, 0);
    assert_eq!(snapshot.queue.in_flight, 1);
    assert_eq!(snapshot.queue.total_cancelled, 1);

    // The freed slot admits the next caller
    let third = {
        let gateway = gw.gateway.clone();
        tokio::spawn(async move { gateway.route(&Principal::new("user"), search()).await })
    };
    assert!(first.await.unwrap().is_ok());
    assert!(third.await.unwrap().is_ok());
    assert_eq!(gw.script("busy").calls(), 2);

    let snapshot = gw.gateway.admin().server_snapshot(&id).unwrap();
    assert_eq!(snapshot.queue.size, 0);
    assert_eq!(snapshot.queue.in_flight, 0);
    assert_eq!(snapshot.pools[0].active, 0);
}

/// Dropping a route whose request is already on the wire releases the
/// connection and does not count against the server.
#[tokio::test(start_paused = true)]
async fn test_abandoned_in_flight_request_releases_connection() {
    let gw = TestGateway::start(test_config()).await;
    let id = gw.register(http_server("slow", "search"));
    gw.script("slow").set_delay(Duration::from_secs(4));

    let in_flight = {
        let gateway = gw.gateway.clone();
        tokio::spawn(async move { gateway.route(&Principal::new("user"), search()).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        gw.gateway.admin().server_snapshot(&id).unwrap().pools[0].active,
        1
    );

    in_flight.abort();
    assert!(in_flight.await.unwrap_err().is_cancelled());
    tokio::time::sleep(Duration::from_millis(10)).await;

    let snapshot = gw.gateway.admin().server_snapshot(&id).unwrap();
    assert_eq!(snapshot.queue.size, 0);
    assert_eq!(snapshot.queue.in_flight, 0);
    assert_eq!(snapshot.queue.total_cancelled, 1);
    assert_eq!(snapshot.pools[0].active, 0);
    assert_eq!(snapshot.breaker.consecutive_failures, 0);
    assert_eq!(snapshot.breaker.total_requests, 0);
}
