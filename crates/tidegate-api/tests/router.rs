//! Router tests: the balanced surface through both middleware layers.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use tidegate_api::{AppState, build_router};
use tidegate_autoscale::{Autoscaler, PortRangeProvisioner};
use tidegate_balancer::LoadBalancer;
use tidegate_cache::{CacheService, MemoryBackend};
use tidegate_core::{
    AlertThresholds, CacheConfig, MetricsConfig, ProvisionerConfig, ScalingConfig, Strategy,
};
use tidegate_metrics::{AlertMonitor, MetricsStore, StaticResourceProbe};
use tidegate_state::{NodeAddress, NodeRegistry, NodeSpec};

fn test_state(rate_limit_max: u64) -> AppState {
    let registry = NodeRegistry::new();
    let probe = Arc::new(StaticResourceProbe::default());
    let metrics = Arc::new(MetricsStore::new(MetricsConfig::default(), probe.clone()));
    let alerts = Arc::new(AlertMonitor::new(
        AlertThresholds::default(),
        metrics.clone(),
        probe.clone(),
    ));
    let cache = Arc::new(CacheService::new(
        Arc::new(MemoryBackend::new()),
        CacheConfig {
            rate_limit_max,
            rate_limit_window: Duration::from_secs(60),
            ..CacheConfig::default()
        },
    ));
    let autoscaler = Arc::new(Autoscaler::new(
        registry.clone(),
        metrics.clone(),
        probe,
        Arc::new(PortRangeProvisioner::new(ProvisionerConfig::default())),
        &ScalingConfig::default(),
        Duration::from_millis(200),
    ));
    AppState {
        balancer: Arc::new(LoadBalancer::new(registry.clone(), Strategy::RoundRobin)),
        registry,
        metrics,
        alerts,
        cache,
        autoscaler,
        drain_timeout: Duration::from_millis(200),
    }
}

async fn add_node(state: &AppState, id: &str, port: u16, max_connections: u32) {
    state
        .registry
        .register(
            NodeSpec {
                id: id.into(),
                address: NodeAddress::new("http", "10.1.0.1", port),
                weight: 1,
                max_connections,
            },
            true,
        )
        .await
        .unwrap();
}

fn get(uri: &str, client: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("x-forwarded-for", client)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn health_route_is_not_rate_limited() {
    let state = test_state(1);
    let router = build_router(state);

    for _ in 0..3 {
        let resp = router.clone().oneshot(get("/health", "10.9.9.9")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}

#[tokio::test]
async fn balanced_request_carries_routing_headers() {
    let state = test_state(100);
    add_node(&state, "a", 4001, 50).await;
    let router = build_router(state.clone());

    let resp = router.oneshot(get("/api/courses/7", "10.0.0.1")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let headers = resp.headers();
    assert_eq!(headers["x-server-id"], "a");
    assert_eq!(headers["x-server-host"], "10.1.0.1");
    assert_eq!(headers["x-server-port"], "4001");
    assert_eq!(headers["x-server-connections"], "1/50");
    assert!(headers["x-server-response-time"].to_str().unwrap().ends_with("ms"));
    assert_eq!(headers["x-ratelimit-limit"], "100");
    assert_eq!(headers["x-ratelimit-remaining"], "99");

    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["data"]["node_id"], "a");
    assert_eq!(body["data"]["path"], "/api/courses/7");

    // Lease released and sample recorded once the response is built.
    assert_eq!(state.registry.get("a").await.unwrap().current_connections(), 0);
    assert_eq!(state.metrics.total_requests(), 1);
}

#[tokio::test]
async fn round_robin_spreads_requests() {
    let state = test_state(100);
    add_node(&state, "a", 4001, 50).await;
    add_node(&state, "b", 4002, 50).await;
    let router = build_router(state);

    let mut served = Vec::new();
    for _ in 0..4 {
        let resp = router.clone().oneshot(get("/api/x", "10.0.0.1")).await.unwrap();
        served.push(resp.headers()["x-server-id"].to_str().unwrap().to_string());
    }
    assert_eq!(served, ["a", "b", "a", "b"]);
}

#[tokio::test]
async fn no_healthy_nodes_is_503_json() {
    let state = test_state(100);
    let router = build_router(state.clone());

    let resp = router.oneshot(get("/api/x", "10.0.0.1")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "no healthy nodes available");

    assert_eq!(state.metrics.total_errors(), 1);
}

#[tokio::test]
async fn over_limit_is_429_with_headers() {
    let state = test_state(2);
    add_node(&state, "a", 4001, 50).await;
    let router = build_router(state.clone());

    for _ in 0..2 {
        let resp = router.clone().oneshot(get("/api/x", "10.0.0.7")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    let resp = router.clone().oneshot(get("/api/x", "10.0.0.7")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    let headers = resp.headers();
    assert_eq!(headers["x-ratelimit-limit"], "2");
    assert_eq!(headers["x-ratelimit-remaining"], "0");
    assert!(headers.contains_key("x-ratelimit-reset"));
    assert!(headers.contains_key("retry-after"));
    assert!(!headers.contains_key("x-server-id"));

    // Rejected requests never reach the balancer.
    assert_eq!(state.metrics.total_requests(), 2);

    // Other clients keep their own window.
    let resp = router.oneshot(get("/api/x", "10.0.0.8")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn admin_register_then_route() {
    let state = test_state(100);
    let router = build_router(state.clone());

    let req = Request::builder()
        .method("POST")
        .uri("/admin/nodes")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"id":"fresh","host":"10.2.0.1","port":4500,"healthy":true}"#))
        .unwrap();
    let resp = router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = router.oneshot(get("/api/x", "10.0.0.1")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["x-server-id"], "fresh");
}

#[tokio::test]
async fn admin_strategy_switch_over_http() {
    let state = test_state(100);
    let router = build_router(state.clone());

    let req = Request::builder()
        .method("PUT")
        .uri("/admin/strategy")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"strategy":"ip-hash"}"#))
        .unwrap();
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(state.balancer.strategy(), Strategy::IpHash);
}
