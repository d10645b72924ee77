//! Route handlers.
//!
//! Admin handlers answer with the `{success, data?, error?}` envelope.
//! `/health` and `/metrics` answer in their own fixed formats.

use axum::Json;
use axum::extract::{Extension, Path, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use tracing::info;

use tidegate_autoscale::{ScaleError, ScalingEvent};
use tidegate_cache::CacheStats;
use tidegate_core::{NodeConfig, ScalingPolicy, Strategy};
use tidegate_metrics::{AggregatedMetrics, Alert, render_prometheus};
use tidegate_state::{DrainOutcome, NodeSpec, NodeStats, StateError, epoch_millis};

use crate::AppState;
use crate::middleware::RoutedNode;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn state_error_status(e: &StateError) -> StatusCode {
    match e {
        StateError::NotFound(_) => StatusCode::NOT_FOUND,
        StateError::DuplicateNode(_) => StatusCode::CONFLICT,
        StateError::InvalidNode(_) => StatusCode::BAD_REQUEST,
    }
}

// ── Health ─────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthBody {
    pub status: String,
    pub timestamp: u64,
}

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(HealthBody {
        status: "healthy".to_string(),
        timestamp: epoch_millis(),
    })
}

// ── Status ─────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusReport {
    pub strategy: Strategy,
    pub healthy_nodes: usize,
    pub nodes: Vec<NodeStats>,
    pub policy: ScalingPolicy,
    pub cooldown_remaining_ms: Option<u64>,
    pub metrics: AggregatedMetrics,
    pub alerts: Vec<Alert>,
    pub scaling_events: Vec<ScalingEvent>,
    pub cache: CacheStats,
}

/// GET /admin/status
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let nodes = state.registry.stats().await;
    let report = StatusReport {
        strategy: state.balancer.strategy(),
        healthy_nodes: nodes.iter().filter(|n| n.healthy && !n.draining).count(),
        nodes,
        policy: state.autoscaler.policy().await,
        cooldown_remaining_ms: state
            .autoscaler
            .cooldown_remaining()
            .await
            .map(|d| d.as_millis() as u64),
        metrics: state.metrics.aggregate(state.metrics.config().retention).await,
        alerts: state.alerts.recent().await,
        scaling_events: state.autoscaler.recent_events().await,
        cache: state.cache.stats(),
    };
    ApiResponse::ok(report)
}

// ── Nodes ──────────────────────────────────────────────────────

/// GET /admin/nodes
pub async fn list_nodes(State(state): State<AppState>) -> impl IntoResponse {
    ApiResponse::ok(state.registry.snapshot().await)
}

/// Body of `POST /admin/nodes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterNodeRequest {
    #[serde(flatten)]
    pub node: NodeConfig,
    /// Nodes start unhealthy unless the caller vouches for them; the
    /// health checker confirms them either way.
    #[serde(default)]
    pub healthy: bool,
}

/// POST /admin/nodes
pub async fn register_node(
    State(state): State<AppState>,
    Json(req): Json<RegisterNodeRequest>,
) -> impl IntoResponse {
    let spec = NodeSpec::from(&req.node);
    match state.registry.register(spec, req.healthy).await {
        Ok(snapshot) => (StatusCode::CREATED, ApiResponse::ok(snapshot)).into_response(),
        Err(e) => error_response(&e.to_string(), state_error_status(&e)).into_response(),
    }
}

#[derive(Debug, Serialize)]
pub struct Deregistered {
    pub id: String,
    pub outcome: DrainOutcome,
}

/// DELETE /admin/nodes/{id}
pub async fn deregister_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.registry.drain_and_remove(&id, state.drain_timeout).await {
        Ok(outcome) => {
            info!(node = %id, ?outcome, "node deregistered");
            ApiResponse::ok(Deregistered { id, outcome }).into_response()
        }
        Err(e) => error_response(&e.to_string(), state_error_status(&e)).into_response(),
    }
}

// ── Scaling policy ─────────────────────────────────────────────

/// GET /admin/scaling-policy
pub async fn get_scaling_policy(State(state): State<AppState>) -> impl IntoResponse {
    ApiResponse::ok(state.autoscaler.policy().await)
}

/// PUT /admin/scaling-policy
pub async fn update_scaling_policy(
    State(state): State<AppState>,
    Json(policy): Json<ScalingPolicy>,
) -> impl IntoResponse {
    match state.autoscaler.update_policy(policy).await {
        Ok(_) => ApiResponse::ok(state.autoscaler.policy().await).into_response(),
        Err(e @ ScaleError::InvalidPolicy(_)) => {
            error_response(&e.to_string(), StatusCode::BAD_REQUEST).into_response()
        }
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

// ── Strategy ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct StrategyRequest {
    pub strategy: String,
}

#[derive(Debug, Serialize)]
pub struct StrategyChange {
    pub previous: Strategy,
    pub current: Strategy,
}

/// PUT /admin/strategy
pub async fn set_strategy(
    State(state): State<AppState>,
    Json(req): Json<StrategyRequest>,
) -> impl IntoResponse {
    match req.strategy.parse::<Strategy>() {
        Ok(strategy) => {
            let previous = state.balancer.set_strategy(strategy);
            ApiResponse::ok(StrategyChange {
                previous,
                current: strategy,
            })
            .into_response()
        }
        Err(e) => error_response(&e.to_string(), StatusCode::BAD_REQUEST).into_response(),
    }
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let aggregate = state.metrics.aggregate(state.metrics.config().retention).await;
    let nodes = state.registry.stats().await;
    let body = render_prometheus(&aggregate, &nodes);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

// ── Balanced surface ───────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct RoutedRequest {
    pub node_id: String,
    pub address: String,
    pub method: String,
    pub path: String,
}

/// ANY /api/{*path}
///
/// Nodes are logical records, so the request is answered here with the
/// node the balancer picked for it.
pub async fn routed(
    Extension(RoutedNode(node)): Extension<RoutedNode>,
    method: Method,
    uri: Uri,
) -> impl IntoResponse {
    ApiResponse::ok(RoutedRequest {
        address: node.address.to_string(),
        node_id: node.id,
        method: method.to_string(),
        path: uri.path().to_string(),
    })
}
