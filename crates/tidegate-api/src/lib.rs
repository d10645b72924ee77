//! tidegate-api: HTTP surface for Tidegate.
//!
//! Serves the process's own health contract, the admin and monitoring
//! routes, Prometheus exposition, and a balanced `/api` surface wrapped in
//! the rate-limit and balancer middleware.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/health` | `{"status":"healthy"}` health contract |
//! | GET | `/metrics` | Prometheus exposition |
//! | GET | `/admin/status` | Nodes, strategy, policy, metrics, alerts, scaling events, cache |
//! | GET | `/admin/nodes` | List nodes |
//! | POST | `/admin/nodes` | Register a node |
//! | DELETE | `/admin/nodes/{id}` | Drain and deregister a node |
//! | GET | `/admin/scaling-policy` | Active scaling policy |
//! | PUT | `/admin/scaling-policy` | Replace the scaling policy |
//! | PUT | `/admin/strategy` | Switch the selection strategy |
//! | ANY | `/api/{*path}` | Balanced request; reports the node that served it |

pub mod handlers;
pub mod middleware;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{any, delete, get, put};

use tidegate_autoscale::Autoscaler;
use tidegate_balancer::LoadBalancer;
use tidegate_cache::CacheService;
use tidegate_metrics::{AlertMonitor, MetricsStore};
use tidegate_state::NodeRegistry;

pub use middleware::{RoutedNode, balancer_middleware, client_ip, rate_limit_middleware};

/// Shared state for handlers and middleware.
#[derive(Clone)]
pub struct AppState {
    pub registry: NodeRegistry,
    pub balancer: Arc<LoadBalancer>,
    pub metrics: Arc<MetricsStore>,
    pub alerts: Arc<AlertMonitor>,
    pub cache: Arc<CacheService>,
    pub autoscaler: Arc<Autoscaler>,
    /// Upper bound on waiting for a deregistered node to drain.
    pub drain_timeout: Duration,
}

/// Build the complete router (health, admin, metrics, balanced surface).
pub fn build_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route("/status", get(handlers::status))
        .route("/nodes", get(handlers::list_nodes).post(handlers::register_node))
        .route("/nodes/{id}", delete(handlers::deregister_node))
        .route(
            "/scaling-policy",
            get(handlers::get_scaling_policy).put(handlers::update_scaling_policy),
        )
        .route("/strategy", put(handlers::set_strategy));

    let balanced_routes = Router::new()
        .route("/api/{*path}", any(handlers::routed))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            balancer_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::prometheus_metrics))
        .nest("/admin", admin_routes)
        .merge(balanced_routes)
        .with_state(state)
}
