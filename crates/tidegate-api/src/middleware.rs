//! Request middleware: per-client rate limiting and node selection.
//!
//! Both run through `axum::middleware::from_fn_with_state`. Rate limiting is
//! layered outside balancing, so a rejected request never takes a
//! connection slot.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use tidegate_cache::RateLimitDecision;
use tidegate_state::{NodeSnapshot, RequestDescriptor};

use crate::AppState;
use crate::handlers::error_response;

/// The node chosen for a request, available to handlers as an extension.
#[derive(Debug, Clone)]
pub struct RoutedNode(pub NodeSnapshot);

/// Client address: first `x-forwarded-for` hop, then the socket peer.
pub fn client_ip(request: &Request) -> String {
    let forwarded = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn describe(request: &Request) -> RequestDescriptor {
    let mut descriptor = RequestDescriptor::new(
        request.method().as_str(),
        request.uri().path(),
        &client_ip(request),
    );
    for (name, value) in request.headers() {
        if let Ok(value) = value.to_str() {
            descriptor = descriptor.with_header(name.as_str(), value);
        }
    }
    descriptor
}

// ── Balancer ───────────────────────────────────────────────────

/// Select a node, time the request, and tag the response with routing
/// headers. The lease is released when this future completes or is dropped.
pub async fn balancer_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let descriptor = describe(&request);
    let inflight = state.metrics.begin(&descriptor);

    let lease = match state.balancer.select_server(&descriptor).await {
        Ok(lease) => lease,
        Err(e) => {
            warn!(path = %descriptor.path, client_ip = %descriptor.client_ip, error = %e, "no node for request");
            let response =
                error_response(&e.to_string(), StatusCode::SERVICE_UNAVAILABLE).into_response();
            let sample = state.metrics.complete(inflight, response.status().as_u16()).await;
            state.alerts.observe(&sample).await;
            return response;
        }
    };

    request.extensions_mut().insert(RoutedNode(lease.snapshot()));
    let mut response = next.run(request).await;

    let headers = response.headers_mut();
    for (name, value) in lease.routing_headers(lease.elapsed()) {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }

    let sample = state.metrics.complete(inflight, response.status().as_u16()).await;
    debug!(
        node = %lease.node_id(),
        method = %sample.method,
        path = %sample.path,
        status = sample.status_code,
        latency_ms = sample.latency_ms,
        "request routed"
    );
    state.alerts.observe(&sample).await;
    lease.release();

    response
}

// ── Rate limiting ──────────────────────────────────────────────

fn set_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
    headers.insert("x-ratelimit-reset", HeaderValue::from(decision.reset_time.div_ceil(1000)));
}

/// Fixed-window limit per client address. Over the limit answers 429.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let client = client_ip(&request);
    let config = state.cache.config();
    let decision = state
        .cache
        .increment_rate_limit(&client, config.rate_limit_max, config.rate_limit_window)
        .await;

    if !decision.allowed {
        warn!(client_ip = %client, count = decision.count, limit = decision.limit, tier = ?decision.tier, "rate limit exceeded");
        let mut response = error_response(
            "too many requests, please try again later",
            StatusCode::TOO_MANY_REQUESTS,
        )
        .into_response();
        let headers = response.headers_mut();
        set_rate_limit_headers(headers, &decision);
        headers.insert("retry-after", HeaderValue::from(decision.retry_after_secs()));
        return response;
    }

    let mut response = next.run(request).await;
    set_rate_limit_headers(response.headers_mut(), &decision);
    response
}
