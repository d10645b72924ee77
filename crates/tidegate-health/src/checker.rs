//! Health probe logic.
//!
//! Performs HTTP health checks against node endpoints and tracks
//! consecutive results with separate recovery and failure thresholds.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use serde::Deserialize;
use tracing::{debug, info, warn};

use tidegate_core::HealthConfig;
use tidegate_state::{Node, NodeAddress};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// 2xx with a body reporting `"status": "healthy"`.
    Healthy,
    /// The endpoint answered, but not with a healthy report.
    Unhealthy,
    /// The probe could not be executed (connection error, timeout).
    Failed,
}

impl ProbeResult {
    pub fn is_healthy(self) -> bool {
        self == ProbeResult::Healthy
    }
}

/// Tracks consecutive probe results for a single node.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    healthy: bool,
    consecutive_failures: u32,
    consecutive_successes: u32,
    /// Failures before a healthy node is marked unhealthy.
    unhealthy_threshold: u32,
    /// Successes before an unhealthy node is marked healthy.
    healthy_threshold: u32,
}

impl HealthTracker {
    /// Start tracking from the node's current health flag.
    pub fn new(config: &HealthConfig, healthy: bool) -> Self {
        Self::with_thresholds(config.unhealthy_threshold, config.healthy_threshold, healthy)
    }

    pub fn with_thresholds(unhealthy_threshold: u32, healthy_threshold: u32, healthy: bool) -> Self {
        Self {
            healthy,
            consecutive_failures: 0,
            consecutive_successes: 0,
            unhealthy_threshold: unhealthy_threshold.max(1),
            healthy_threshold: healthy_threshold.max(1),
        }
    }

    /// Record a probe result and return whether the node is now healthy.
    pub fn record(&mut self, result: ProbeResult) -> bool {
        if result.is_healthy() {
            self.consecutive_failures = 0;
            self.consecutive_successes = self.consecutive_successes.saturating_add(1);

            if !self.healthy && self.consecutive_successes >= self.healthy_threshold {
                debug!(successes = self.consecutive_successes, "node recovered to healthy");
                self.healthy = true;
            }
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);

            if self.healthy && self.consecutive_failures >= self.unhealthy_threshold {
                debug!(
                    failures = self.consecutive_failures,
                    threshold = self.unhealthy_threshold,
                    "node marked unhealthy"
                );
                self.healthy = false;
            }
        }

        self.healthy
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes
    }
}

/// Something that can check one node.
pub trait Prober: Send + Sync {
    fn probe<'a>(&'a self, node: &'a Node, path: &'a str, timeout: Duration) -> BoxFuture<'a, ProbeResult>;
}

/// Probes nodes over plain HTTP/1.1 with hyper.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpProber;

impl Prober for HttpProber {
    fn probe<'a>(&'a self, node: &'a Node, path: &'a str, timeout: Duration) -> BoxFuture<'a, ProbeResult> {
        Box::pin(http_probe(&node.address, path, timeout))
    }
}

#[derive(Deserialize)]
struct HealthReport {
    status: String,
}

/// Whether a health response body reports `"status": "healthy"`.
fn body_reports_healthy(body: &[u8]) -> bool {
    serde_json::from_slice::<HealthReport>(body).is_ok_and(|report| report.status == "healthy")
}

/// Perform an HTTP health probe against a node.
///
/// Returns `Healthy` for a 2xx whose JSON body has `status == "healthy"`,
/// `Unhealthy` for any other response, or `Failed` if the connection fails
/// or the whole exchange exceeds `timeout`.
pub async fn http_probe(address: &NodeAddress, path: &str, timeout: Duration) -> ProbeResult {
    if address.scheme != "http" {
        warn!(%address, "health probes support plain http only");
        return ProbeResult::Failed;
    }

    let authority = address.authority();
    let uri = format!("http://{authority}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(&authority).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "health probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "health probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", &authority)
            .header("user-agent", "tidegate-health/0.1")
            .header("accept", "application/json")
            .body(Empty::<Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                warn!(error = %e, %uri, "invalid health probe request");
                return ProbeResult::Failed;
            }
        };

        let resp = match sender.send_request(req).await {
            Ok(resp) => resp,
            Err(e) => {
                debug!(error = %e, %uri, "health probe request failed");
                return ProbeResult::Failed;
            }
        };

        let status = resp.status();
        if !status.is_success() {
            debug!(%status, %uri, "health probe non-2xx");
            return ProbeResult::Unhealthy;
        }

        let body = resp.into_body().collect().await.map(|c| c.to_bytes());
        match body {
            Ok(bytes) if body_reports_healthy(&bytes) => ProbeResult::Healthy,
            Ok(_) => {
                debug!(%uri, "health probe body did not report healthy");
                ProbeResult::Unhealthy
            }
            Err(e) => {
                debug!(error = %e, %uri, "health probe body read failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    match result {
        Ok(probe) => probe,
        Err(_) => {
            debug!(%uri, timeout_ms = timeout.as_millis() as u64, "health probe timed out");
            ProbeResult::Failed
        }
    }
}

/// Log a health transition for a node.
pub(crate) fn log_transition(node: &Node, healthy: bool, tracker: &HealthTracker) {
    if healthy {
        info!(
            node_id = %node.id,
            address = %node.address,
            successes = tracker.consecutive_successes(),
            "node healthy"
        );
    } else {
        warn!(
            node_id = %node.id,
            address = %node.address,
            failures = tracker.consecutive_failures(),
            "node unhealthy, removed from rotation"
        );
    }
}
