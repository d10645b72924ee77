//! Operator alerts for response time, memory and error-rate breaches.
//!
//! Alerts are structured `warn!` events plus a bounded history for the
//! admin surface. They never affect request handling.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tracing::{info, warn};

use tidegate_core::AlertThresholds;
use tidegate_state::epoch_millis;

use crate::resources::ResourceProbe;
use crate::store::{MetricsStore, PerformanceSample};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    ResponseTime,
    Memory,
    ErrorRate,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AlertKind::ResponseTime => "response_time",
            AlertKind::Memory => "memory",
            AlertKind::ErrorRate => "error_rate",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    /// Epoch milliseconds.
    pub timestamp: u64,
}

/// Watches samples and aggregates against [`AlertThresholds`].
pub struct AlertMonitor {
    thresholds: AlertThresholds,
    metrics: Arc<MetricsStore>,
    resources: Arc<dyn ResourceProbe>,
    history: Mutex<VecDeque<Alert>>,
}

impl AlertMonitor {
    pub fn new(
        thresholds: AlertThresholds,
        metrics: Arc<MetricsStore>,
        resources: Arc<dyn ResourceProbe>,
    ) -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(thresholds.history)),
            thresholds,
            metrics,
            resources,
        }
    }

    pub fn thresholds(&self) -> &AlertThresholds {
        &self.thresholds
    }

    /// Check one completed request for a slow response.
    pub async fn observe(&self, sample: &PerformanceSample) -> Option<Alert> {
        if sample.latency_ms <= self.thresholds.response_time_ms {
            return None;
        }
        let alert = Alert {
            kind: AlertKind::ResponseTime,
            message: format!(
                "{} {} took {:.0}ms (request {})",
                sample.method, sample.path, sample.latency_ms, sample.request_id
            ),
            value: sample.latency_ms,
            threshold: self.thresholds.response_time_ms,
            timestamp: sample.timestamp,
        };
        self.raise(alert.clone()).await;
        Some(alert)
    }

    /// Evaluate the error rate over the alert window and current memory use.
    pub async fn evaluate(&self) -> Vec<Alert> {
        let aggregate = self.metrics.aggregate(self.thresholds.window).await;
        let usage = self.resources.usage();
        let now = epoch_millis();
        let mut alerts = Vec::new();

        if aggregate.sample_count > 0
            && aggregate.error_rate_percent > self.thresholds.error_rate_percent
        {
            alerts.push(Alert {
                kind: AlertKind::ErrorRate,
                message: format!(
                    "error rate {:.1}% over the last {}s ({} requests)",
                    aggregate.error_rate_percent,
                    self.thresholds.window.as_secs(),
                    aggregate.sample_count
                ),
                value: aggregate.error_rate_percent,
                threshold: self.thresholds.error_rate_percent,
                timestamp: now,
            });
        }

        if usage.memory_percent > self.thresholds.memory_percent {
            alerts.push(Alert {
                kind: AlertKind::Memory,
                message: format!("memory usage at {:.1}%", usage.memory_percent),
                value: usage.memory_percent,
                threshold: self.thresholds.memory_percent,
                timestamp: now,
            });
        }

        for alert in &alerts {
            self.raise(alert.clone()).await;
        }
        alerts
    }

    /// Most recent alerts, oldest first.
    pub async fn recent(&self) -> Vec<Alert> {
        self.history.lock().await.iter().cloned().collect()
    }

    async fn raise(&self, alert: Alert) {
        warn!(
            kind = %alert.kind,
            value = alert.value,
            threshold = alert.threshold,
            message = %alert.message,
            "alert raised"
        );
        let mut history = self.history.lock().await;
        if history.len() >= self.thresholds.history {
            history.pop_front();
        }
        history.push_back(alert);
    }

    /// Run periodic evaluation until shutdown signal.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "alert monitor started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.evaluate().await;
                }
                _ = shutdown.changed() => {
                    info!("alert monitor shutting down");
                    break;
                }
            }
        }
    }
}
