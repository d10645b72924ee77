//! Metrics store: bounded ring of recent request samples plus counters.
//!
//! Counters are atomics; the sample ring sits behind a `tokio::sync::RwLock`
//! held only for in-memory pushes and scans.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, watch};
use tracing::{debug, info};

use tidegate_core::MetricsConfig;
use tidegate_state::{RequestDescriptor, epoch_millis};

use crate::resources::ResourceProbe;

const ONE_MINUTE_MS: u64 = 60_000;

/// One completed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub request_id: String,
    /// Completion time, epoch milliseconds.
    pub timestamp: u64,
    pub method: String,
    pub path: String,
    pub client_ip: String,
    pub latency_ms: f64,
    pub status_code: u16,
    pub heap_used_bytes: u64,
}

impl PerformanceSample {
    pub fn is_error(&self) -> bool {
        self.status_code >= 400
    }
}

/// A request that has started but not yet completed.
#[derive(Debug)]
pub struct InFlightRequest {
    pub request_id: String,
    method: String,
    path: String,
    client_ip: String,
    started: Instant,
}

impl InFlightRequest {
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Average latency for one path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointStats {
    pub path: String,
    pub avg_latency_ms: f64,
    pub count: u64,
}

/// Statistics over the samples inside a window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregatedMetrics {
    pub window_ms: u64,
    pub sample_count: u64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    /// Errors over total within the window, as a percentage.
    pub error_rate_percent: f64,
    /// Samples completed in the last minute.
    pub requests_per_minute: u64,
    pub slowest_endpoints: Vec<EndpointStats>,
    /// Lifetime counters.
    pub total_requests: u64,
    pub total_errors: u64,
}

/// Holds recent samples for every routed request.
pub struct MetricsStore {
    samples: RwLock<VecDeque<PerformanceSample>>,
    total_requests: AtomicU64,
    total_errors: AtomicU64,
    next_request_id: AtomicU64,
    config: MetricsConfig,
    resources: Arc<dyn ResourceProbe>,
}

impl MetricsStore {
    pub fn new(config: MetricsConfig, resources: Arc<dyn ResourceProbe>) -> Self {
        Self {
            samples: RwLock::new(VecDeque::with_capacity(config.capacity.min(1024))),
            total_requests: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            next_request_id: AtomicU64::new(1),
            config,
            resources,
        }
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Start timing a request.
    pub fn begin(&self, request: &RequestDescriptor) -> InFlightRequest {
        let seq = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        InFlightRequest {
            request_id: format!("req-{:x}-{seq}", epoch_millis()),
            method: request.method.clone(),
            path: request.path.clone(),
            client_ip: request.client_ip.clone(),
            started: Instant::now(),
        }
    }

    /// Close an in-flight request and record its sample.
    pub async fn complete(&self, request: InFlightRequest, status_code: u16) -> PerformanceSample {
        let sample = PerformanceSample {
            latency_ms: request.started.elapsed().as_secs_f64() * 1000.0,
            request_id: request.request_id,
            timestamp: epoch_millis(),
            method: request.method,
            path: request.path,
            client_ip: request.client_ip,
            status_code,
            // Cached by the sampler; never refreshed on the request path.
            heap_used_bytes: self.resources.usage().process_resident_bytes,
        };
        self.record_sample(sample.clone()).await;
        sample
    }

    /// Append a sample and bump the lifetime counters.
    pub async fn record_sample(&self, sample: PerformanceSample) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if sample.is_error() {
            self.total_errors.fetch_add(1, Ordering::Relaxed);
        }
        debug!(
            request_id = %sample.request_id,
            method = %sample.method,
            path = %sample.path,
            status = sample.status_code,
            latency_ms = sample.latency_ms,
            "request sample recorded"
        );

        let mut samples = self.samples.write().await;
        if samples.len() >= self.config.capacity {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn total_errors(&self) -> u64 {
        self.total_errors.load(Ordering::Relaxed)
    }

    pub async fn sample_count(&self) -> usize {
        self.samples.read().await.len()
    }

    /// Copy of the most recent `limit` samples, newest last.
    pub async fn recent_samples(&self, limit: usize) -> Vec<PerformanceSample> {
        let samples = self.samples.read().await;
        let skip = samples.len().saturating_sub(limit);
        samples.iter().skip(skip).cloned().collect()
    }

    /// Aggregate over samples newer than `now - window`.
    pub async fn aggregate(&self, window: Duration) -> AggregatedMetrics {
        self.aggregate_at(epoch_millis(), window).await
    }

    /// [`aggregate`](Self::aggregate) against an explicit clock.
    pub async fn aggregate_at(&self, now_ms: u64, window: Duration) -> AggregatedMetrics {
        let window_ms = window.as_millis() as u64;
        let window_start = now_ms.saturating_sub(window_ms);
        let minute_start = now_ms.saturating_sub(ONE_MINUTE_MS);

        let samples = self.samples.read().await;
        let requests_per_minute = samples
            .iter()
            .filter(|s| s.timestamp > minute_start)
            .count() as u64;
        let in_window: Vec<&PerformanceSample> = samples
            .iter()
            .filter(|s| s.timestamp >= window_start)
            .collect();

        let mut aggregate = AggregatedMetrics {
            window_ms,
            sample_count: in_window.len() as u64,
            requests_per_minute,
            total_requests: self.total_requests(),
            total_errors: self.total_errors(),
            ..AggregatedMetrics::default()
        };
        if in_window.is_empty() {
            return aggregate;
        }

        let mut latencies: Vec<f64> = in_window.iter().map(|s| s.latency_ms).collect();
        latencies.sort_by(f64::total_cmp);
        let errors = in_window.iter().filter(|s| s.is_error()).count();

        aggregate.avg_latency_ms = latencies.iter().sum::<f64>() / latencies.len() as f64;
        aggregate.p95_latency_ms = percentile(&latencies, 95.0);
        aggregate.p99_latency_ms = percentile(&latencies, 99.0);
        aggregate.error_rate_percent = errors as f64 / in_window.len() as f64 * 100.0;
        aggregate.slowest_endpoints = slowest_endpoints(&in_window, self.config.top_endpoints);
        aggregate
    }

    /// Drop samples recorded before `cutoff_ms`. Returns how many went.
    pub async fn purge_older_than(&self, cutoff_ms: u64) -> usize {
        let mut samples = self.samples.write().await;
        let before = samples.len();
        samples.retain(|s| s.timestamp >= cutoff_ms);
        before - samples.len()
    }

    /// Purge everything outside the retention window.
    pub async fn purge_expired(&self) -> usize {
        let cutoff = epoch_millis().saturating_sub(self.config.retention.as_millis() as u64);
        self.purge_older_than(cutoff).await
    }

    /// Run the cleanup loop until shutdown signal.
    pub async fn run_cleanup(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.cleanup_interval.as_secs(),
            retention_secs = self.config.retention.as_secs(),
            "metrics cleanup started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.cleanup_interval) => {
                    let purged = self.purge_expired().await;
                    if purged > 0 {
                        debug!(purged, "aged-out samples purged");
                    }
                }
                _ = shutdown.changed() => {
                    info!("metrics cleanup shutting down");
                    break;
                }
            }
        }
    }
}

/// Nearest-rank percentile over an ascending-sorted slice.
///
/// `index = ceil(p/100 * n) - 1`, clamped to `[0, n-1]`. Empty input is 0.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let n = sorted.len();
    let rank = (p / 100.0 * n as f64).ceil() as i64 - 1;
    let index = rank.clamp(0, n as i64 - 1) as usize;
    sorted[index]
}

fn slowest_endpoints(samples: &[&PerformanceSample], top: usize) -> Vec<EndpointStats> {
    let mut by_path: HashMap<&str, (f64, u64)> = HashMap::new();
    for sample in samples {
        let entry = by_path.entry(sample.path.as_str()).or_insert((0.0, 0));
        entry.0 += sample.latency_ms;
        entry.1 += 1;
    }

    let mut endpoints: Vec<EndpointStats> = by_path
        .into_iter()
        .map(|(path, (sum, count))| EndpointStats {
            path: path.to_string(),
            avg_latency_ms: sum / count as f64,
            count,
        })
        .collect();
    endpoints.sort_by(|a, b| {
        b.avg_latency_ms
            .total_cmp(&a.avg_latency_ms)
            .then_with(|| a.path.cmp(&b.path))
    });
    endpoints.truncate(top);
    endpoints
}
