//! tidegate-metrics: request performance monitoring for Tidegate.
//!
//! Keeps a bounded, time-windowed ring of per-request samples plus
//! lifetime counters, computes aggregates (average, nearest-rank
//! percentiles, error rate, requests per minute, slowest endpoints),
//! raises operator alerts, and renders Prometheus text.
//!
//! # Architecture
//!
//! ```text
//! MetricsStore
//!   ├── begin() / complete()  ← called per routed request
//!   ├── aggregate(window)     → AggregatedMetrics
//!   └── run_cleanup()         → periodic purge of aged-out samples
//!
//! AlertMonitor
//!   ├── observe(sample)       → response-time alerts
//!   └── run()                 → periodic error-rate / memory alerts
//!
//! ResourceProbe               → cached cpu %, memory %, resident bytes
//!   └── run_sampler()         → periodic refresh on the blocking pool
//! render_prometheus()         → text/plain for /metrics
//! ```

pub mod alerts;
pub mod prometheus;
pub mod resources;
pub mod store;

pub use alerts::{Alert, AlertKind, AlertMonitor};
pub use prometheus::render_prometheus;
pub use resources::{
    ResourceProbe, ResourceUsage, StaticResourceProbe, SystemResourceProbe, run_sampler,
};
pub use store::{AggregatedMetrics, EndpointStats, InFlightRequest, MetricsStore, PerformanceSample, percentile};
