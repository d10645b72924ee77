//! tidegate-health: periodic health probing for Tidegate nodes.
//!
//! Probes every registered node concurrently and flips its health flag
//! once enough consecutive results agree.
//!
//! # Architecture
//!
//! ```text
//! HealthChecker
//!   ├── check_once(): one round
//!   │   ├── Prober::probe() per node (JoinSet, each bounded by timeout)
//!   │   ├── HealthTracker per node (consecutive successes / failures)
//!   │   └── Node::record_probe() + Node::set_healthy() on transitions
//!   └── run(shutdown): check_once() every interval
//! ```
//!
//! # Hysteresis
//!
//! A healthy node is marked unhealthy after `unhealthy_threshold`
//! consecutive failures; an unhealthy node returns after
//! `healthy_threshold` consecutive successes. A single flapping probe
//! never changes routing.

pub mod checker;
pub mod monitor;

pub use checker::{HealthTracker, HttpProber, ProbeResult, Prober, http_probe};
pub use monitor::{CheckReport, HealthChecker, HealthTransition};
