//! tidegate-autoscale: grows and shrinks the node set from load signals.
//!
//! Every evaluation reads the metrics aggregate, host CPU and memory, and
//! per-node connection counts, then decides:
//!
//! - **scale up** when below `max_nodes` and *any* of cpu, memory, average
//!   latency or error rate is over its threshold;
//! - **scale down** when above `min_nodes` and *all* of cpu, memory,
//!   average latency and connections per node are under their thresholds.
//!
//! Any attempted action starts the cooldown, even one the bounds reduced to
//! nothing. New nodes come from a [`NodeProvisioner`] and start unhealthy
//! until the health checker confirms them. Removed nodes are drained first,
//! bounded by the drain timeout.

pub mod error;
pub mod provisioner;
pub mod scaler;

pub use error::{ScaleError, ScaleResult};
pub use provisioner::{NodeProvisioner, PortRangeProvisioner};
pub use scaler::{Autoscaler, Evaluation, ScaleDecision, ScaleDirection, ScalingEvent, ScalingInputs, decide};
