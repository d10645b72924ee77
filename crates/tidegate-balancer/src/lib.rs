//! tidegate-balancer: picks a backend node for each request.
//!
//! Selection runs over the registry's healthy, non-draining nodes using
//! the active [`Strategy`](tidegate_core::Strategy). A successful selection
//! takes a connection slot on the node and hands it back as a
//! [`ConnectionLease`], which returns the slot exactly once: explicitly via
//! [`ConnectionLease::release`] or when dropped, including when the request
//! future is cancelled.
//!
//! Health is read as a snapshot; a selection may use a view that is up to
//! one health-check interval old.

pub mod balancer;
pub mod error;
pub mod lease;
pub mod strategy;

pub use balancer::LoadBalancer;
pub use error::SelectError;
pub use lease::ConnectionLease;
pub use strategy::{ip_hash, ip_hash_index, pick_least_connections, pick_weighted};
