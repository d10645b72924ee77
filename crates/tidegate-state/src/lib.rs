//! tidegate-state: in-process node registry for Tidegate.
//!
//! Nodes are logical backend records. The registry owns the list; each
//! entry is an `Arc<Node>` whose counters and flags are atomics, so the
//! balancer can take and release connection slots without holding the
//! registry lock.
//!
//! # Architecture
//!
//! ```text
//! NodeRegistry (Arc<RwLock<Vec<Arc<Node>>>>)
//!   ├── register / remove / drain_and_remove  ← autoscaler, admin API
//!   ├── healthy()                             ← balancer, autoscaler
//!   ├── handles()                             ← health checker
//!   └── snapshot() / stats()                  ← admin surface (immutable copies)
//! ```

pub mod error;
pub mod registry;
pub mod types;

pub use error::{StateError, StateResult};
pub use registry::{DrainOutcome, NodeRegistry};
pub use types::*;
