//! Selection error types.

use thiserror::Error;

/// Why no node could be selected. Both map to `503 Service Unavailable`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectError {
    #[error("no healthy nodes available")]
    NoHealthyNodes,

    #[error("all {healthy} healthy nodes are at connection capacity")]
    AtCapacity { healthy: usize },
}
