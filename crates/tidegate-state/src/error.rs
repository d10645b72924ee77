//! Error types for the node registry.

use thiserror::Error;

/// Result type alias for registry operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("node not found: {0}")]
    NotFound(String),

    #[error("node already registered: {0}")]
    DuplicateNode(String),

    #[error("invalid node: {0}")]
    InvalidNode(String),
}
