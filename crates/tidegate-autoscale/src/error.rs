//! Autoscaler error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScaleError {
    #[error("invalid scaling policy: {0}")]
    InvalidPolicy(#[from] tidegate_core::ConfigError),

    #[error("provisioning failed: {0}")]
    Provision(String),

    #[error("state error: {0}")]
    State(#[from] tidegate_state::StateError),
}

pub type ScaleResult<T> = Result<T, ScaleError>;
