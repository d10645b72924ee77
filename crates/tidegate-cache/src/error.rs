//! Cache backend error types.

use thiserror::Error;

pub type CacheResult<T> = Result<T, CacheError>;

/// Failures talking to a cache backend. Callers of
/// [`CacheService`](crate::CacheService) never see these; they are mapped
/// to misses, `false`, or the fallback tier.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("cache command timed out")]
    Timeout,

    #[error("cache protocol error: {0}")]
    Protocol(String),

    #[error("cache backend returned error: {0}")]
    Server(String),

    #[error("invalid cache url: {0}")]
    InvalidUrl(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    /// Whether the error means the backend is unreachable, as opposed to a
    /// command the backend rejected.
    pub fn is_connection_failure(&self) -> bool {
        !matches!(self, CacheError::Server(_) | CacheError::InvalidUrl(_))
    }
}
