//! tidegate-cache: namespaced cache and fixed-window rate limiting.
//!
//! Two explicit tiers:
//!
//! ```text
//! CacheService
//!   ├── primary: Arc<dyn CacheBackend>   (RespBackend → Redis, or MemoryBackend)
//!   │     every call bounded by command_timeout
//!   ├── fallback: FallbackRateLimiter    (in-process windows, used while degraded)
//!   └── run_supervisor()                 (backoff reconnect → degraded → periodic retry)
//! ```
//!
//! While the primary is unreachable, `get` misses, `set`/`del`/`exists`
//! return false, and rate limiting switches to the fallback tier. Both
//! tiers use fixed windows, so a burst straddling a window boundary can
//! admit up to twice the limit.

pub mod backend;
pub mod error;
pub mod fallback;
pub mod memory;
pub mod resp;
pub mod service;

pub use backend::{BoxFuture, CacheBackend, WindowCount};
pub use error::{CacheError, CacheResult};
pub use fallback::FallbackRateLimiter;
pub use memory::MemoryBackend;
pub use resp::{RedisEndpoint, RespBackend};
pub use service::{
    CacheService, CacheStats, CacheTier, ConnectionState, Namespace, RateLimitDecision,
    backend_from_config,
};
