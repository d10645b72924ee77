//! The primary-tier backend contract.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::error::CacheResult;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// State of a fixed rate-limit window after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Count including this increment.
    pub count: u64,
    /// Time until the window resets.
    pub ttl: Duration,
}

/// A key-value store with TTLs and atomic counters.
///
/// Keys arrive fully namespaced. Implementations report failures as
/// errors; the service decides how to degrade.
pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Cheap liveness check used by the reconnect supervisor.
    fn ping(&self) -> BoxFuture<'_, CacheResult<()>>;

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, CacheResult<Option<Vec<u8>>>>;

    /// Store a value. A zero `ttl` stores without expiry.
    fn set<'a>(&'a self, key: &'a str, value: &'a [u8], ttl: Duration) -> BoxFuture<'a, CacheResult<()>>;

    /// Returns whether the key existed.
    fn del<'a>(&'a self, key: &'a str) -> BoxFuture<'a, CacheResult<bool>>;

    fn exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, CacheResult<bool>>;

    /// Atomically increment a counter. The first increment of a window
    /// sets its expiry to `window`.
    fn incr_window<'a>(&'a self, key: &'a str, window: Duration) -> BoxFuture<'a, CacheResult<WindowCount>>;

    /// Remove expired entries eagerly. Backends that expire on their own
    /// keep the default.
    fn sweep_expired(&self) -> BoxFuture<'_, usize> {
        Box::pin(async { 0 })
    }
}
