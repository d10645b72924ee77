//! In-process backend with lazy TTL expiry.
//!
//! Serves as the primary tier when no Redis URL is configured, and as a
//! controllable stand-in for Redis in tests: [`MemoryBackend::set_available`]
//! simulates an outage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::backend::{BoxFuture, CacheBackend, WindowCount};
use crate::error::{CacheError, CacheResult};

struct MemoryEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

pub struct MemoryBackend {
    entries: Mutex<HashMap<String, MemoryEntry>>,
    available: AtomicBool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Toggle simulated reachability.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    fn check_available(&self) -> CacheResult<()> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(CacheError::Unavailable("memory backend disabled".into()))
        }
    }
}

impl CacheBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn ping(&self) -> BoxFuture<'_, CacheResult<()>> {
        Box::pin(async move { self.check_available() })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, CacheResult<Option<Vec<u8>>>> {
        Box::pin(async move {
            self.check_available()?;
            let mut entries = self.entries.lock().await;
            let now = Instant::now();
            match entries.get(key) {
                Some(entry) if entry.is_expired(now) => {
                    entries.remove(key);
                    Ok(None)
                }
                Some(entry) => Ok(Some(entry.value.clone())),
                None => Ok(None),
            }
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a [u8], ttl: Duration) -> BoxFuture<'a, CacheResult<()>> {
        Box::pin(async move {
            self.check_available()?;
            let expires_at = (!ttl.is_zero()).then(|| Instant::now() + ttl);
            self.entries.lock().await.insert(
                key.to_string(),
                MemoryEntry {
                    value: value.to_vec(),
                    expires_at,
                },
            );
            Ok(())
        })
    }

    fn del<'a>(&'a self, key: &'a str) -> BoxFuture<'a, CacheResult<bool>> {
        Box::pin(async move {
            self.check_available()?;
            let removed = self.entries.lock().await.remove(key);
            Ok(removed.is_some_and(|entry| !entry.is_expired(Instant::now())))
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, CacheResult<bool>> {
        Box::pin(async move {
            self.check_available()?;
            let entries = self.entries.lock().await;
            Ok(entries
                .get(key)
                .is_some_and(|entry| !entry.is_expired(Instant::now())))
        })
    }

    fn incr_window<'a>(&'a self, key: &'a str, window: Duration) -> BoxFuture<'a, CacheResult<WindowCount>> {
        Box::pin(async move {
            self.check_available()?;
            let mut entries = self.entries.lock().await;
            let now = Instant::now();

            let live = entries.get(key).filter(|entry| !entry.is_expired(now));
            let (count, expires_at) = match live {
                Some(entry) => {
                    let current: u64 = std::str::from_utf8(&entry.value)
                        .ok()
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| {
                            CacheError::Server("value is not an integer".into())
                        })?;
                    (current + 1, entry.expires_at.unwrap_or(now + window))
                }
                None => (1, now + window),
            };

            entries.insert(
                key.to_string(),
                MemoryEntry {
                    value: count.to_string().into_bytes(),
                    expires_at: Some(expires_at),
                },
            );
            Ok(WindowCount {
                count,
                ttl: expires_at.saturating_duration_since(now),
            })
        })
    }

    fn sweep_expired(&self) -> BoxFuture<'_, usize> {
        Box::pin(async move {
            let mut entries = self.entries.lock().await;
            let now = Instant::now();
            let before = entries.len();
            entries.retain(|_, entry| !entry.is_expired(now));
            let swept = before - entries.len();
            if swept > 0 {
                debug!(swept, "expired memory cache entries swept");
            }
            swept
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn set_get_expire() {
        let backend = MemoryBackend::new();
        backend.set("k", b"v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some(b"v".to_vec()));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_ttl_never_expires() {
        let backend = MemoryBackend::new();
        backend.set("k", b"v", Duration::ZERO).await.unwrap();
        tokio::time::advance(Duration::from_secs(86_400)).await;
        assert!(backend.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn del_reports_presence() {
        let backend = MemoryBackend::new();
        backend.set("k", b"v", Duration::from_secs(5)).await.unwrap();
        assert!(backend.del("k").await.unwrap());
        assert!(!backend.del("k").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn incr_window_sets_ttl_on_first_increment() {
        let backend = MemoryBackend::new();
        let first = backend.incr_window("rl", Duration::from_secs(60)).await.unwrap();
        assert_eq!(first.count, 1);
        assert_eq!(first.ttl, Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(10)).await;
        let second = backend.incr_window("rl", Duration::from_secs(60)).await.unwrap();
        assert_eq!(second.count, 2);
        // The window keeps its original expiry.
        assert_eq!(second.ttl, Duration::from_secs(50));

        tokio::time::advance(Duration::from_secs(51)).await;
        let fresh = backend.incr_window("rl", Duration::from_secs(60)).await.unwrap();
        assert_eq!(fresh.count, 1);
    }

    #[tokio::test]
    async fn incr_on_non_integer_fails() {
        let backend = MemoryBackend::new();
        backend.set("k", b"text", Duration::from_secs(5)).await.unwrap();
        assert!(matches!(
            backend.incr_window("k", Duration::from_secs(5)).await,
            Err(CacheError::Server(_))
        ));
    }

    #[tokio::test]
    async fn unavailable_backend_errors() {
        let backend = MemoryBackend::new();
        backend.set_available(false);
        assert!(matches!(backend.ping().await, Err(CacheError::Unavailable(_))));
        assert!(backend.get("k").await.is_err());
        backend.set_available(true);
        assert!(backend.ping().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_only_expired() {
        let backend = MemoryBackend::new();
        backend.set("short", b"1", Duration::from_secs(1)).await.unwrap();
        backend.set("long", b"2", Duration::from_secs(100)).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(backend.sweep_expired().await, 1);
        assert_eq!(backend.len().await, 1);
    }
}
