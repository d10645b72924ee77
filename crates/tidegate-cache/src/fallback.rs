//! In-process fixed-window counters used while the primary tier is down.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::backend::WindowCount;

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u64,
    reset_at: Instant,
}

/// Per-key fixed windows. Counts are local to this process.
#[derive(Debug, Default)]
pub struct FallbackRateLimiter {
    windows: Mutex<HashMap<String, Window>>,
}

impl FallbackRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request against `key`. A window that has passed its reset
    /// time starts over at 1.
    pub async fn increment(&self, key: &str, window: Duration) -> WindowCount {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;

        let entry = windows.entry(key.to_string()).or_insert(Window {
            count: 0,
            reset_at: now + window,
        });
        if now > entry.reset_at {
            entry.count = 0;
            entry.reset_at = now + window;
        }
        entry.count += 1;

        WindowCount {
            count: entry.count,
            ttl: entry.reset_at.saturating_duration_since(now),
        }
    }

    /// Drop windows whose reset time has passed. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        let before = windows.len();
        windows.retain(|_, w| now <= w.reset_at);
        before - windows.len()
    }

    pub async fn len(&self) -> usize {
        self.windows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.windows.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn counts_within_window() {
        let limiter = FallbackRateLimiter::new();
        let window = Duration::from_secs(60);

        for expected in 1..=3 {
            assert_eq!(limiter.increment("ip:1", window).await.count, expected);
        }
        assert_eq!(limiter.increment("ip:2", window).await.count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn resets_after_window() {
        let limiter = FallbackRateLimiter::new();
        let window = Duration::from_secs(60);
        limiter.increment("ip:1", window).await;
        limiter.increment("ip:1", window).await;

        tokio::time::advance(Duration::from_secs(61)).await;
        let fresh = limiter.increment("ip:1", window).await;
        assert_eq!(fresh.count, 1);
        assert_eq!(fresh.ttl, window);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_stale_windows() {
        let limiter = FallbackRateLimiter::new();
        limiter.increment("a", Duration::from_secs(1)).await;
        limiter.increment("b", Duration::from_secs(100)).await;

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(limiter.purge_expired().await, 1);
        assert_eq!(limiter.len().await, 1);
    }
}
