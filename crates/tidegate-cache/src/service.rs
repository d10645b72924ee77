//! Namespaced cache operations and rate limiting over a primary backend,
//! with an in-process fallback tier and a reconnect supervisor.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};

use tidegate_core::CacheConfig;
use tidegate_state::epoch_millis;

use crate::backend::{CacheBackend, WindowCount};
use crate::error::{CacheError, CacheResult};
use crate::fallback::FallbackRateLimiter;
use crate::memory::MemoryBackend;
use crate::resp::RespBackend;

/// Logical key spaces. Each maps to a fixed prefix under the configured
/// global prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    Session,
    User,
    RateLimit,
    Health,
    Api,
    Analytics,
}

impl Namespace {
    pub fn prefix(&self) -> &'static str {
        match self {
            Namespace::Session => "session:",
            Namespace::User => "user:",
            Namespace::RateLimit => "ratelimit:",
            Namespace::Health => "health:",
            Namespace::Api => "api:",
            Namespace::Analytics => "analytics:",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    Reconnecting,
    Degraded,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Connected,
            1 => ConnectionState::Reconnecting,
            _ => ConnectionState::Degraded,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Connected => 0,
            ConnectionState::Reconnecting => 1,
            ConnectionState::Degraded => 2,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Degraded => "degraded",
        })
    }
}

/// Which tier is currently answering rate-limit queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    Primary,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub count: u64,
    pub remaining: u64,
    /// Epoch milliseconds at which the current window resets.
    pub reset_time: u64,
    pub tier: CacheTier,
}

impl RateLimitDecision {
    fn from_window(window: WindowCount, limit: u64, tier: CacheTier) -> Self {
        Self {
            allowed: window.count <= limit,
            limit,
            count: window.count,
            remaining: limit.saturating_sub(window.count),
            reset_time: epoch_millis() + window.ttl.as_millis() as u64,
            tier,
        }
    }

    /// Whole seconds until the window resets, rounded up.
    pub fn retry_after_secs(&self) -> u64 {
        self.reset_time.saturating_sub(epoch_millis()).div_ceil(1000)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub backend: &'static str,
    pub state: ConnectionState,
    pub tier: CacheTier,
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub fallback_decisions: u64,
}

/// Build the primary backend described by `config`: Redis when a URL is
/// set, otherwise the in-process store.
pub fn backend_from_config(config: &CacheConfig) -> CacheResult<Arc<dyn CacheBackend>> {
    match &config.url {
        Some(url) => Ok(Arc::new(RespBackend::from_url(url, config.connect_timeout)?)),
        None => Ok(Arc::new(MemoryBackend::new())),
    }
}

/// Cache and rate limiter that never surfaces backend failures to callers.
pub struct CacheService {
    backend: Arc<dyn CacheBackend>,
    config: CacheConfig,
    state: AtomicU8,
    reconnect: Notify,
    fallback: FallbackRateLimiter,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    fallback_decisions: AtomicU64,
}

impl CacheService {
    /// The service starts out reconnecting; call [`connect`](Self::connect)
    /// before serving.
    pub fn new(backend: Arc<dyn CacheBackend>, config: CacheConfig) -> Self {
        Self {
            backend,
            config,
            state: AtomicU8::new(ConnectionState::Reconnecting.as_u8()),
            reconnect: Notify::new(),
            fallback: FallbackRateLimiter::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            fallback_decisions: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: CacheConfig) -> CacheResult<Self> {
        Ok(Self::new(backend_from_config(&config)?, config))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Initial connection attempt. On failure the supervisor is woken and
    /// the service runs on the fallback tier until it succeeds.
    pub async fn connect(&self) -> bool {
        if self.ping_backend().await {
            self.set_state(ConnectionState::Connected);
            info!(backend = self.backend.name(), "cache backend connected");
            true
        } else {
            self.set_state(ConnectionState::Reconnecting);
            warn!(
                backend = self.backend.name(),
                "cache backend unreachable at startup, using in-memory fallback"
            );
            self.reconnect.notify_one();
            false
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn tier(&self) -> CacheTier {
        match self.connection_state() {
            ConnectionState::Connected => CacheTier::Primary,
            _ => CacheTier::Fallback,
        }
    }

    /// Whether the primary backend should be used for the next command.
    pub fn ensure_connection(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            backend: self.backend.name(),
            state: self.connection_state(),
            tier: self.tier(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            fallback_decisions: self.fallback_decisions.load(Ordering::Relaxed),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn key(&self, namespace: Namespace, key: &str) -> String {
        format!("{}{}{}", self.config.key_prefix, namespace.prefix(), key)
    }

    fn default_ttl(&self, namespace: Namespace) -> Duration {
        match namespace {
            Namespace::Session => self.config.session_ttl,
            _ => self.config.default_ttl,
        }
    }

    async fn ping_backend(&self) -> bool {
        matches!(
            tokio::time::timeout(self.config.command_timeout, self.backend.ping()).await,
            Ok(Ok(()))
        )
    }

    fn record_failure(&self, op: &'static str, err: CacheError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        if !err.is_connection_failure() {
            debug!(op, error = %err, "cache command rejected");
            return;
        }
        let lost = self
            .state
            .compare_exchange(
                ConnectionState::Connected.as_u8(),
                ConnectionState::Reconnecting.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if lost {
            warn!(
                backend = self.backend.name(),
                op,
                error = %err,
                "cache backend connection lost, switching to in-memory fallback"
            );
            self.reconnect.notify_one();
        }
    }

    /// Run one backend command under the command timeout. `None` means the
    /// primary tier was skipped or failed.
    async fn call<T>(
        &self,
        op: &'static str,
        command: impl Future<Output = CacheResult<T>>,
    ) -> Option<T> {
        if !self.ensure_connection() {
            return None;
        }
        match tokio::time::timeout(self.config.command_timeout, command).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(err)) => {
                self.record_failure(op, err);
                None
            }
            Err(_) => {
                self.record_failure(op, CacheError::Timeout);
                None
            }
        }
    }

    // ── Key-value ───────────────────────────────────────────────────

    pub async fn get(&self, namespace: Namespace, key: &str) -> Option<Vec<u8>> {
        let key = self.key(namespace, key);
        let value = self.call("get", self.backend.get(&key)).await.flatten();
        let counter = if value.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        value
    }

    /// Store `value`. `None` uses the namespace default TTL.
    pub async fn set(
        &self,
        namespace: Namespace,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> bool {
        let key = self.key(namespace, key);
        let ttl = ttl.unwrap_or_else(|| self.default_ttl(namespace));
        self.call("set", self.backend.set(&key, value, ttl)).await.is_some()
    }

    pub async fn del(&self, namespace: Namespace, key: &str) -> bool {
        let key = self.key(namespace, key);
        self.call("del", self.backend.del(&key)).await.unwrap_or(false)
    }

    pub async fn exists(&self, namespace: Namespace, key: &str) -> bool {
        let key = self.key(namespace, key);
        self.call("exists", self.backend.exists(&key)).await.unwrap_or(false)
    }

    /// Values that fail to decode count as misses.
    pub async fn get_json<T: DeserializeOwned>(&self, namespace: Namespace, key: &str) -> Option<T> {
        let raw = self.get(namespace, key).await?;
        match serde_json::from_slice(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(key, error = %e, "cached value is not valid json");
                None
            }
        }
    }

    pub async fn set_json<T: Serialize>(
        &self,
        namespace: Namespace,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> bool {
        match serde_json::to_vec(value) {
            Ok(raw) => self.set(namespace, key, &raw, ttl).await,
            Err(e) => {
                debug!(key, error = %e, "value could not be encoded as json");
                false
            }
        }
    }

    // ── Rate limiting ───────────────────────────────────────────────

    /// Count one request against `key` in a fixed window of `window`.
    ///
    /// Uses the primary tier when connected. If the primary is down, or the
    /// command fails, the same call is answered by the in-process tier.
    pub async fn increment_rate_limit(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> RateLimitDecision {
        let key = self.key(Namespace::RateLimit, key);

        if let Some(count) = self.call("incr", self.backend.incr_window(&key, window)).await {
            return RateLimitDecision::from_window(count, limit, CacheTier::Primary);
        }

        self.fallback_decisions.fetch_add(1, Ordering::Relaxed);
        let count = self.fallback.increment(&key, window).await;
        RateLimitDecision::from_window(count, limit, CacheTier::Fallback)
    }

    // ── Background tasks ────────────────────────────────────────────

    /// Reconnect whenever a connection loss is signalled, until shutdown.
    pub async fn run_supervisor(&self, mut shutdown: watch::Receiver<bool>) {
        info!(backend = self.backend.name(), "cache supervisor started");

        loop {
            tokio::select! {
                _ = self.reconnect.notified() => {
                    if !self.reconnect_with_backoff(&mut shutdown).await {
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        info!("cache supervisor shutting down");
    }

    /// Returns false if shutdown interrupted the attempt.
    async fn reconnect_with_backoff(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let policy = &self.config.reconnect;

        for attempt in 0..policy.max_retries {
            let delay = policy.backoff(attempt);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return false,
            }
            if self.ping_backend().await {
                self.set_state(ConnectionState::Connected);
                info!(backend = self.backend.name(), attempt = attempt + 1, "cache backend reconnected");
                return true;
            }
            debug!(
                attempt = attempt + 1,
                max_retries = policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                "cache reconnect attempt failed"
            );
        }

        self.set_state(ConnectionState::Degraded);
        warn!(
            backend = self.backend.name(),
            retries = policy.max_retries,
            retry_interval_secs = policy.degraded_retry_interval.as_secs(),
            "cache backend still unreachable, running degraded"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(policy.degraded_retry_interval) => {}
                _ = shutdown.changed() => return false,
            }
            if self.ping_backend().await {
                self.set_state(ConnectionState::Connected);
                info!(backend = self.backend.name(), "cache backend recovered from degraded mode");
                return true;
            }
        }
    }

    /// Periodically sweep expired backend entries and fallback windows.
    pub async fn run_hygiene(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.config.sweep_interval;
        info!(interval_secs = interval.as_secs(), "cache hygiene started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let entries = self.backend.sweep_expired().await;
                    let windows = self.fallback.purge_expired().await;
                    if entries + windows > 0 {
                        debug!(entries, windows, "cache sweep complete");
                    }
                }
                _ = shutdown.changed() => {
                    info!("cache hygiene shutting down");
                    break;
                }
            }
        }
    }
}
