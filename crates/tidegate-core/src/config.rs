//! tidegate.toml configuration parser.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::{AlertThresholds, ScalingPolicy, Strategy};

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TidegateConfig {
    pub server: ServerConfig,
    pub balancer: BalancerConfig,
    pub health: HealthConfig,
    pub scaling: ScalingConfig,
    pub cache: CacheConfig,
    pub metrics: MetricsConfig,
    pub alerts: AlertThresholds,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub strategy: Strategy,
    /// Upper bound on how long a removed node may keep in-flight requests.
    #[serde(with = "crate::duration::serde_str")]
    pub drain_timeout: Duration,
    /// Nodes registered at startup.
    pub nodes: Vec<NodeConfig>,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::RoundRobin,
            drain_timeout: Duration::from_secs(30),
            nodes: Vec::new(),
        }
    }
}

/// A bootstrap node entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Defaults to `node-{index}` when omitted.
    pub id: Option<String>,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_weight() -> u32 {
    1
}

fn default_max_connections() -> u32 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// HTTP path probed on every node.
    pub endpoint: String,
    #[serde(with = "crate::duration::serde_str")]
    pub interval: Duration,
    #[serde(with = "crate::duration::serde_str")]
    pub timeout: Duration,
    /// Consecutive successes before an unhealthy node is healthy again.
    pub healthy_threshold: u32,
    /// Consecutive failures before a healthy node is marked unhealthy.
    pub unhealthy_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            endpoint: "/health".to_string(),
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            healthy_threshold: 2,
            unhealthy_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    /// How often the controller evaluates the policy.
    #[serde(with = "crate::duration::serde_str")]
    pub interval: Duration,
    pub policy: ScalingPolicy,
    pub provisioner: ProvisionerConfig,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            policy: ScalingPolicy::default(),
            provisioner: ProvisionerConfig::default(),
        }
    }
}

/// Template for nodes added by scale-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    pub scheme: String,
    pub host: String,
    /// Ports are handed out sequentially from here.
    pub base_port: u16,
    pub weight: u32,
    pub max_connections: u32,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            host: "127.0.0.1".to_string(),
            base_port: 4000,
            weight: default_weight(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// `redis://host:port`. When absent the in-process backend is primary.
    pub url: Option<String>,
    pub key_prefix: String,
    #[serde(with = "crate::duration::serde_str")]
    pub default_ttl: Duration,
    #[serde(with = "crate::duration::serde_str")]
    pub session_ttl: Duration,
    #[serde(with = "crate::duration::serde_str")]
    pub rate_limit_window: Duration,
    pub rate_limit_max: u64,
    /// Bound on every backend command; exceeding it counts as a failure.
    #[serde(with = "crate::duration::serde_str")]
    pub command_timeout: Duration,
    #[serde(with = "crate::duration::serde_str")]
    pub connect_timeout: Duration,
    /// How often expired in-memory entries and rate-limit windows are swept.
    #[serde(with = "crate::duration::serde_str")]
    pub sweep_interval: Duration,
    pub reconnect: ReconnectConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: "tidegate:".to_string(),
            default_ttl: Duration::from_secs(3600),
            session_ttl: Duration::from_secs(24 * 3600),
            rate_limit_window: Duration::from_secs(900),
            rate_limit_max: 100,
            command_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(60),
            reconnect: ReconnectConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    #[serde(with = "crate::duration::serde_str")]
    pub base_delay: Duration,
    #[serde(with = "crate::duration::serde_str")]
    pub max_delay: Duration,
    pub max_retries: u32,
    /// Retry cadence once the retry budget is spent.
    #[serde(with = "crate::duration::serde_str")]
    pub degraded_retry_interval: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            max_retries: 5,
            degraded_retry_interval: Duration::from_secs(30),
        }
    }
}

impl ReconnectConfig {
    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Samples older than this are purged.
    #[serde(with = "crate::duration::serde_str")]
    pub retention: Duration,
    /// Hard cap on retained samples.
    pub capacity: usize,
    #[serde(with = "crate::duration::serde_str")]
    pub cleanup_interval: Duration,
    /// How often host CPU and memory are sampled.
    #[serde(with = "crate::duration::serde_str")]
    pub sample_interval: Duration,
    /// How many of the slowest endpoints an aggregate reports.
    pub top_endpoints: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(3600),
            capacity: 10_000,
            cleanup_interval: Duration::from_secs(60),
            sample_interval: Duration::from_secs(5),
            top_endpoints: 5,
        }
    }
}

impl TidegateConfig {
    /// Read, parse and validate a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(?path, "configuration loaded");
        Ok(config)
    }

    /// Parse and validate a config document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: TidegateConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ids = std::collections::HashSet::new();
        for (index, node) in self.balancer.nodes.iter().enumerate() {
            if node.weight == 0 {
                return Err(ConfigError::Invalid(format!(
                    "balancer.nodes[{index}].weight must be > 0"
                )));
            }
            if node.max_connections == 0 {
                return Err(ConfigError::Invalid(format!(
                    "balancer.nodes[{index}].max_connections must be > 0"
                )));
            }
            if node.host.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "balancer.nodes[{index}].host must not be empty"
                )));
            }
            let id = node.id.clone().unwrap_or_else(|| format!("node-{index}"));
            if !ids.insert(id.clone()) {
                return Err(ConfigError::Invalid(format!("duplicate node id: {id}")));
            }
        }

        let health = &self.health;
        if !health.endpoint.starts_with('/') {
            return Err(ConfigError::Invalid(
                "health.endpoint must start with '/'".into(),
            ));
        }
        if health.interval.is_zero() {
            return Err(ConfigError::Invalid("health.interval must be > 0".into()));
        }
        if health.timeout.is_zero() || health.timeout >= health.interval {
            return Err(ConfigError::Invalid(
                "health.timeout must be > 0 and shorter than health.interval".into(),
            ));
        }
        if health.healthy_threshold == 0 || health.unhealthy_threshold == 0 {
            return Err(ConfigError::Invalid("health thresholds must be > 0".into()));
        }

        if self.scaling.interval.is_zero() {
            return Err(ConfigError::Invalid("scaling.interval must be > 0".into()));
        }
        self.scaling.policy.validate()?;
        let provisioner = &self.scaling.provisioner;
        if provisioner.weight == 0 || provisioner.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "scaling.provisioner weight and max_connections must be > 0".into(),
            ));
        }

        let cache = &self.cache;
        if let Some(url) = &cache.url
            && !url.starts_with("redis://")
        {
            return Err(ConfigError::Invalid(format!(
                "cache.url must use the redis:// scheme, got {url}"
            )));
        }
        if cache.rate_limit_max == 0 || cache.rate_limit_window.is_zero() {
            return Err(ConfigError::Invalid(
                "cache rate limit window and max must be > 0".into(),
            ));
        }
        if cache.command_timeout.is_zero() || cache.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid("cache timeouts must be > 0".into()));
        }
        if cache.reconnect.base_delay.is_zero()
            || cache.reconnect.max_delay < cache.reconnect.base_delay
        {
            return Err(ConfigError::Invalid(
                "cache.reconnect.max_delay must be >= base_delay > 0".into(),
            ));
        }

        if self.metrics.capacity == 0 || self.metrics.retention.is_zero() {
            return Err(ConfigError::Invalid(
                "metrics capacity and retention must be > 0".into(),
            ));
        }
        if self.metrics.cleanup_interval.is_zero() || self.metrics.sample_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "metrics cleanup_interval and sample_interval must be > 0".into(),
            ));
        }
        if self.alerts.history == 0 {
            return Err(ConfigError::Invalid("alerts.history must be > 0".into()));
        }
        Ok(())
    }

    /// Bootstrap nodes with their ids filled in.
    pub fn bootstrap_nodes(&self) -> Vec<NodeConfig> {
        self.balancer
            .nodes
            .iter()
            .enumerate()
            .map(|(index, node)| NodeConfig {
                id: Some(node.id.clone().unwrap_or_else(|| format!("node-{index}"))),
                ..node.clone()
            })
            .collect()
    }
}
