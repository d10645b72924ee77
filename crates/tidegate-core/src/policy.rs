//! Policy types shared by the balancer, autoscaler and monitor.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Server-selection strategy used by the load balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    #[default]
    RoundRobin,
    LeastConnections,
    Weighted,
    IpHash,
    /// First healthy node; no GeoIP data is consulted.
    Geographic,
}

impl Strategy {
    pub const ALL: [Strategy; 5] = [
        Strategy::RoundRobin,
        Strategy::LeastConnections,
        Strategy::Weighted,
        Strategy::IpHash,
        Strategy::Geographic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round-robin",
            Strategy::LeastConnections => "least-connections",
            Strategy::Weighted => "weighted",
            Strategy::IpHash => "ip-hash",
            Strategy::Geographic => "geographic",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Strategy::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == s)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown strategy: {s}")))
    }
}

/// Any single breached dimension triggers scale-up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleUpThresholds {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub latency_ms: f64,
    pub error_rate_percent: f64,
}

impl Default for ScaleUpThresholds {
    fn default() -> Self {
        Self {
            cpu_percent: 70.0,
            memory_percent: 80.0,
            latency_ms: 1000.0,
            error_rate_percent: 5.0,
        }
    }
}

/// Every dimension must be below its threshold for scale-down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleDownThresholds {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub latency_ms: f64,
    pub connections_per_node: f64,
}

impl Default for ScaleDownThresholds {
    fn default() -> Self {
        Self {
            cpu_percent: 30.0,
            memory_percent: 50.0,
            latency_ms: 200.0,
            connections_per_node: 10.0,
        }
    }
}

/// Thresholds, bounds and cooldown for the autoscaling controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingPolicy {
    pub scale_up: ScaleUpThresholds,
    pub scale_down: ScaleDownThresholds,
    /// Minimum time between two scaling actions.
    #[serde(with = "crate::duration::serde_str")]
    pub cooldown: Duration,
    pub min_nodes: u32,
    pub max_nodes: u32,
    pub scale_up_step: u32,
    pub scale_down_step: u32,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            scale_up: ScaleUpThresholds::default(),
            scale_down: ScaleDownThresholds::default(),
            cooldown: Duration::from_secs(300),
            min_nodes: 2,
            max_nodes: 10,
            scale_up_step: 1,
            scale_down_step: 1,
        }
    }
}

impl ScalingPolicy {
    /// Reject policies the controller could not act on sensibly.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_nodes == 0 {
            return Err(ConfigError::Invalid("scaling.max_nodes must be > 0".into()));
        }
        if self.min_nodes > self.max_nodes {
            return Err(ConfigError::Invalid(format!(
                "scaling.min_nodes ({}) exceeds scaling.max_nodes ({})",
                self.min_nodes, self.max_nodes
            )));
        }
        if self.scale_up_step == 0 || self.scale_down_step == 0 {
            return Err(ConfigError::Invalid("scaling steps must be > 0".into()));
        }

        let up = &self.scale_up;
        let down = &self.scale_down;
        let thresholds = [
            ("scale_up.cpu_percent", up.cpu_percent),
            ("scale_up.memory_percent", up.memory_percent),
            ("scale_up.latency_ms", up.latency_ms),
            ("scale_up.error_rate_percent", up.error_rate_percent),
            ("scale_down.cpu_percent", down.cpu_percent),
            ("scale_down.memory_percent", down.memory_percent),
            ("scale_down.latency_ms", down.latency_ms),
            ("scale_down.connections_per_node", down.connections_per_node),
        ];
        if let Some((name, value)) = thresholds
            .iter()
            .find(|(_, v)| !v.is_finite() || *v <= 0.0)
        {
            return Err(ConfigError::Invalid(format!(
                "scaling.{name} must be a positive number, got {value}"
            )));
        }

        // Overlapping bands would let one evaluation both grow and shrink.
        if down.cpu_percent >= up.cpu_percent
            || down.memory_percent >= up.memory_percent
            || down.latency_ms >= up.latency_ms
        {
            return Err(ConfigError::Invalid(
                "scale_down thresholds must sit below scale_up thresholds".into(),
            ));
        }
        Ok(())
    }
}

/// Operator alert thresholds for the performance monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub response_time_ms: f64,
    pub memory_percent: f64,
    pub error_rate_percent: f64,
    /// Window the periodic alert evaluation aggregates over.
    #[serde(with = "crate::duration::serde_str")]
    pub window: Duration,
    /// Number of recent alerts kept for the admin surface.
    pub history: usize,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            response_time_ms: 1000.0,
            memory_percent: 85.0,
            error_rate_percent: 5.0,
            window: Duration::from_secs(300),
            history: 100,
        }
    }
}
