//! tidegate-core: shared configuration and policy types for Tidegate.
//!
//! Everything the resilience layer needs to know at startup lives in
//! [`TidegateConfig`], parsed from `tidegate.toml`. Components receive the
//! typed sections they need and never parse configuration themselves.

pub mod config;
pub mod duration;
pub mod policy;

pub use config::{
    BalancerConfig, CacheConfig, ConfigError, HealthConfig, MetricsConfig, NodeConfig,
    ProvisionerConfig, ReconnectConfig, ScalingConfig, ServerConfig, TidegateConfig,
};
pub use duration::{format_duration, parse_duration};
pub use policy::{AlertThresholds, ScaleDownThresholds, ScaleUpThresholds, ScalingPolicy, Strategy};
