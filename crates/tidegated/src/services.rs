//! Service assembly and the lifecycle of the background loops.

use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use tidegate_api::AppState;
use tidegate_autoscale::{Autoscaler, PortRangeProvisioner};
use tidegate_balancer::LoadBalancer;
use tidegate_cache::CacheService;
use tidegate_core::TidegateConfig;
use tidegate_health::HealthChecker;
use tidegate_metrics::{AlertMonitor, MetricsStore, ResourceProbe, SystemResourceProbe};
use tidegate_state::{NodeRegistry, NodeSpec};

/// Every long-lived component, wired to one registry.
pub struct Services {
    pub config: TidegateConfig,
    pub registry: NodeRegistry,
    pub balancer: Arc<LoadBalancer>,
    pub metrics: Arc<MetricsStore>,
    pub alerts: Arc<AlertMonitor>,
    pub cache: Arc<CacheService>,
    pub health: Arc<HealthChecker>,
    pub autoscaler: Arc<Autoscaler>,
    pub resources: Arc<dyn ResourceProbe>,
}

impl Services {
    /// Build the components and register the bootstrap nodes.
    pub async fn build(config: TidegateConfig) -> anyhow::Result<Self> {
        let resources = tokio::task::spawn_blocking(SystemResourceProbe::new)
            .await
            .context("resource probe initialisation failed")?;
        Self::build_with_probe(config, Arc::new(resources)).await
    }

    pub async fn build_with_probe(
        config: TidegateConfig,
        resources: Arc<dyn ResourceProbe>,
    ) -> anyhow::Result<Self> {
        config.validate().context("invalid configuration")?;

        let registry = NodeRegistry::new();
        for node in config.bootstrap_nodes() {
            registry
                .register(NodeSpec::from(&node), true)
                .await
                .context("failed to register bootstrap node")?;
        }
        info!(nodes = registry.len().await, "bootstrap nodes registered");

        let balancer = Arc::new(LoadBalancer::new(registry.clone(), config.balancer.strategy));
        let metrics = Arc::new(MetricsStore::new(config.metrics.clone(), resources.clone()));
        let alerts = Arc::new(AlertMonitor::new(
            config.alerts.clone(),
            metrics.clone(),
            resources.clone(),
        ));
        let cache = Arc::new(
            CacheService::from_config(config.cache.clone()).context("invalid cache backend")?,
        );
        let health = Arc::new(HealthChecker::new(registry.clone(), config.health.clone()));
        let autoscaler = Arc::new(Autoscaler::new(
            registry.clone(),
            metrics.clone(),
            resources.clone(),
            Arc::new(PortRangeProvisioner::new(config.scaling.provisioner.clone())),
            &config.scaling,
            config.balancer.drain_timeout,
        ));

        Ok(Self {
            config,
            registry,
            balancer,
            metrics,
            alerts,
            cache,
            health,
            autoscaler,
            resources,
        })
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            registry: self.registry.clone(),
            balancer: self.balancer.clone(),
            metrics: self.metrics.clone(),
            alerts: self.alerts.clone(),
            cache: self.cache.clone(),
            autoscaler: self.autoscaler.clone(),
            drain_timeout: self.config.balancer.drain_timeout,
        }
    }

    pub fn router(&self) -> Router {
        tidegate_api::build_router(self.app_state())
    }

    /// First connection attempt to the cache backend. A failure is not
    /// fatal: the supervisor keeps retrying and the fallback tier serves.
    pub async fn connect_cache(&self) {
        if !self.cache.connect().await {
            warn!(backend = self.cache.stats().backend, "cache unavailable at startup, using fallback tier");
        }
    }

    /// Spawn every periodic loop. Each stops when `shutdown` flips.
    pub fn spawn_background(&self, shutdown: &watch::Receiver<bool>) -> Vec<(&'static str, JoinHandle<()>)> {
        let mut tasks = Vec::new();

        let health = self.health.clone();
        let rx = shutdown.clone();
        tasks.push(("health", tokio::spawn(async move { health.run(rx).await })));

        let autoscaler = self.autoscaler.clone();
        let rx = shutdown.clone();
        tasks.push(("autoscaler", tokio::spawn(async move { autoscaler.run(rx).await })));

        let metrics = self.metrics.clone();
        let rx = shutdown.clone();
        tasks.push(("metrics-cleanup", tokio::spawn(async move { metrics.run_cleanup(rx).await })));

        let alerts = self.alerts.clone();
        let interval = self.config.metrics.cleanup_interval;
        let rx = shutdown.clone();
        tasks.push(("alerts", tokio::spawn(async move { alerts.run(interval, rx).await })));

        let cache = self.cache.clone();
        let rx = shutdown.clone();
        tasks.push(("cache-supervisor", tokio::spawn(async move { cache.run_supervisor(rx).await })));

        let resources = self.resources.clone();
        let interval = self.config.metrics.sample_interval;
        let rx = shutdown.clone();
        tasks.push((
            "resource-sampler",
            tokio::spawn(tidegate_metrics::run_sampler(resources, interval, rx)),
        ));

        let cache = self.cache.clone();
        let rx = shutdown.clone();
        tasks.push(("cache-hygiene", tokio::spawn(async move { cache.run_hygiene(rx).await })));

        info!(tasks = tasks.len(), "background tasks started");
        tasks
    }
}

/// Wait for every task, logging any that panicked.
pub async fn join_all(tasks: Vec<(&'static str, JoinHandle<()>)>) {
    for (name, handle) in tasks {
        if let Err(e) = handle.await {
            tracing::error!(task = name, error = %e, "background task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tidegate_core::NodeConfig;
    use tidegate_metrics::StaticResourceProbe;

    fn config_with_nodes(ports: &[u16]) -> TidegateConfig {
        let mut config = TidegateConfig::default();
        config.balancer.nodes = ports
            .iter()
            .map(|port| NodeConfig {
                id: None,
                scheme: "http".into(),
                host: "127.0.0.1".into(),
                port: *port,
                weight: 1,
                max_connections: 10,
            })
            .collect();
        config
    }

    async fn build(config: TidegateConfig) -> Services {
        Services::build_with_probe(config, Arc::new(StaticResourceProbe::default()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn bootstrap_nodes_register_healthy() {
        let services = build(config_with_nodes(&[4001, 4002])).await;
        let snapshot = services.registry.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].id, "node-0");
        assert_eq!(snapshot[1].id, "node-1");
        assert!(snapshot.iter().all(|n| n.healthy));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let mut config = TidegateConfig::default();
        config.scaling.policy.min_nodes = 10;
        config.scaling.policy.max_nodes = 1;
        let result = Services::build_with_probe(config, Arc::new(StaticResourceProbe::default())).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn background_tasks_stop_on_shutdown() {
        let services = build(config_with_nodes(&[])).await;
        let (tx, rx) = watch::channel(false);
        let tasks = services.spawn_background(&rx);
        assert_eq!(tasks.len(), 7);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), join_all(tasks))
            .await
            .expect("background tasks did not stop");
    }
}
