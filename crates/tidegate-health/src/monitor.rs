//! Health checker: background task that probes every registered node.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info};

use tidegate_core::HealthConfig;
use tidegate_state::{Node, NodeId, NodeRegistry, epoch_millis};

use crate::checker::{HealthTracker, HttpProber, ProbeResult, Prober, log_transition};

/// A node whose health flag changed during a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthTransition {
    pub node_id: NodeId,
    pub healthy: bool,
}

/// Summary of one probing round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub checked: usize,
    pub healthy: usize,
    pub transitions: Vec<HealthTransition>,
}

/// Probes all nodes in the registry and applies hysteresis to the results.
pub struct HealthChecker {
    registry: NodeRegistry,
    config: HealthConfig,
    prober: Arc<dyn Prober>,
    /// (node_id, registered_seq) → tracker. A re-registered id gets a fresh
    /// tracker; entries for removed nodes are pruned each round.
    trackers: Mutex<HashMap<(NodeId, u64), HealthTracker>>,
}

impl HealthChecker {
    pub fn new(registry: NodeRegistry, config: HealthConfig) -> Self {
        Self::with_prober(registry, config, Arc::new(HttpProber))
    }

    pub fn with_prober(registry: NodeRegistry, config: HealthConfig, prober: Arc<dyn Prober>) -> Self {
        Self {
            registry,
            config,
            prober,
            trackers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Probe every registered node once, concurrently.
    pub async fn check_once(&self) -> CheckReport {
        let nodes = self.registry.handles().await;
        let mut probes = JoinSet::new();

        for node in nodes {
            let prober = self.prober.clone();
            let path = self.config.endpoint.clone();
            let timeout = self.config.timeout;
            probes.spawn(async move {
                let started = Instant::now();
                // The checker enforces the timeout regardless of the prober.
                let result = tokio::time::timeout(timeout, prober.probe(&node, &path, timeout))
                    .await
                    .unwrap_or(ProbeResult::Failed);
                (node, result, started.elapsed())
            });
        }

        let mut results: Vec<(Arc<Node>, ProbeResult, Duration)> = Vec::with_capacity(probes.len());
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(outcome) => results.push(outcome),
                Err(e) => error!(error = %e, "health probe task failed"),
            }
        }

        self.apply(results).await
    }

    async fn apply(&self, results: Vec<(Arc<Node>, ProbeResult, Duration)>) -> CheckReport {
        let mut trackers = self.trackers.lock().await;
        let mut report = CheckReport {
            checked: results.len(),
            ..CheckReport::default()
        };
        let checked_at = epoch_millis();

        for (node, result, latency) in &results {
            node.record_probe(*latency, checked_at);

            let tracker = trackers
                .entry((node.id.clone(), node.registered_seq))
                .or_insert_with(|| HealthTracker::new(&self.config, node.is_healthy()));
            let was_healthy = tracker.is_healthy();
            let healthy = tracker.record(*result);

            if result != &ProbeResult::Healthy {
                debug!(
                    node_id = %node.id,
                    result = ?result,
                    failures = tracker.consecutive_failures(),
                    "health probe did not pass"
                );
            }

            if healthy != was_healthy {
                node.set_healthy(healthy);
                log_transition(node, healthy, tracker);
                report.transitions.push(HealthTransition {
                    node_id: node.id.clone(),
                    healthy,
                });
            }
            if healthy {
                report.healthy += 1;
            }
        }

        let live: Vec<(&str, u64)> = results
            .iter()
            .map(|(node, _, _)| (node.id.as_str(), node.registered_seq))
            .collect();
        trackers.retain(|(id, seq), _| live.contains(&(id.as_str(), *seq)));

        report
    }

    /// Run a round every `interval` until shutdown signal.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            endpoint = %self.config.endpoint,
            "health checker started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {
                    let report = self.check_once().await;
                    debug!(
                        checked = report.checked,
                        healthy = report.healthy,
                        transitions = report.transitions.len(),
                        "health round complete"
                    );
                }
                _ = shutdown.changed() => {
                    info!("health checker shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::BoxFuture;
    use std::sync::Mutex as StdMutex;
    use tidegate_state::{NodeAddress, NodeSpec};

    /// Returns a configurable result per node id; unknown nodes hang.
    #[derive(Default)]
    struct ScriptedProber {
        results: StdMutex<HashMap<String, ProbeResult>>,
    }

    impl ScriptedProber {
        fn set(&self, id: &str, result: ProbeResult) {
            self.results.lock().unwrap().insert(id.to_string(), result);
        }
    }

    impl Prober for ScriptedProber {
        fn probe<'a>(&'a self, node: &'a Node, _path: &'a str, _timeout: Duration) -> BoxFuture<'a, ProbeResult> {
            let scripted = self.results.lock().unwrap().get(&node.id).copied();
            Box::pin(async move {
                match scripted {
                    Some(result) => result,
                    None => std::future::pending().await,
                }
            })
        }
    }

    fn spec(id: &str, port: u16) -> NodeSpec {
        NodeSpec {
            id: id.to_string(),
            address: NodeAddress::new("http", "127.0.0.1", port),
            weight: 1,
            max_connections: 10,
        }
    }

    fn config() -> HealthConfig {
        HealthConfig {
            endpoint: "/health".into(),
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            healthy_threshold: 2,
            unhealthy_threshold: 3,
        }
    }

    async fn setup() -> (HealthChecker, NodeRegistry, Arc<ScriptedProber>) {
        let registry = NodeRegistry::new();
        let prober = Arc::new(ScriptedProber::default());
        let checker = HealthChecker::with_prober(registry.clone(), config(), prober.clone());
        (checker, registry, prober)
    }

    #[tokio::test]
    async fn three_failures_mark_unhealthy() {
        let (checker, registry, prober) = setup().await;
        registry.register(spec("a", 4001), true).await.unwrap();
        prober.set("a", ProbeResult::Failed);

        for _ in 0..2 {
            let report = checker.check_once().await;
            assert!(report.transitions.is_empty());
        }
        assert!(registry.get("a").await.unwrap().is_healthy());

        let report = checker.check_once().await;
        assert_eq!(
            report.transitions,
            vec![HealthTransition {
                node_id: "a".into(),
                healthy: false
            }]
        );
        assert!(!registry.get("a").await.unwrap().is_healthy());
        assert_eq!(registry.healthy_count().await, 0);
    }

    #[tokio::test]
    async fn recovery_after_two_successes() {
        let (checker, registry, prober) = setup().await;
        registry.register(spec("a", 4001), false).await.unwrap();
        prober.set("a", ProbeResult::Healthy);

        checker.check_once().await;
        assert!(!registry.get("a").await.unwrap().is_healthy());

        let report = checker.check_once().await;
        assert_eq!(report.healthy, 1);
        assert!(registry.get("a").await.unwrap().is_healthy());
    }

    #[tokio::test]
    async fn probe_latency_recorded() {
        let (checker, registry, prober) = setup().await;
        registry.register(spec("a", 4001), true).await.unwrap();
        prober.set("a", ProbeResult::Healthy);

        let node = registry.get("a").await.unwrap();
        assert!(node.last_health_check_at().is_none());
        checker.check_once().await;
        assert!(node.last_health_check_at().is_some());
        assert!(node.last_latency().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_probe_counts_as_failure() {
        let (checker, registry, prober) = setup().await;
        registry.register(spec("fast", 4001), true).await.unwrap();
        registry.register(spec("stuck", 4002), true).await.unwrap();
        prober.set("fast", ProbeResult::Healthy);

        for _ in 0..3 {
            checker.check_once().await;
        }
        assert!(registry.get("fast").await.unwrap().is_healthy());
        assert!(!registry.get("stuck").await.unwrap().is_healthy());
    }

    #[tokio::test]
    async fn removed_nodes_are_forgotten() {
        let (checker, registry, prober) = setup().await;
        registry.register(spec("a", 4001), true).await.unwrap();
        prober.set("a", ProbeResult::Failed);
        checker.check_once().await;
        checker.check_once().await;

        registry.remove("a").await.unwrap();
        checker.check_once().await;
        assert!(checker.trackers.lock().await.is_empty());

        // Re-registered under the same id: the failure streak starts over.
        registry.register(spec("a", 4001), true).await.unwrap();
        checker.check_once().await;
        assert!(registry.get("a").await.unwrap().is_healthy());
    }

    #[tokio::test]
    async fn reregistered_node_recovers_after_passing_checks() {
        let (checker, registry, prober) = setup().await;
        registry.register(spec("a", 4001), true).await.unwrap();
        prober.set("a", ProbeResult::Healthy);
        checker.check_once().await;

        // Replaced between rounds, so no round prunes the old tracker.
        registry.remove("a").await.unwrap();
        registry.register(spec("a", 4001), false).await.unwrap();

        checker.check_once().await;
        assert!(!registry.get("a").await.unwrap().is_healthy());

        let report = checker.check_once().await;
        assert_eq!(
            report.transitions,
            vec![HealthTransition {
                node_id: "a".into(),
                healthy: true
            }]
        );
        assert!(registry.get("a").await.unwrap().is_healthy());
        assert_eq!(checker.trackers.lock().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_probes_until_shutdown() {
        let registry = NodeRegistry::new();
        let prober = Arc::new(ScriptedProber::default());
        let checker = Arc::new(HealthChecker::with_prober(registry.clone(), config(), prober.clone()));
        registry.register(spec("a", 4001), true).await.unwrap();
        prober.set("a", ProbeResult::Failed);

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn({
            let checker = checker.clone();
            async move { checker.run(rx).await }
        });

        // Three rounds at 30s intervals.
        tokio::time::sleep(Duration::from_secs(95)).await;
        assert!(!registry.get("a").await.unwrap().is_healthy());

        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
