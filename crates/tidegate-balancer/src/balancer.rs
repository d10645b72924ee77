//! Server selection over the node registry.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use rand::Rng;
use tracing::{debug, info, warn};

use tidegate_core::Strategy;
use tidegate_state::{Node, NodeRegistry, RequestDescriptor};

use crate::error::SelectError;
use crate::lease::ConnectionLease;
use crate::strategy::{ip_hash_index, pick_least_connections, pick_weighted};

fn strategy_index(strategy: Strategy) -> u8 {
    Strategy::ALL
        .iter()
        .position(|s| *s == strategy)
        .unwrap_or_default() as u8
}

/// Picks a node per request and takes a connection slot on it.
pub struct LoadBalancer {
    registry: NodeRegistry,
    /// Index into [`Strategy::ALL`].
    strategy: AtomicU8,
    /// Round-robin position. Taken modulo the healthy set at pick time, so
    /// membership changes never need a reset.
    rr_cursor: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(registry: NodeRegistry, strategy: Strategy) -> Self {
        Self {
            registry,
            strategy: AtomicU8::new(strategy_index(strategy)),
            rr_cursor: AtomicUsize::new(0),
        }
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn strategy(&self) -> Strategy {
        Strategy::ALL
            .get(self.strategy.load(Ordering::Acquire) as usize)
            .copied()
            .unwrap_or_default()
    }

    /// Switch strategy for subsequent selections. Returns the previous one.
    pub fn set_strategy(&self, strategy: Strategy) -> Strategy {
        let previous = self.strategy.swap(strategy_index(strategy), Ordering::AcqRel);
        let previous = Strategy::ALL
            .get(previous as usize)
            .copied()
            .unwrap_or_default();
        if previous != strategy {
            info!(from = %previous, to = %strategy, "load balancing strategy changed");
        }
        previous
    }

    /// Choose a node for `request` and take one of its connection slots.
    ///
    /// If the strategy's pick is at capacity, the first eligible node with a
    /// free slot is used instead.
    pub async fn select_server(&self, request: &RequestDescriptor) -> Result<ConnectionLease, SelectError> {
        let nodes = self.registry.healthy().await;
        if nodes.is_empty() {
            debug!(path = %request.path, "no healthy nodes for request");
            return Err(SelectError::NoHealthyNodes);
        }

        let strategy = self.strategy();
        let picked = self.pick(strategy, &nodes, request);
        let node = &nodes[picked];

        if node.try_acquire() {
            return Ok(ConnectionLease::new(node.clone()));
        }

        debug!(
            node_id = %node.id,
            strategy = %strategy,
            max_connections = node.max_connections,
            "picked node at capacity, falling back"
        );
        match nodes.iter().find(|candidate| candidate.try_acquire()) {
            Some(fallback) => Ok(ConnectionLease::new(fallback.clone())),
            None => {
                warn!(healthy = nodes.len(), "all healthy nodes at connection capacity");
                Err(SelectError::AtCapacity { healthy: nodes.len() })
            }
        }
    }

    /// Index into `nodes`, which the caller guarantees is non-empty.
    fn pick(&self, strategy: Strategy, nodes: &[Arc<Node>], request: &RequestDescriptor) -> usize {
        match strategy {
            Strategy::RoundRobin => self.rr_cursor.fetch_add(1, Ordering::Relaxed) % nodes.len(),
            Strategy::LeastConnections => pick_least_connections(nodes),
            Strategy::Weighted => {
                let weights: Vec<u32> = nodes.iter().map(|n| n.weight).collect();
                let total: f64 = weights.iter().map(|w| f64::from(*w)).sum();
                if total <= 0.0 {
                    return 0;
                }
                let r = rand::thread_rng().gen_range(0.0..total);
                pick_weighted(&weights, r)
            }
            Strategy::IpHash => ip_hash_index(&request.client_ip, nodes.len()),
            Strategy::Geographic => 0,
        }
    }

    /// Return a slot by node id, for callers that detached their lease with
    /// [`ConnectionLease::into_manual`]. Never drives a counter below zero.
    pub async fn release(&self, node_id: &str) -> bool {
        let Some(node) = self.registry.get(node_id).await else {
            debug!(%node_id, "release for unknown node ignored");
            return false;
        };
        let released = node.release();
        if !released {
            warn!(%node_id, "release without a matching selection ignored");
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tidegate_state::{NodeAddress, NodeSpec};

    fn spec(id: &str, port: u16, weight: u32, max_connections: u32) -> NodeSpec {
        NodeSpec {
            id: id.into(),
            address: NodeAddress::new("http", "127.0.0.1", port),
            weight,
            max_connections,
        }
    }

    async fn balancer(strategy: Strategy, specs: Vec<NodeSpec>) -> LoadBalancer {
        let registry = NodeRegistry::new();
        for s in specs {
            registry.register(s, true).await.unwrap();
        }
        LoadBalancer::new(registry, strategy)
    }

    fn request(ip: &str) -> RequestDescriptor {
        RequestDescriptor::new("GET", "/api/items", ip)
    }

    #[tokio::test]
    async fn round_robin_cycles() {
        let lb = balancer(
            Strategy::RoundRobin,
            vec![spec("a", 1, 1, 10), spec("b", 2, 1, 10), spec("c", 3, 1, 10)],
        )
        .await;

        let mut picked = Vec::new();
        for _ in 0..6 {
            picked.push(lb.select_server(&request("1.1.1.1")).await.unwrap().node_id().to_string());
        }
        assert_eq!(picked, ["a", "b", "c", "a", "b", "c"]);
    }

    #[tokio::test]
    async fn round_robin_continues_over_a_shrunken_set() {
        let lb = balancer(
            Strategy::RoundRobin,
            vec![spec("a", 1, 1, 10), spec("b", 2, 1, 10), spec("c", 3, 1, 10)],
        )
        .await;
        async fn next(lb: &LoadBalancer) -> String {
            lb.select_server(&request("1.1.1.1")).await.unwrap().node_id().to_string()
        }

        assert_eq!(next(&lb).await, "a");
        assert_eq!(next(&lb).await, "b");

        // Healthy set is now [a, c]; the cursor is not reset.
        lb.registry().get("b").await.unwrap().set_healthy(false);
        assert_eq!(next(&lb).await, "a");
        assert_eq!(next(&lb).await, "c");
        assert_eq!(next(&lb).await, "a");
    }

    #[tokio::test]
    async fn least_connections_returns_minimum() {
        let lb = balancer(
            Strategy::LeastConnections,
            vec![spec("a", 1, 1, 10), spec("b", 2, 1, 10), spec("c", 3, 1, 10)],
        )
        .await;

        let mut held = Vec::new();
        for _ in 0..7 {
            let lease = lb.select_server(&request("1.1.1.1")).await.unwrap();
            let counts: Vec<u32> = lb
                .registry()
                .handles()
                .await
                .iter()
                .map(|n| n.current_connections())
                .collect();
            let chosen = lease.node().current_connections();
            // After taking the slot, the chosen node is at most one above the minimum.
            assert!(chosen <= counts.iter().min().unwrap() + 1);
            held.push(lease);
        }
        // 7 leases over 3 nodes spread as 3/2/2.
        let counts: Vec<u32> = lb.registry().handles().await.iter().map(|n| n.current_connections()).collect();
        assert_eq!(counts, [3, 2, 2]);
    }

    #[tokio::test]
    async fn unhealthy_only_yields_no_result() {
        let lb = balancer(Strategy::RoundRobin, vec![spec("a", 1, 1, 10), spec("b", 2, 1, 10)]).await;
        for node in lb.registry().handles().await {
            node.set_healthy(false);
        }

        for strategy in Strategy::ALL {
            lb.set_strategy(strategy);
            assert_eq!(
                lb.select_server(&request("1.1.1.1")).await.unwrap_err(),
                SelectError::NoHealthyNodes
            );
        }
    }

    #[tokio::test]
    async fn empty_registry_yields_no_result() {
        let lb = balancer(Strategy::LeastConnections, Vec::new()).await;
        assert_eq!(
            lb.select_server(&request("1.1.1.1")).await.unwrap_err(),
            SelectError::NoHealthyNodes
        );
    }

    #[tokio::test]
    async fn weighted_converges_to_ratio() {
        let lb = balancer(Strategy::Weighted, vec![spec("heavy", 1, 3, 10), spec("light", 2, 1, 10)]).await;

        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..20_000 {
            let lease = lb.select_server(&request("1.1.1.1")).await.unwrap();
            *counts.entry(lease.node_id().to_string()).or_default() += 1;
        }
        let ratio = f64::from(counts["heavy"]) / f64::from(counts["light"]);
        assert!((2.6..3.4).contains(&ratio), "ratio {ratio}");
    }

    #[tokio::test]
    async fn ip_hash_is_sticky() {
        let lb = balancer(
            Strategy::IpHash,
            vec![spec("a", 1, 1, 10), spec("b", 2, 1, 10), spec("c", 3, 1, 10)],
        )
        .await;

        for ip in ["10.0.0.1", "10.0.0.2", "172.16.4.20", "2001:db8::1"] {
            let first = lb.select_server(&request(ip)).await.unwrap().node_id().to_string();
            for _ in 0..5 {
                assert_eq!(lb.select_server(&request(ip)).await.unwrap().node_id(), first);
            }
        }
    }

    #[tokio::test]
    async fn geographic_takes_first_healthy() {
        let lb = balancer(Strategy::Geographic, vec![spec("a", 1, 1, 10), spec("b", 2, 1, 10)]).await;
        assert_eq!(lb.select_server(&request("1.1.1.1")).await.unwrap().node_id(), "a");

        lb.registry().get("a").await.unwrap().set_healthy(false);
        assert_eq!(lb.select_server(&request("1.1.1.1")).await.unwrap().node_id(), "b");
    }

    #[tokio::test]
    async fn capacity_fallback_then_exhaustion() {
        let lb = balancer(Strategy::Geographic, vec![spec("a", 1, 1, 1), spec("b", 2, 1, 1)]).await;

        let first = lb.select_server(&request("1.1.1.1")).await.unwrap();
        assert_eq!(first.node_id(), "a");
        let second = lb.select_server(&request("1.1.1.1")).await.unwrap();
        assert_eq!(second.node_id(), "b");

        assert_eq!(
            lb.select_server(&request("1.1.1.1")).await.unwrap_err(),
            SelectError::AtCapacity { healthy: 2 }
        );

        drop(first);
        assert_eq!(lb.select_server(&request("1.1.1.1")).await.unwrap().node_id(), "a");
    }

    #[tokio::test]
    async fn draining_nodes_are_skipped() {
        let lb = balancer(Strategy::Geographic, vec![spec("a", 1, 1, 10), spec("b", 2, 1, 10)]).await;
        lb.registry().get("a").await.unwrap().set_draining();
        assert_eq!(lb.select_server(&request("1.1.1.1")).await.unwrap().node_id(), "b");
    }

    #[tokio::test]
    async fn lease_released_when_task_is_cancelled() {
        let lb = Arc::new(balancer(Strategy::RoundRobin, vec![spec("a", 1, 1, 10)]).await);
        let node = lb.registry().get("a").await.unwrap();

        let task = tokio::spawn({
            let lb = lb.clone();
            async move {
                let _lease = lb.select_server(&request("1.1.1.1")).await.unwrap();
                std::future::pending::<()>().await;
            }
        });

        while node.current_connections() == 0 {
            tokio::task::yield_now().await;
        }
        task.abort();
        let _ = task.await;
        assert_eq!(node.current_connections(), 0);
    }

    #[tokio::test]
    async fn release_by_id_never_goes_negative() {
        let lb = balancer(Strategy::RoundRobin, vec![spec("a", 1, 1, 10)]).await;
        let id = lb.select_server(&request("1.1.1.1")).await.unwrap().into_manual();

        assert!(lb.release(&id).await);
        assert!(!lb.release(&id).await);
        assert!(!lb.release("missing").await);
        assert_eq!(lb.registry().get("a").await.unwrap().current_connections(), 0);
    }

    #[tokio::test]
    async fn strategy_switches_at_runtime() {
        let lb = balancer(Strategy::RoundRobin, vec![spec("a", 1, 1, 10)]).await;
        assert_eq!(lb.set_strategy(Strategy::IpHash), Strategy::RoundRobin);
        assert_eq!(lb.strategy(), Strategy::IpHash);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_selection_respects_capacity() {
        let lb = Arc::new(balancer(Strategy::RoundRobin, vec![spec("a", 1, 1, 5), spec("b", 2, 1, 5)]).await);

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let lb = lb.clone();
                tokio::spawn(async move { lb.select_server(&request("1.1.1.1")).await.ok().map(|l| l.into_manual()) })
            })
            .collect();

        let mut granted = 0;
        for task in tasks {
            if task.await.unwrap().is_some() {
                granted += 1;
            }
        }
        assert_eq!(granted, 10);
        for node in lb.registry().handles().await {
            assert_eq!(node.current_connections(), 5);
        }
    }
}
