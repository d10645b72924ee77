//! NodeRegistry: the shared, in-process list of backend nodes.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{StateError, StateResult};
use crate::types::*;

/// How often a drain re-checks the in-flight count.
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// How a node left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainOutcome {
    /// In-flight connections reached zero before removal.
    Drained,
    /// The drain timeout elapsed with connections still open.
    TimedOut { abandoned: u32 },
}

/// Thread-safe node registry. Cheap to clone.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    nodes: Arc<RwLock<Vec<Arc<Node>>>>,
    next_seq: Arc<AtomicU64>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node. Scale-up passes `healthy = false` so traffic waits
    /// for the health checker to confirm the node.
    pub async fn register(&self, spec: NodeSpec, healthy: bool) -> StateResult<NodeSnapshot> {
        spec.validate()?;
        let mut nodes = self.nodes.write().await;
        if nodes.iter().any(|n| n.id == spec.id) {
            return Err(StateError::DuplicateNode(spec.id));
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let node = Arc::new(Node::new(spec, seq, healthy));
        let snapshot = node.snapshot();
        nodes.push(node);
        info!(node = %snapshot.id, address = %snapshot.address, healthy, "node registered");
        Ok(snapshot)
    }

    /// Remove a node immediately, regardless of in-flight connections.
    pub async fn remove(&self, id: &str) -> StateResult<Arc<Node>> {
        let mut nodes = self.nodes.write().await;
        let index = nodes
            .iter()
            .position(|n| n.id == id)
            .ok_or_else(|| StateError::NotFound(id.to_string()))?;
        let node = nodes.remove(index);
        debug!(node = %id, "node removed from registry");
        Ok(node)
    }

    /// Stop routing to a node, wait for its connections to reach zero or
    /// for `timeout`, then remove it.
    pub async fn drain_and_remove(&self, id: &str, timeout: Duration) -> StateResult<DrainOutcome> {
        let node = self
            .get(id)
            .await
            .ok_or_else(|| StateError::NotFound(id.to_string()))?;
        node.set_draining();
        debug!(node = %id, in_flight = node.current_connections(), "draining node");

        let drained = tokio::time::timeout(timeout, async {
            while node.current_connections() > 0 {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        })
        .await
        .is_ok();

        self.remove(id).await?;
        let outcome = if drained {
            DrainOutcome::Drained
        } else {
            let abandoned = node.current_connections();
            warn!(node = %id, abandoned, timeout_ms = timeout.as_millis() as u64, "drain timed out; removing node");
            DrainOutcome::TimedOut { abandoned }
        };
        info!(node = %id, ?outcome, "node deregistered");
        Ok(outcome)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Node>> {
        let nodes = self.nodes.read().await;
        nodes.iter().find(|n| n.id == id).cloned()
    }

    /// All node handles, in registration order.
    pub async fn handles(&self) -> Vec<Arc<Node>> {
        self.nodes.read().await.clone()
    }

    /// Healthy, non-draining nodes in registration order.
    pub async fn healthy(&self) -> Vec<Arc<Node>> {
        let nodes = self.nodes.read().await;
        nodes.iter().filter(|n| n.is_selectable()).cloned().collect()
    }

    pub async fn healthy_count(&self) -> usize {
        let nodes = self.nodes.read().await;
        nodes.iter().filter(|n| n.is_selectable()).count()
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<NodeSnapshot> {
        let nodes = self.nodes.read().await;
        nodes.iter().map(|n| n.snapshot()).collect()
    }

    pub async fn stats(&self) -> Vec<NodeStats> {
        let nodes = self.nodes.read().await;
        nodes.iter().map(|n| n.stats()).collect()
    }
}
