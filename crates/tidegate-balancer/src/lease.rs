//! Scoped ownership of one connection slot on a node.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;

use tidegate_state::{Node, NodeId, NodeSnapshot};

/// One connection slot taken by [`LoadBalancer::select_server`].
///
/// The slot is returned exactly once: by [`release`](Self::release), or by
/// `Drop` on every other exit path (errors, panics, cancellation).
///
/// [`LoadBalancer::select_server`]: crate::LoadBalancer::select_server
#[derive(Debug)]
pub struct ConnectionLease {
    node: Arc<Node>,
    acquired_at: Instant,
    armed: bool,
}

impl ConnectionLease {
    /// The slot must already have been taken with [`Node::try_acquire`].
    pub(crate) fn new(node: Arc<Node>) -> Self {
        Self {
            node,
            acquired_at: Instant::now(),
            armed: true,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node.id
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        self.node.snapshot()
    }

    /// Time since the slot was taken.
    pub fn elapsed(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// `X-Server-*` headers describing the node serving this request.
    pub fn routing_headers(&self, response_time: Duration) -> Vec<(&'static str, String)> {
        vec![
            ("x-server-id", self.node.id.clone()),
            ("x-server-host", self.node.address.host.clone()),
            ("x-server-port", self.node.address.port.to_string()),
            (
                "x-server-connections",
                format!("{}/{}", self.node.current_connections(), self.node.max_connections),
            ),
            ("x-server-response-time", format!("{}ms", response_time.as_millis())),
        ]
    }

    /// Return the slot now.
    pub fn release(mut self) {
        self.release_slot();
    }

    /// Stop tracking the slot without returning it. The caller becomes
    /// responsible for calling [`LoadBalancer::release`] with the returned id.
    ///
    /// [`LoadBalancer::release`]: crate::LoadBalancer::release
    pub fn into_manual(mut self) -> NodeId {
        self.armed = false;
        self.node.id.clone()
    }

    fn release_slot(&mut self) {
        if !std::mem::replace(&mut self.armed, false) {
            return;
        }
        if !self.node.release() {
            warn!(node_id = %self.node.id, "lease released on a node with no open connections");
        }
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.release_slot();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidegate_state::{NodeAddress, NodeSpec};

    fn node(max_connections: u32) -> Arc<Node> {
        Arc::new(Node::new(
            NodeSpec {
                id: "node-0".into(),
                address: NodeAddress::new("http", "10.0.0.5", 4000),
                weight: 1,
                max_connections,
            },
            0,
            true,
        ))
    }

    fn lease(node: &Arc<Node>) -> ConnectionLease {
        assert!(node.try_acquire());
        ConnectionLease::new(node.clone())
    }

    #[test]
    fn drop_releases_once() {
        let node = node(10);
        let held = lease(&node);
        assert_eq!(node.current_connections(), 1);
        drop(held);
        assert_eq!(node.current_connections(), 0);
    }

    #[test]
    fn explicit_release_is_not_repeated_by_drop() {
        let node = node(10);
        let first = lease(&node);
        let _second = lease(&node);

        first.release();
        assert_eq!(node.current_connections(), 1);
    }

    #[test]
    fn manual_lease_keeps_slot() {
        let node = node(10);
        let id = lease(&node).into_manual();
        assert_eq!(id, "node-0");
        assert_eq!(node.current_connections(), 1);
    }

    #[test]
    fn headers_describe_node() {
        let node = node(50);
        let held = lease(&node);
        let headers = held.routing_headers(Duration::from_millis(42));
        let get = |name: &str| {
            headers
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, v)| v.as_str())
                .unwrap()
        };
        assert_eq!(get("x-server-id"), "node-0");
        assert_eq!(get("x-server-host"), "10.0.0.5");
        assert_eq!(get("x-server-port"), "4000");
        assert_eq!(get("x-server-connections"), "1/50");
        assert_eq!(get("x-server-response-time"), "42ms");
    }
}
