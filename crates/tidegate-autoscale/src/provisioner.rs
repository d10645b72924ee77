//! Where scale-up nodes come from.

use std::future::Future;
use std::pin::Pin;

use tidegate_core::ProvisionerConfig;
use tidegate_state::{NodeAddress, NodeSnapshot, NodeSpec};

use crate::error::{ScaleError, ScaleResult};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Produces specs for new nodes and is told when nodes go away.
pub trait NodeProvisioner: Send + Sync {
    /// A spec for one new node, given the nodes currently registered.
    fn provision<'a>(&'a self, existing: &'a [NodeSnapshot]) -> BoxFuture<'a, ScaleResult<NodeSpec>>;

    /// Called after a scaled-down node has been removed from the registry.
    fn decommission<'a>(&'a self, _node: &'a NodeSnapshot) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }
}

/// Hands out the lowest free port at or above `base_port` on a fixed host.
#[derive(Debug, Clone)]
pub struct PortRangeProvisioner {
    config: ProvisionerConfig,
}

impl PortRangeProvisioner {
    pub fn new(config: ProvisionerConfig) -> Self {
        Self { config }
    }

    fn next_spec(&self, existing: &[NodeSnapshot]) -> ScaleResult<NodeSpec> {
        let taken = |port: u16| {
            existing
                .iter()
                .any(|n| n.address.host == self.config.host && n.address.port == port)
        };
        let port = (self.config.base_port..=u16::MAX)
            .find(|port| !taken(*port))
            .ok_or_else(|| {
                ScaleError::Provision(format!(
                    "no free port on {} at or above {}",
                    self.config.host, self.config.base_port
                ))
            })?;

        Ok(NodeSpec {
            id: format!("scaled-{}-{port}", self.config.host),
            address: NodeAddress::new(&self.config.scheme, &self.config.host, port),
            weight: self.config.weight,
            max_connections: self.config.max_connections,
        })
    }
}

impl NodeProvisioner for PortRangeProvisioner {
    fn provision<'a>(&'a self, existing: &'a [NodeSnapshot]) -> BoxFuture<'a, ScaleResult<NodeSpec>> {
        Box::pin(async move { self.next_spec(existing) })
    }
}
