//! Domain types for nodes and inbound requests.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use tidegate_core::NodeConfig;

/// Unique identifier for a node.
pub type NodeId = String;

/// Where a node listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(scheme: &str, host: &str, port: u16) -> Self {
        Self {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
        }
    }

    /// `host:port`, as used to open a TCP connection.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Everything needed to register a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    pub address: NodeAddress,
    pub weight: u32,
    pub max_connections: u32,
}

impl NodeSpec {
    pub fn validate(&self) -> Result<(), crate::StateError> {
        if self.id.is_empty() {
            return Err(crate::StateError::InvalidNode("empty id".into()));
        }
        if self.weight == 0 {
            return Err(crate::StateError::InvalidNode(format!(
                "{}: weight must be > 0",
                self.id
            )));
        }
        if self.max_connections == 0 {
            return Err(crate::StateError::InvalidNode(format!(
                "{}: max_connections must be > 0",
                self.id
            )));
        }
        Ok(())
    }
}

impl From<&NodeConfig> for NodeSpec {
    fn from(config: &NodeConfig) -> Self {
        Self {
            id: config
                .id
                .clone()
                .unwrap_or_else(|| format!("{}-{}", config.host, config.port)),
            address: NodeAddress::new(&config.scheme, &config.host, config.port),
            weight: config.weight,
            max_connections: config.max_connections,
        }
    }
}

/// A registered backend node.
///
/// Identity fields are immutable. Connection count, health and probe
/// data are atomics: `current_connections` is changed only through
/// [`Node::try_acquire`] / [`Node::release`], which the balancer calls.
#[derive(Debug)]
pub struct Node {
    pub id: NodeId,
    pub address: NodeAddress,
    pub weight: u32,
    pub max_connections: u32,
    /// Monotonic registration sequence, used for tie-breaks.
    pub registered_seq: u64,
    current_connections: AtomicU32,
    healthy: AtomicBool,
    draining: AtomicBool,
    /// Epoch millis of the last completed probe (0 = never).
    last_check_at_ms: AtomicU64,
    /// Latency of the last probe in microseconds.
    last_latency_us: AtomicU64,
}

impl Node {
    pub fn new(spec: NodeSpec, registered_seq: u64, healthy: bool) -> Self {
        Self {
            id: spec.id,
            address: spec.address,
            weight: spec.weight,
            max_connections: spec.max_connections,
            registered_seq,
            current_connections: AtomicU32::new(0),
            healthy: AtomicBool::new(healthy),
            draining: AtomicBool::new(false),
            last_check_at_ms: AtomicU64::new(0),
            last_latency_us: AtomicU64::new(0),
        }
    }

    pub fn current_connections(&self) -> u32 {
        self.current_connections.load(Ordering::Acquire)
    }

    pub fn has_capacity(&self) -> bool {
        self.current_connections() < self.max_connections
    }

    /// Take one connection slot unless the node is at `max_connections`.
    pub fn try_acquire(&self) -> bool {
        self.current_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.max_connections).then_some(current + 1)
            })
            .is_ok()
    }

    /// Give back one connection slot. Returns false if none was held.
    pub fn release(&self) -> bool {
        self.current_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            })
            .is_ok()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Set health, returning the previous value.
    pub fn set_healthy(&self, healthy: bool) -> bool {
        self.healthy.swap(healthy, Ordering::AcqRel)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub fn set_draining(&self) {
        self.draining.store(true, Ordering::Release);
    }

    /// Eligible for new traffic.
    pub fn is_selectable(&self) -> bool {
        self.is_healthy() && !self.is_draining()
    }

    pub fn record_probe(&self, latency: Duration, at_ms: u64) {
        self.last_latency_us
            .store(latency.as_micros() as u64, Ordering::Release);
        self.last_check_at_ms.store(at_ms, Ordering::Release);
    }

    pub fn last_latency(&self) -> Option<Duration> {
        if self.last_check_at_ms.load(Ordering::Acquire) == 0 {
            return None;
        }
        Some(Duration::from_micros(
            self.last_latency_us.load(Ordering::Acquire),
        ))
    }

    pub fn last_health_check_at(&self) -> Option<u64> {
        match self.last_check_at_ms.load(Ordering::Acquire) {
            0 => None,
            at => Some(at),
        }
    }

    /// Immutable copy of the node's current state.
    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            id: self.id.clone(),
            address: self.address.clone(),
            weight: self.weight,
            max_connections: self.max_connections,
            current_connections: self.current_connections(),
            healthy: self.is_healthy(),
            draining: self.is_draining(),
            last_health_check_at: self.last_health_check_at(),
            last_latency_ms: self.last_latency().map(|d| d.as_secs_f64() * 1000.0),
        }
    }

    pub fn stats(&self) -> NodeStats {
        let current = self.current_connections();
        NodeStats {
            id: self.id.clone(),
            healthy: self.is_healthy(),
            draining: self.is_draining(),
            current_connections: current,
            max_connections: self.max_connections,
            latency_ms: self.last_latency().map(|d| d.as_secs_f64() * 1000.0),
            connections_percent: current as f64 / self.max_connections as f64 * 100.0,
        }
    }
}

/// Point-in-time copy of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub address: NodeAddress,
    pub weight: u32,
    pub max_connections: u32,
    pub current_connections: u32,
    pub healthy: bool,
    pub draining: bool,
    pub last_health_check_at: Option<u64>,
    pub last_latency_ms: Option<f64>,
}

/// Per-node view for the monitoring surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStats {
    pub id: NodeId,
    pub healthy: bool,
    pub draining: bool,
    pub current_connections: u32,
    pub max_connections: u32,
    pub latency_ms: Option<f64>,
    pub connections_percent: f64,
}

// ── Requests ──────────────────────────────────────────────────────

/// What the resilience layer sees of an inbound request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub method: String,
    pub path: String,
    pub client_ip: String,
    pub headers: Vec<(String, String)>,
}

impl RequestDescriptor {
    pub fn new(method: &str, path: &str, client_ip: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            client_ip: client_ip.to_string(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Case-insensitive header lookup (first match).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
