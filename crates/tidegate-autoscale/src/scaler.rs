//! Autoscaler: threshold-driven scaling decisions with a global cooldown.
//!
//! [`decide`] is a pure function of the policy and the current inputs.
//! [`Autoscaler`] gathers the inputs, enforces the cooldown, and carries the
//! decision out against the registry.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use tidegate_core::{ScalingConfig, ScalingPolicy};
use tidegate_metrics::{MetricsStore, ResourceProbe};
use tidegate_state::{DrainOutcome, NodeId, NodeRegistry, epoch_millis};

use crate::error::ScaleResult;
use crate::provisioner::NodeProvisioner;

const EVENT_HISTORY: usize = 50;

/// Everything a scaling decision looks at.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScalingInputs {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub avg_latency_ms: f64,
    pub error_rate_percent: f64,
    /// Connections summed over healthy nodes.
    pub active_connections: u64,
    pub healthy_nodes: u32,
    /// Registered, non-draining nodes, including ones not yet confirmed
    /// healthy. Scale-up is capped against this.
    pub total_nodes: u32,
}

impl ScalingInputs {
    pub fn avg_connections_per_node(&self) -> f64 {
        if self.healthy_nodes == 0 {
            return 0.0;
        }
        self.active_connections as f64 / f64::from(self.healthy_nodes)
    }
}

/// A scaling decision. `count` may be zero when the bounds leave no room;
/// that still counts as an attempted action for the cooldown.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScaleDecision {
    ScaleUp { count: u32, reasons: Vec<String> },
    ScaleDown { count: u32 },
    NoChange,
}

/// Decide what to do for `inputs` under `policy`.
pub fn decide(policy: &ScalingPolicy, inputs: &ScalingInputs) -> ScaleDecision {
    let up = &policy.scale_up;
    let mut reasons = Vec::new();
    if inputs.cpu_percent > up.cpu_percent {
        reasons.push(format!("cpu {:.1}% > {:.1}%", inputs.cpu_percent, up.cpu_percent));
    }
    if inputs.memory_percent > up.memory_percent {
        reasons.push(format!("memory {:.1}% > {:.1}%", inputs.memory_percent, up.memory_percent));
    }
    if inputs.avg_latency_ms > up.latency_ms {
        reasons.push(format!("latency {:.0}ms > {:.0}ms", inputs.avg_latency_ms, up.latency_ms));
    }
    if inputs.error_rate_percent > up.error_rate_percent {
        reasons.push(format!(
            "error rate {:.1}% > {:.1}%",
            inputs.error_rate_percent, up.error_rate_percent
        ));
    }

    if inputs.healthy_nodes < policy.max_nodes && !reasons.is_empty() {
        let room = policy.max_nodes.saturating_sub(inputs.total_nodes);
        return ScaleDecision::ScaleUp {
            count: policy.scale_up_step.min(room),
            reasons,
        };
    }

    let down = &policy.scale_down;
    let calm = inputs.cpu_percent < down.cpu_percent
        && inputs.memory_percent < down.memory_percent
        && inputs.avg_latency_ms < down.latency_ms
        && inputs.avg_connections_per_node() < down.connections_per_node;

    if inputs.healthy_nodes > policy.min_nodes && calm {
        let room = inputs.healthy_nodes - policy.min_nodes;
        return ScaleDecision::ScaleDown {
            count: policy.scale_down_step.min(room),
        };
    }

    ScaleDecision::NoChange
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDirection {
    Up,
    Down,
}

/// Record of one scaling action.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalingEvent {
    /// Epoch milliseconds.
    pub timestamp: u64,
    pub direction: ScaleDirection,
    /// Nodes the decision asked for, after bounds.
    pub requested: u32,
    /// Nodes actually added or removed.
    pub nodes: Vec<NodeId>,
    pub healthy_before: u32,
    pub reasons: Vec<String>,
    /// Connections still open on removed nodes when their drain timed out.
    pub abandoned_connections: u32,
}

/// Result of one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Evaluation {
    CoolingDown { remaining_ms: u64 },
    NoChange { inputs: ScalingInputs },
    Acted { event: ScalingEvent },
}

/// Periodically evaluates load and resizes the registry.
pub struct Autoscaler {
    registry: NodeRegistry,
    metrics: Arc<MetricsStore>,
    resources: Arc<dyn ResourceProbe>,
    provisioner: Arc<dyn NodeProvisioner>,
    policy: RwLock<ScalingPolicy>,
    interval: Duration,
    drain_timeout: Duration,
    last_action: Mutex<Option<Instant>>,
    events: Mutex<VecDeque<ScalingEvent>>,
}

impl Autoscaler {
    pub fn new(
        registry: NodeRegistry,
        metrics: Arc<MetricsStore>,
        resources: Arc<dyn ResourceProbe>,
        provisioner: Arc<dyn NodeProvisioner>,
        config: &ScalingConfig,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            metrics,
            resources,
            provisioner,
            policy: RwLock::new(config.policy.clone()),
            interval: config.interval,
            drain_timeout,
            last_action: Mutex::new(None),
            events: Mutex::new(VecDeque::with_capacity(EVENT_HISTORY)),
        }
    }

    pub async fn policy(&self) -> ScalingPolicy {
        self.policy.read().await.clone()
    }

    /// Replace the policy after validating it. Returns the previous policy.
    pub async fn update_policy(&self, policy: ScalingPolicy) -> ScaleResult<ScalingPolicy> {
        policy.validate()?;
        let mut current = self.policy.write().await;
        let previous = std::mem::replace(&mut *current, policy);
        info!(
            min_nodes = current.min_nodes,
            max_nodes = current.max_nodes,
            cooldown_secs = current.cooldown.as_secs(),
            "scaling policy updated"
        );
        Ok(previous)
    }

    /// Most recent scaling events, oldest first.
    pub async fn recent_events(&self) -> Vec<ScalingEvent> {
        self.events.lock().await.iter().cloned().collect()
    }

    /// Time left before another action is allowed, if any.
    pub async fn cooldown_remaining(&self) -> Option<Duration> {
        let cooldown = self.policy.read().await.cooldown;
        let last = (*self.last_action.lock().await)?;
        cooldown.checked_sub(last.elapsed()).filter(|d| !d.is_zero())
    }

    pub async fn inputs(&self) -> ScalingInputs {
        let aggregate = self.metrics.aggregate(self.interval).await;
        let usage = self.resources.usage();
        let healthy = self.registry.healthy().await;
        let total = self
            .registry
            .handles()
            .await
            .iter()
            .filter(|n| !n.is_draining())
            .count();

        ScalingInputs {
            cpu_percent: usage.cpu_percent,
            memory_percent: usage.memory_percent,
            avg_latency_ms: aggregate.avg_latency_ms,
            error_rate_percent: aggregate.error_rate_percent,
            active_connections: healthy.iter().map(|n| u64::from(n.current_connections())).sum(),
            healthy_nodes: healthy.len() as u32,
            total_nodes: total as u32,
        }
    }

    /// Evaluate once and act on the decision.
    pub async fn evaluate(&self) -> Evaluation {
        let policy = self.policy().await;

        let mut last_action = self.last_action.lock().await;
        if let Some(last) = *last_action
            && let Some(remaining) = policy.cooldown.checked_sub(last.elapsed())
            && !remaining.is_zero()
        {
            debug!(remaining_secs = remaining.as_secs(), "scaling cooldown active");
            return Evaluation::CoolingDown {
                remaining_ms: remaining.as_millis() as u64,
            };
        }

        let inputs = self.inputs().await;
        let decision = decide(&policy, &inputs);
        if decision == ScaleDecision::NoChange {
            debug!(
                cpu = inputs.cpu_percent,
                memory = inputs.memory_percent,
                latency_ms = inputs.avg_latency_ms,
                healthy = inputs.healthy_nodes,
                "no scaling needed"
            );
            return Evaluation::NoChange { inputs };
        }

        *last_action = Some(Instant::now());
        drop(last_action);

        let event = self.apply(decision, &inputs).await;
        Evaluation::Acted { event }
    }

    async fn apply(&self, decision: ScaleDecision, inputs: &ScalingInputs) -> ScalingEvent {
        let mut event = ScalingEvent {
            timestamp: epoch_millis(),
            direction: ScaleDirection::Up,
            requested: 0,
            nodes: Vec::new(),
            healthy_before: inputs.healthy_nodes,
            reasons: Vec::new(),
            abandoned_connections: 0,
        };

        match decision {
            ScaleDecision::ScaleUp { count, reasons } => {
                event.requested = count;
                event.reasons = reasons;
                event.nodes = self.scale_up(count).await;
                info!(
                    requested = count,
                    added = event.nodes.len(),
                    healthy = inputs.healthy_nodes,
                    reasons = ?event.reasons,
                    "scaled up"
                );
            }
            ScaleDecision::ScaleDown { count } => {
                event.direction = ScaleDirection::Down;
                event.requested = count;
                let (removed, abandoned) = self.scale_down(count).await;
                event.nodes = removed;
                event.abandoned_connections = abandoned;
                info!(
                    requested = count,
                    removed = event.nodes.len(),
                    abandoned,
                    healthy = inputs.healthy_nodes,
                    "scaled down"
                );
            }
            ScaleDecision::NoChange => {}
        }

        let mut events = self.events.lock().await;
        if events.len() >= EVENT_HISTORY {
            events.pop_front();
        }
        events.push_back(event.clone());
        event
    }

    async fn scale_up(&self, count: u32) -> Vec<NodeId> {
        let mut added = Vec::new();
        for _ in 0..count {
            let existing = self.registry.snapshot().await;
            let spec = match self.provisioner.provision(&existing).await {
                Ok(spec) => spec,
                Err(e) => {
                    warn!(error = %e, "could not provision node");
                    break;
                }
            };
            match self.registry.register(spec, false).await {
                Ok(node) => added.push(node.id),
                Err(e) => {
                    warn!(error = %e, "could not register provisioned node");
                    break;
                }
            }
        }
        added
    }

    /// Drain the `count` healthy nodes with the fewest connections.
    async fn scale_down(&self, count: u32) -> (Vec<NodeId>, u32) {
        let mut candidates = self.registry.healthy().await;
        // Stable sort keeps registration order among ties.
        candidates.sort_by_key(|n| n.current_connections());
        candidates.truncate(count as usize);

        let mut drains = JoinSet::new();
        for node in &candidates {
            node.set_draining();
            let registry = self.registry.clone();
            let id = node.id.clone();
            let snapshot = node.snapshot();
            let timeout = self.drain_timeout;
            drains.spawn(async move {
                let outcome = registry.drain_and_remove(&id, timeout).await;
                (snapshot, outcome)
            });
        }

        let mut removed = Vec::new();
        let mut abandoned = 0;
        while let Some(joined) = drains.join_next().await {
            match joined {
                Ok((snapshot, Ok(outcome))) => {
                    if let DrainOutcome::TimedOut { abandoned: n } = outcome {
                        abandoned += n;
                    }
                    self.provisioner.decommission(&snapshot).await;
                    removed.push(snapshot.id);
                }
                Ok((snapshot, Err(e))) => {
                    warn!(node_id = %snapshot.id, error = %e, "scale-down removal failed");
                }
                Err(e) => error!(error = %e, "drain task failed"),
            }
        }
        removed.sort();
        (removed, abandoned)
    }

    /// Run the autoscaler loop. Shutdown also interrupts an evaluation that
    /// is waiting on a drain; the drained node then stays registered.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "autoscaler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    tokio::select! {
                        _ = self.evaluate() => {}
                        _ = shutdown.changed() => {
                            warn!("autoscaler interrupted mid-evaluation");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
        }
    }
}
