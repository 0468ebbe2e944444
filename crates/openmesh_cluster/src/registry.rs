//! Node registry.
//!
//! Sole writer of node status and load. Each node sits behind its own
//! mutex so capacity check-and-reserve is one atomic step per node, and
//! the map lock is only taken exclusively to add entries.

use openmesh_core::{
    Clock, MeshError, MeshResult, Node, NodeDescriptor, NodeId, NodeStatus, Telemetry, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

/// Registry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Consecutive dispatch rejections before a node is retired
    pub max_allocation_failures: u32,
}

impl RegistryConfig {
    /// Set the retirement threshold
    #[must_use]
    pub fn with_max_allocation_failures(mut self, max: u32) -> Self {
        self.max_allocation_failures = max;
        self
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_allocation_failures: 3,
        }
    }
}

/// A node leaving service
///
/// Attempts reserved on `incarnation` or earlier are stranded; anything
/// placed after the node came back belongs to a later incarnation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLoss {
    /// Node that left service
    pub node_id: NodeId,
    /// Incarnation in service when it left
    pub incarnation: u64,
}

impl NodeLoss {
    /// Whether an attempt reserved on `incarnation` is stranded by this loss
    #[must_use]
    pub fn strands(&self, incarnation: u64) -> bool {
        incarnation <= self.incarnation
    }
}

/// Registry of compute nodes
#[derive(Debug)]
pub struct NodeRegistry {
    /// Known nodes, ordered by ID
    nodes: RwLock<BTreeMap<NodeId, Arc<Mutex<Node>>>>,
    /// Configuration
    config: RegistryConfig,
    /// Time source
    clock: Arc<dyn Clock>,
    /// Silence after which an active node is no longer offered for work
    liveness_timeout: Option<Duration>,
    /// Reputation recorded for a new node until the provider is consulted
    initial_reputation: f64,
}

impl NodeRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(config: RegistryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            nodes: RwLock::new(BTreeMap::new()),
            config,
            clock,
            liveness_timeout: None,
            initial_reputation: 0.5,
        }
    }

    /// Reputation given to nodes registering for the first time
    #[must_use]
    pub fn with_initial_reputation(mut self, reputation: f64) -> Self {
        self.initial_reputation = reputation.clamp(0.0, 1.0);
        self
    }

    /// Stop offering active nodes silent for longer than `timeout`, even
    /// before the heartbeat monitor demotes them
    #[must_use]
    pub fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout = Some(timeout);
        self
    }

    /// Whether a node can take work at `now`
    fn accepts_work(&self, node: &Node, now: Timestamp) -> bool {
        if !node.status.accepts_work() {
            return false;
        }
        match (self.liveness_timeout, node.last_heartbeat) {
            (Some(timeout), Some(last)) => now.saturating_since(last) <= timeout,
            _ => true,
        }
    }

    /// Look up the per-node lock without holding the map lock afterwards
    async fn entry(&self, node_id: &NodeId) -> Option<Arc<Mutex<Node>>> {
        self.nodes.read().await.get(node_id).cloned()
    }

    /// Register a node in `pending`
    ///
    /// A node that is not live (pending, unreachable or retired) may
    /// register again as a new incarnation. Its declaration is replaced.
    /// Reputation and load carry over; reservations of the previous
    /// incarnation are freed as its attempts are handed off.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateNode` if the node is registered and live, or a
    /// validation error for a bad descriptor
    pub async fn register(&self, descriptor: NodeDescriptor) -> MeshResult<NodeId> {
        descriptor.validate()?;
        let now = self.clock.now();
        let node_id = descriptor.node_id.clone();

        let mut nodes = self.nodes.write().await;
        if let Some(existing) = nodes.get(&node_id) {
            let mut node = existing.lock().await;
            if node.status.is_live() {
                return Err(MeshError::DuplicateNode { node_id });
            }
            let previous = node.clone();
            *node = Node::from_descriptor(descriptor, previous.reputation, now);
            node.current_load = previous.current_load;
            node.incarnation = previous.incarnation + 1;
            tracing::info!(
                node_id = %node_id,
                incarnation = node.incarnation,
                load = node.current_load,
                "Node re-registered"
            );
            return Ok(node_id);
        }

        let node = Node::from_descriptor(descriptor, self.initial_reputation, now);
        nodes.insert(node_id.clone(), Arc::new(Mutex::new(node)));
        tracing::info!(node_id = %node_id, "Node registered");
        Ok(node_id)
    }

    /// Record a heartbeat and return the node's new status
    ///
    /// A pending node becomes active. An unreachable node comes back as a
    /// new incarnation; its load is left alone until the handoff of its old
    /// attempts frees it. A node reporting itself unhealthy is held in
    /// `degraded`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownNode` if the node was never registered, or
    /// `NodeUnavailable` if it was retired
    pub async fn heartbeat(&self, node_id: &NodeId, telemetry: &Telemetry) -> MeshResult<NodeStatus> {
        let entry = self
            .entry(node_id)
            .await
            .ok_or_else(|| MeshError::UnknownNode {
                node_id: node_id.clone(),
            })?;
        let now = self.clock.now();
        let mut node = entry.lock().await;

        if node.status == NodeStatus::Retired {
            return Err(MeshError::NodeUnavailable {
                node_id: node_id.clone(),
                status: node.status,
            });
        }

        let previous = node.status;
        node.last_heartbeat = Some(now);
        if previous == NodeStatus::Unreachable {
            node.incarnation += 1;
        }
        node.status = if telemetry.healthy {
            NodeStatus::Active
        } else {
            NodeStatus::Degraded
        };

        if previous != node.status {
            tracing::info!(
                node_id = %node_id,
                from = %previous,
                to = %node.status,
                "Node status changed on heartbeat"
            );
        }
        Ok(node.status)
    }

    /// Retire a node and return the loss to hand off
    ///
    /// # Errors
    ///
    /// Returns `UnknownNode` if the node was never registered
    pub async fn deregister(&self, node_id: &NodeId) -> MeshResult<NodeLoss> {
        let entry = self
            .entry(node_id)
            .await
            .ok_or_else(|| MeshError::UnknownNode {
                node_id: node_id.clone(),
            })?;
        let mut node = entry.lock().await;
        node.status = NodeStatus::Retired;
        tracing::info!(node_id = %node_id, "Node retired");
        Ok(NodeLoss {
            node_id: node_id.clone(),
            incarnation: node.incarnation,
        })
    }

    /// Get a node snapshot
    pub async fn get(&self, node_id: &NodeId) -> Option<Node> {
        let entry = self.entry(node_id).await?;
        let node = entry.lock().await;
        Some(node.clone())
    }

    /// Snapshot of every known node, ordered by ID
    pub async fn list(&self) -> Vec<Node> {
        let nodes = self.nodes.read().await;
        let mut out = Vec::with_capacity(nodes.len());
        for entry in nodes.values() {
            out.push(entry.lock().await.clone());
        }
        out
    }

    /// Active nodes with at least `min_capacity` free units, ordered by ID
    ///
    /// The result is an owned snapshot taken at call time.
    pub async fn list_available(&self, min_capacity: u32) -> Vec<Node> {
        let now = self.clock.now();
        let nodes = self.nodes.read().await;
        let mut out = Vec::new();
        for entry in nodes.values() {
            let node = entry.lock().await;
            if self.accepts_work(&node, now) && node.free_capacity() >= min_capacity {
                out.push(node.clone());
            }
        }
        out
    }

    /// Atomically check free capacity and reserve `units` on a node
    ///
    /// Returns the incarnation the reservation was made on.
    ///
    /// # Errors
    ///
    /// Returns `UnknownNode`, `NodeUnavailable` if the node is not active,
    /// or `InsufficientCapacity` if fewer than `units` are free
    pub async fn reserve(&self, node_id: &NodeId, units: u32) -> MeshResult<u64> {
        let entry = self
            .entry(node_id)
            .await
            .ok_or_else(|| MeshError::UnknownNode {
                node_id: node_id.clone(),
            })?;
        let now = self.clock.now();
        let mut node = entry.lock().await;

        if !self.accepts_work(&node, now) {
            return Err(MeshError::NodeUnavailable {
                node_id: node_id.clone(),
                status: node.status,
            });
        }
        let free = node.free_capacity();
        if free < units {
            return Err(MeshError::InsufficientCapacity {
                node_id: node_id.clone(),
                requested: units,
                free,
            });
        }
        node.current_load += units;
        Ok(node.incarnation)
    }

    /// Return `units` of capacity; clamps at zero and ignores unknown nodes
    pub async fn release(&self, node_id: &NodeId, units: u32) {
        let Some(entry) = self.entry(node_id).await else {
            tracing::debug!(node_id = %node_id, "Release for unknown node ignored");
            return;
        };
        let mut node = entry.lock().await;
        node.current_load = node.current_load.saturating_sub(units);
    }

    /// Count a dispatch rejection
    ///
    /// Returns the loss to hand off if this rejection retired the node.
    ///
    /// # Errors
    ///
    /// Returns `UnknownNode` if the node was never registered
    pub async fn record_dispatch_rejected(&self, node_id: &NodeId) -> MeshResult<Option<NodeLoss>> {
        let entry = self
            .entry(node_id)
            .await
            .ok_or_else(|| MeshError::UnknownNode {
                node_id: node_id.clone(),
            })?;
        let mut node = entry.lock().await;
        node.allocation_failures = node.allocation_failures.saturating_add(1);

        if node.status != NodeStatus::Retired
            && node.allocation_failures >= self.config.max_allocation_failures
        {
            node.status = NodeStatus::Retired;
            tracing::warn!(
                node_id = %node_id,
                failures = node.allocation_failures,
                "Node retired after repeated allocation failures"
            );
            return Ok(Some(NodeLoss {
                node_id: node_id.clone(),
                incarnation: node.incarnation,
            }));
        }
        Ok(None)
    }

    /// Reset the rejection streak after a successful dispatch
    pub async fn record_dispatch_accepted(&self, node_id: &NodeId) {
        if let Some(entry) = self.entry(node_id).await {
            entry.lock().await.allocation_failures = 0;
        }
    }

    /// Store the latest trust score seen for a node
    pub async fn set_reputation(&self, node_id: &NodeId, reputation: f64) {
        if let Some(entry) = self.entry(node_id).await {
            entry.lock().await.reputation = reputation.clamp(0.0, 1.0);
        }
    }

    /// Demote live nodes silent for longer than `timeout` to `unreachable`
    ///
    /// Returns the losses caused by this call; a node is reported once per
    /// transition.
    pub async fn demote_silent(&self, timeout: Duration) -> Vec<NodeLoss> {
        let now = self.clock.now();
        let nodes = self.nodes.read().await;
        let mut demoted = Vec::new();

        for (node_id, entry) in nodes.iter() {
            let mut node = entry.lock().await;
            if !node.status.is_live() {
                continue;
            }
            let last = node.last_heartbeat.unwrap_or(node.registered_at);
            if now.saturating_since(last) > timeout {
                node.status = NodeStatus::Unreachable;
                demoted.push(NodeLoss {
                    node_id: node_id.clone(),
                    incarnation: node.incarnation,
                });
                tracing::warn!(
                    node_id = %node_id,
                    silent_ms = now.saturating_since(last).as_millis() as u64,
                    "Node missed heartbeat timeout"
                );
            }
        }

        demoted
    }

    /// Largest declared capacity among nodes that are not retired
    pub async fn max_declared_capacity(&self) -> Option<u32> {
        let nodes = self.nodes.read().await;
        let mut max = None;
        for entry in nodes.values() {
            let node = entry.lock().await;
            if node.status != NodeStatus::Retired {
                max = max.max(Some(node.gpu_memory));
            }
        }
        max
    }

    /// Node counts per status; every status is present
    pub async fn status_counts(&self) -> BTreeMap<NodeStatus, usize> {
        let mut counts: BTreeMap<NodeStatus, usize> =
            NodeStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for node in self.list().await {
            *counts.entry(node.status).or_default() += 1;
        }
        counts
    }

    /// Number of known nodes
    pub async fn node_count(&self) -> usize {
        self.nodes.read().await.len()
    }

    /// Current time on the registry's clock
    #[must_use]
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }
}
