//! Compute node model.

use crate::error::{MeshError, MeshResult};
use crate::id::NodeId;
use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Liveness state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Registered, no heartbeat yet
    Pending,
    /// Heartbeating and accepting work
    Active,
    /// Heartbeating but reporting itself unhealthy
    Degraded,
    /// Missed the heartbeat timeout
    Unreachable,
    /// Removed from the pool
    Retired,
}

impl NodeStatus {
    /// All statuses, in lifecycle order
    pub const ALL: [NodeStatus; 5] = [
        NodeStatus::Pending,
        NodeStatus::Active,
        NodeStatus::Degraded,
        NodeStatus::Unreachable,
        NodeStatus::Retired,
    ];

    /// Whether the node has heartbeated within the timeout
    #[must_use]
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Active | Self::Degraded)
    }

    /// Whether new work may be placed on the node
    #[must_use]
    pub fn accepts_work(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Degraded => "degraded",
            Self::Unreachable => "unreachable",
            Self::Retired => "retired",
        };
        f.write_str(s)
    }
}

/// What a node declares when it registers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Caller-assigned identity
    pub node_id: NodeId,
    /// Host name or address
    pub host: String,
    /// Port the node listens on
    pub port: u16,
    /// Declared capacity in GPU memory units
    pub gpu_memory: u32,
    /// Declared throughput rating
    pub compute_score: f64,
    /// Free-form operator metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl NodeDescriptor {
    /// Create a descriptor
    #[must_use]
    pub fn new(node_id: NodeId, host: impl Into<String>, port: u16) -> Self {
        Self {
            node_id,
            host: host.into(),
            port,
            gpu_memory: 1,
            compute_score: 1.0,
            metadata: BTreeMap::new(),
        }
    }

    /// Set declared capacity
    #[must_use]
    pub fn with_gpu_memory(mut self, units: u32) -> Self {
        self.gpu_memory = units;
        self
    }

    /// Set declared throughput rating
    #[must_use]
    pub fn with_compute_score(mut self, score: f64) -> Self {
        self.compute_score = score;
        self
    }

    /// Attach a metadata entry
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Check declared values
    ///
    /// # Errors
    ///
    /// Returns error if capacity is zero or the compute score is not a positive number
    pub fn validate(&self) -> MeshResult<()> {
        if self.gpu_memory == 0 {
            return Err(MeshError::Validation {
                field: "gpu_memory".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if !self.compute_score.is_finite() || self.compute_score <= 0.0 {
            return Err(MeshError::Validation {
                field: "compute_score".to_string(),
                reason: format!("must be a positive number, got {}", self.compute_score),
            });
        }
        if self.host.trim().is_empty() {
            return Err(MeshError::Validation {
                field: "host".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Health report carried by a heartbeat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    /// Node considers itself fit for new work
    pub healthy: bool,
    /// Reported GPU utilization in [0,1], informational
    #[serde(default)]
    pub gpu_utilization: Option<f64>,
}

impl Telemetry {
    /// A plain healthy heartbeat
    #[must_use]
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            gpu_utilization: None,
        }
    }

    /// A heartbeat from a node that wants no new work
    #[must_use]
    pub fn unhealthy() -> Self {
        Self {
            healthy: false,
            gpu_utilization: None,
        }
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::healthy()
    }
}

/// A registered compute provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Identity
    pub node_id: NodeId,
    /// Host name or address
    pub host: String,
    /// Port
    pub port: u16,
    /// Declared capacity units
    pub gpu_memory: u32,
    /// Declared throughput rating
    pub compute_score: f64,
    /// Last trust score seen from the reputation provider
    pub reputation: f64,
    /// Liveness state
    pub status: NodeStatus,
    /// Last heartbeat, `None` until the first one arrives
    pub last_heartbeat: Option<Timestamp>,
    /// Capacity units currently reserved
    pub current_load: u32,
    /// Consecutive dispatch rejections
    pub allocation_failures: u32,
    /// Bumped each time the node re-enters service after leaving it
    #[serde(default)]
    pub incarnation: u64,
    /// Registration time
    pub registered_at: Timestamp,
    /// Operator metadata
    pub metadata: BTreeMap<String, String>,
}

impl Node {
    /// Create a pending node from its descriptor
    #[must_use]
    pub fn from_descriptor(descriptor: NodeDescriptor, reputation: f64, now: Timestamp) -> Self {
        Self {
            node_id: descriptor.node_id,
            host: descriptor.host,
            port: descriptor.port,
            gpu_memory: descriptor.gpu_memory,
            compute_score: descriptor.compute_score,
            reputation: reputation.clamp(0.0, 1.0),
            status: NodeStatus::Pending,
            last_heartbeat: None,
            current_load: 0,
            allocation_failures: 0,
            incarnation: 0,
            registered_at: now,
            metadata: descriptor.metadata,
        }
    }

    /// Capacity units not yet reserved
    #[must_use]
    pub fn free_capacity(&self) -> u32 {
        self.gpu_memory.saturating_sub(self.current_load)
    }

    /// Network address as `host:port`
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
