//! OpenMesh Cluster
//!
//! Tracks the pool of compute nodes and their liveness.
//! Also defines the narrow interfaces to the external collaborators:
//! the reputation/score provider and the execution layer.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod execution;
pub mod heartbeat;
pub mod registry;
pub mod reputation;

pub use execution::{DispatchAck, DispatchRequest, ExecutionLayer, OutcomeSender, RecordingExecutor};
pub use heartbeat::{HeartbeatConfig, HeartbeatMonitor};
pub use registry::{NodeLoss, NodeRegistry, RegistryConfig};
pub use reputation::{
    InMemoryReputation, NodeScore, ReputationChange, ReputationConfig, ReputationProvider,
};
