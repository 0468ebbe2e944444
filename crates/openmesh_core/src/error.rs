//! Core error types for OpenMesh.

use crate::id::{JobId, NodeId};
use crate::job::JobStatus;
use crate::node::NodeStatus;

/// Core result type
pub type MeshResult<T> = Result<T, MeshError>;

/// Core error type
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MeshError {
    /// A live node with this ID is already registered
    #[error("Node already registered: {node_id}")]
    DuplicateNode {
        /// Offending node
        node_id: NodeId,
    },

    /// No node with this ID is known
    #[error("Unknown node: {node_id}")]
    UnknownNode {
        /// Requested node
        node_id: NodeId,
    },

    /// No job with this ID is known
    #[error("Unknown job: {job_id}")]
    UnknownJob {
        /// Requested job
        job_id: JobId,
    },

    /// Node does not have enough free capacity
    #[error("Insufficient capacity on {node_id}: requested {requested}, free {free}")]
    InsufficientCapacity {
        /// Node that was asked
        node_id: NodeId,
        /// Units requested
        requested: u32,
        /// Units free at the time of the check
        free: u32,
    },

    /// Node is not in a state that accepts work
    #[error("Node {node_id} unavailable ({status})")]
    NodeUnavailable {
        /// Node that was asked
        node_id: NodeId,
        /// Its status at the time
        status: NodeStatus,
    },

    /// No registered node can ever hold the requested capacity
    #[error("No node can hold {required} capacity units")]
    NoCapacity {
        /// Units the job needs
        required: u32,
    },

    /// Spending would breach the job's budget ceiling
    #[error("Budget exceeded for {job_id}: projected {projected:.4}, remaining {remaining:.4}")]
    BudgetExceeded {
        /// Job whose budget was checked
        job_id: JobId,
        /// Cost that was asked for
        projected: f64,
        /// Budget still available
        remaining: f64,
    },

    /// Job used up its attempts
    #[error("Retry limit exceeded for {job_id} after {attempts} attempts")]
    RetryLimitExceeded {
        /// Job that gave up
        job_id: JobId,
        /// Failed attempts
        attempts: u32,
    },

    /// Outcome report for an attempt that is no longer current
    #[error("Stale event for {job_id}: attempt {attempt}, current {current}")]
    StaleEvent {
        /// Job the report refers to
        job_id: JobId,
        /// Attempt named in the report
        attempt: u32,
        /// Attempt the job is on
        current: u32,
    },

    /// Transition not allowed by the job lifecycle
    #[error("Invalid transition for {job_id}: {from} -> {to}")]
    InvalidTransition {
        /// Job being moved
        job_id: JobId,
        /// Current status
        from: JobStatus,
        /// Requested status
        to: JobStatus,
    },

    /// Job is not waiting on a retry or deferral
    #[error("Job {job_id} cannot be retried from {status}")]
    NotRetryable {
        /// Job asked to retry
        job_id: JobId,
        /// Its status
        status: JobStatus,
    },

    /// Validation error
    #[error("Validation failed for {field}: {reason}")]
    Validation {
        /// Field name
        field: String,
        /// What was wrong
        reason: String,
    },

    /// Configuration error
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// External collaborator call failed
    #[error("{collaborator} call failed: {message}")]
    Collaborator {
        /// Which collaborator
        collaborator: String,
        /// Error message
        message: String,
    },
}

impl MeshError {
    /// Whether the condition is expected to clear on its own
    ///
    /// Transient errors keep the job alive; the scheduler retries on a later tick.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::InsufficientCapacity { .. }
                | Self::NodeUnavailable { .. }
                | Self::NoCapacity { .. }
                | Self::Collaborator { .. }
        )
    }

    /// Whether the error ends the job
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::BudgetExceeded { .. } | Self::RetryLimitExceeded { .. })
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation {
            field: "json".to_string(),
            reason: err.to_string(),
        }
    }
}
