//! Boundary to the layer that actually runs jobs on nodes.
//!
//! The scheduler hands an allocated attempt to an [`ExecutionLayer`] and
//! learns how it ended through an [`OutcomeSender`]. Dispatch only
//! acknowledges receipt; completion is always asynchronous.

use async_trait::async_trait;
use openmesh_core::{JobId, JobSpec, MeshResult, NodeId, OutcomeEvent};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};

/// Channel the execution layer reports outcomes on
pub type OutcomeSender = mpsc::Sender<OutcomeEvent>;

/// One attempt handed to a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    /// Job being run
    pub job_id: JobId,
    /// Target node
    pub node_id: NodeId,
    /// Attempt number, echoed back in the outcome
    pub attempt: u32,
    /// What to run
    pub spec: JobSpec,
    /// Node address as `host:port`
    pub address: String,
}

/// Immediate answer to a dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchAck {
    /// The node took the attempt
    Accepted,
    /// The node refused the attempt
    Rejected {
        /// Refusal detail
        reason: String,
    },
}

impl DispatchAck {
    /// Whether the node took the attempt
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Something that can start job attempts on nodes
#[async_trait]
pub trait ExecutionLayer: Send + Sync {
    /// Hand an attempt to its node
    ///
    /// # Errors
    ///
    /// Returns error if the node could not be reached at all; the scheduler
    /// treats this like a rejection
    async fn dispatch(&self, request: DispatchRequest) -> MeshResult<DispatchAck>;
}

/// Execution layer that records dispatches and reports nothing
///
/// Outcomes are driven by the caller, which makes it the usual stand-in
/// for tests. Nodes can be set to reject every dispatch.
#[derive(Debug, Clone, Default)]
pub struct RecordingExecutor {
    dispatched: Arc<Mutex<Vec<DispatchRequest>>>,
    rejecting: Arc<Mutex<BTreeSet<NodeId>>>,
}

impl RecordingExecutor {
    /// Create an executor that accepts everything
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a node reject dispatches until cleared
    pub async fn reject_on(&self, node_id: NodeId) {
        self.rejecting.lock().await.insert(node_id);
    }

    /// Stop rejecting on a node
    pub async fn accept_on(&self, node_id: &NodeId) {
        self.rejecting.lock().await.remove(node_id);
    }

    /// Every dispatch seen so far, in order
    pub async fn dispatched(&self) -> Vec<DispatchRequest> {
        self.dispatched.lock().await.clone()
    }

    /// Most recent dispatch for a job
    pub async fn last_for(&self, job_id: &JobId) -> Option<DispatchRequest> {
        self.dispatched
            .lock()
            .await
            .iter()
            .rev()
            .find(|r| &r.job_id == job_id)
            .cloned()
    }
}

#[async_trait]
impl ExecutionLayer for RecordingExecutor {
    async fn dispatch(&self, request: DispatchRequest) -> MeshResult<DispatchAck> {
        let rejected = self.rejecting.lock().await.contains(&request.node_id);
        self.dispatched.lock().await.push(request);
        if rejected {
            return Ok(DispatchAck::Rejected {
                reason: "node refused dispatch".to_string(),
            });
        }
        Ok(DispatchAck::Accepted)
    }
}
