//! Outcome events reported for job attempts.

use crate::id::{JobId, NodeId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How an attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// Task finished
    Success,
    /// Task reported an error
    Failure,
    /// Task ran past its deadline
    Timeout,
    /// The node stopped heartbeating while running the task
    NodeLost,
}

impl OutcomeKind {
    /// Whether the attempt produced usable work
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
            Self::NodeLost => "node_lost",
        };
        f.write_str(s)
    }
}

/// Report about one attempt of one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeEvent {
    /// Job the attempt belongs to
    pub job_id: JobId,
    /// Node that ran the attempt
    pub node_id: NodeId,
    /// Attempt number
    pub attempt: u32,
    /// Result
    pub outcome: OutcomeKind,
    /// Billable cost of the attempt
    #[serde(default)]
    pub cost: f64,
    /// Error detail for failures
    #[serde(default)]
    pub reason: Option<String>,
}

impl OutcomeEvent {
    /// Successful attempt billed at `cost`
    #[must_use]
    pub fn success(job_id: JobId, node_id: NodeId, attempt: u32, cost: f64) -> Self {
        Self {
            job_id,
            node_id,
            attempt,
            outcome: OutcomeKind::Success,
            cost,
            reason: None,
        }
    }

    /// Failed attempt
    #[must_use]
    pub fn failure(job_id: JobId, node_id: NodeId, attempt: u32, reason: impl Into<String>) -> Self {
        Self {
            job_id,
            node_id,
            attempt,
            outcome: OutcomeKind::Failure,
            cost: 0.0,
            reason: Some(reason.into()),
        }
    }

    /// Attempt that exceeded its deadline
    #[must_use]
    pub fn timeout(job_id: JobId, node_id: NodeId, attempt: u32) -> Self {
        Self {
            job_id,
            node_id,
            attempt,
            outcome: OutcomeKind::Timeout,
            cost: 0.0,
            reason: Some("attempt timed out".to_string()),
        }
    }

    /// Attempt lost with its node
    #[must_use]
    pub fn node_lost(job_id: JobId, node_id: NodeId, attempt: u32) -> Self {
        Self {
            job_id,
            node_id,
            attempt,
            outcome: OutcomeKind::NodeLost,
            cost: 0.0,
            reason: Some("node stopped heartbeating".to_string()),
        }
    }

    /// Set billed cost
    #[must_use]
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }
}
