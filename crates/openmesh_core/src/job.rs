//! Job model and lifecycle rules.

use crate::error::{MeshError, MeshResult};
use crate::id::{JobId, NodeId};
use crate::time::Timestamp;
use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a node
    Pending,
    /// Bound to a node, dispatch not yet acknowledged
    Allocated,
    /// Executing on its node
    Running,
    /// Last attempt failed, waiting out the backoff
    Retrying,
    /// Finished successfully
    Completed,
    /// Ran out of attempts
    Failed,
    /// Stopped because the budget ceiling would be breached
    AbortedBudget,
    /// Cancelled by the caller
    Aborted,
}

impl JobStatus {
    /// All statuses, in lifecycle order
    pub const ALL: [JobStatus; 8] = [
        JobStatus::Pending,
        JobStatus::Allocated,
        JobStatus::Running,
        JobStatus::Retrying,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::AbortedBudget,
        JobStatus::Aborted,
    ];

    /// Terminal states accept no further mutation
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::AbortedBudget | Self::Aborted
        )
    }

    /// Whether the job is waiting for the allocation engine
    #[must_use]
    pub fn awaits_allocation(&self) -> bool {
        matches!(self, Self::Pending | Self::Retrying)
    }

    /// Whether an attempt holds node capacity
    #[must_use]
    pub fn holds_capacity(&self) -> bool {
        matches!(self, Self::Allocated | Self::Running)
    }

    /// Allowed lifecycle edges
    #[must_use]
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (*self, to),
            (Pending, Allocated)
                | (Allocated, Running)
                | (Allocated, Pending)
                | (Running, Completed)
                | (Running, Retrying)
                | (Running, Failed)
                | (Retrying, Allocated)
                | (Pending | Allocated | Running, AbortedBudget)
                | (Pending | Allocated | Running | Retrying, Aborted)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Allocated => "allocated",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::AbortedBudget => "aborted_budget",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// How the caller trades speed against cost
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeedPreference {
    /// Lowest estimated cost rate first
    Cheap,
    /// Even blend
    #[default]
    Balanced,
    /// Highest compute score first
    Fast,
}

impl fmt::Display for SpeedPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Cheap => "cheap",
            Self::Balanced => "balanced",
            Self::Fast => "fast",
        };
        f.write_str(s)
    }
}

impl FromStr for SpeedPreference {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cheap" => Ok(Self::Cheap),
            "balanced" => Ok(Self::Balanced),
            "fast" => Ok(Self::Fast),
            other => Err(MeshError::Validation {
                field: "speed_preference".to_string(),
                reason: format!("unknown preference '{}'", other),
            }),
        }
    }
}

/// Opaque description of the work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Kind of work, e.g. `finetune`
    pub job_type: String,
    /// Model name
    pub model: String,
    /// Dataset reference
    #[serde(default)]
    pub dataset: Option<String>,
    /// Capacity units the job needs, scheduler default when absent
    #[serde(default)]
    pub required_capacity: Option<u32>,
    /// Expected run time in seconds, scheduler default when absent
    #[serde(default)]
    pub estimated_duration_secs: Option<u64>,
    /// Free-form parameters passed through to the execution layer
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

impl JobSpec {
    /// Create a spec for a model
    #[must_use]
    pub fn new(job_type: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            model: model.into(),
            dataset: None,
            required_capacity: None,
            estimated_duration_secs: None,
            parameters: BTreeMap::new(),
        }
    }

    /// Set dataset reference
    #[must_use]
    pub fn with_dataset(mut self, dataset: impl Into<String>) -> Self {
        self.dataset = Some(dataset.into());
        self
    }

    /// Set required capacity
    #[must_use]
    pub fn with_required_capacity(mut self, units: u32) -> Self {
        self.required_capacity = Some(units);
        self
    }

    /// Set expected duration
    #[must_use]
    pub fn with_estimated_duration_secs(mut self, secs: u64) -> Self {
        self.estimated_duration_secs = Some(secs);
        self
    }

    /// Attach a parameter
    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }
}

/// A unit of requested work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Identity
    pub job_id: JobId,
    /// What to run
    pub spec: JobSpec,
    /// Spending ceiling
    pub max_budget: f64,
    /// Scoring preference
    pub speed_preference: SpeedPreference,
    /// Lifecycle state
    pub status: JobStatus,
    /// Node of the current attempt
    pub assigned_node_id: Option<NodeId>,
    /// Failed attempts so far
    pub attempt_count: u32,
    /// Number of the current (or last) attempt, 0 before the first allocation
    pub current_attempt: u32,
    /// Money spent on completed work
    pub spent_so_far: f64,
    /// Bumped on every transition
    pub version: Version,
    /// Submission time
    pub created_at: Timestamp,
    /// Time of the last transition
    pub updated_at: Timestamp,
    /// Why the job failed or was aborted
    pub error_message: Option<String>,
}

impl Job {
    /// Create a pending job
    ///
    /// # Errors
    ///
    /// Returns error if the budget is not a positive number
    pub fn new(
        spec: JobSpec,
        max_budget: f64,
        speed_preference: SpeedPreference,
        now: Timestamp,
    ) -> MeshResult<Self> {
        if !max_budget.is_finite() || max_budget <= 0.0 {
            return Err(MeshError::Validation {
                field: "max_budget".to_string(),
                reason: format!("must be a positive number, got {}", max_budget),
            });
        }
        if spec.required_capacity == Some(0) {
            return Err(MeshError::Validation {
                field: "required_capacity".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(Self {
            job_id: JobId::new(),
            spec,
            max_budget,
            speed_preference,
            status: JobStatus::Pending,
            assigned_node_id: None,
            attempt_count: 0,
            current_attempt: 0,
            spent_so_far: 0.0,
            version: Version::INITIAL,
            created_at: now,
            updated_at: now,
            error_message: None,
        })
    }

    /// Budget not yet spent
    #[must_use]
    pub fn remaining_budget(&self) -> f64 {
        (self.max_budget - self.spent_so_far).max(0.0)
    }
}

/// One accepted lifecycle step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    /// State left
    pub from: JobStatus,
    /// State entered
    pub to: JobStatus,
    /// Version after the step
    pub version: Version,
    /// When it happened
    pub at: Timestamp,
    /// Why
    pub reason: String,
}
