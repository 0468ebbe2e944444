//! Allocation engine.
//!
//! Picks a node for a waiting job. Candidates come from a registry
//! snapshot and are ranked by a weighted score; the winner's capacity is
//! reserved through the registry's atomic check-and-reserve, so two
//! concurrent decisions never book the same unit. The engine never
//! touches job state: the caller commits the returned [`Allocation`].

use crate::budget::BudgetGuard;
use openmesh_cluster::{NodeRegistry, ReputationProvider};
use openmesh_core::{Job, MeshError, MeshResult, Node, NodeId, SpeedPreference};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Weights of one speed preference
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    /// Weight of normalized compute score
    pub compute: f64,
    /// Weight of reputation
    pub reputation: f64,
    /// Weight of normalized cost rate (subtracted)
    pub cost: f64,
}

impl ScoringWeights {
    /// Create weights
    #[must_use]
    pub const fn new(compute: f64, reputation: f64, cost: f64) -> Self {
        Self {
            compute,
            reputation,
            cost,
        }
    }

    fn validate(&self, name: &str) -> MeshResult<()> {
        for (field, value) in [
            ("compute", self.compute),
            ("reputation", self.reputation),
            ("cost", self.cost),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(MeshError::Config(format!(
                    "scoring.{}.{} must be a non-negative number, got {}",
                    name, field, value
                )));
            }
        }
        Ok(())
    }
}

/// Weights per speed preference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Compute first
    pub fast: ScoringWeights,
    /// Even blend
    pub balanced: ScoringWeights,
    /// Price first
    pub cheap: ScoringWeights,
}

impl ScoringConfig {
    /// Weights for a preference
    #[must_use]
    pub fn weights(&self, preference: SpeedPreference) -> ScoringWeights {
        match preference {
            SpeedPreference::Fast => self.fast,
            SpeedPreference::Balanced => self.balanced,
            SpeedPreference::Cheap => self.cheap,
        }
    }

    /// Check every weight is usable
    ///
    /// # Errors
    ///
    /// Returns `Config` for negative or non-finite weights
    pub fn validate(&self) -> MeshResult<()> {
        self.fast.validate("fast")?;
        self.balanced.validate("balanced")?;
        self.cheap.validate("cheap")
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            fast: ScoringWeights::new(0.7, 0.2, 0.1),
            balanced: ScoringWeights::new(0.34, 0.33, 0.33),
            cheap: ScoringWeights::new(0.1, 0.2, 0.7),
        }
    }
}

/// Defaults for jobs that leave sizing open
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationConfig {
    /// Duration assumed when projecting cost
    pub default_estimated_duration_secs: u64,
    /// Capacity units assumed per job
    pub default_required_capacity: u32,
}

impl AllocationConfig {
    /// Check the defaults are usable
    ///
    /// # Errors
    ///
    /// Returns `Config` if the default capacity is zero
    pub fn validate(&self) -> MeshResult<()> {
        if self.default_required_capacity == 0 {
            return Err(MeshError::Config(
                "allocation.default_required_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            default_estimated_duration_secs: 600,
            default_required_capacity: 1,
        }
    }
}

/// A node bound to one attempt of a job, capacity already reserved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    /// Job
    pub job_id: openmesh_core::JobId,
    /// Chosen node
    pub node_id: NodeId,
    /// Attempt number this allocation starts
    pub attempt: u32,
    /// Reserved units
    pub units: u32,
    /// Node incarnation the units were reserved on
    pub incarnation: u64,
    /// Trust score the provider reported for the node
    pub reputation: f64,
    /// Cost projected at decision time
    pub projected_cost: f64,
    /// Winning score
    pub score: f64,
    /// Node address
    pub address: String,
}

/// Why nothing was allocated this time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferReason {
    /// No active node has enough free capacity
    NoCandidates,
    /// Every candidate would breach the budget
    OverBudget,
    /// Candidates were taken by concurrent allocations
    Contended,
    /// The reputation provider could not score any candidate
    Unscored,
}

impl fmt::Display for DeferReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoCandidates => "no candidates",
            Self::OverBudget => "over budget",
            Self::Contended => "contended",
            Self::Unscored => "unscored",
        };
        f.write_str(s)
    }
}

/// Outcome of one allocation attempt
#[derive(Debug, Clone, PartialEq)]
pub enum AllocationDecision {
    /// Capacity reserved on a node
    Assigned(Allocation),
    /// Try again on a later tick
    Deferred(DeferReason),
}

#[derive(Debug, Clone)]
struct Candidate {
    node: Node,
    reputation: f64,
    cost_rate: f64,
    score: f64,
}

/// Chooses nodes for jobs
#[derive(Clone)]
pub struct AllocationEngine {
    registry: Arc<NodeRegistry>,
    reputation: Arc<dyn ReputationProvider>,
    guard: BudgetGuard,
    scoring: ScoringConfig,
    defaults: AllocationConfig,
}

impl fmt::Debug for AllocationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationEngine")
            .field("scoring", &self.scoring)
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl AllocationEngine {
    /// Create an engine
    #[must_use]
    pub fn new(
        registry: Arc<NodeRegistry>,
        reputation: Arc<dyn ReputationProvider>,
        scoring: ScoringConfig,
        defaults: AllocationConfig,
    ) -> Self {
        Self {
            registry,
            reputation,
            guard: BudgetGuard::new(),
            scoring,
            defaults,
        }
    }

    /// Capacity units a job needs
    #[must_use]
    pub fn required_capacity(&self, job: &Job) -> u32 {
        job.spec
            .required_capacity
            .unwrap_or(self.defaults.default_required_capacity)
    }

    /// Expected duration of a job in seconds
    #[must_use]
    pub fn estimated_duration_secs(&self, job: &Job) -> u64 {
        job.spec
            .estimated_duration_secs
            .unwrap_or(self.defaults.default_estimated_duration_secs)
    }

    /// Pick a node for the next attempt of `job` and reserve its capacity
    ///
    /// # Errors
    ///
    /// Returns `NoCapacity` when no node that is not retired declares
    /// enough capacity for the job
    pub async fn allocate(&self, job: &Job) -> MeshResult<AllocationDecision> {
        let required = self.required_capacity(job);
        let available = self.registry.list_available(required).await;

        if available.is_empty() {
            let fits_somewhere = self
                .registry
                .max_declared_capacity()
                .await
                .is_some_and(|max| max >= required);
            if !fits_somewhere {
                return Err(MeshError::NoCapacity { required });
            }
            return Ok(AllocationDecision::Deferred(DeferReason::NoCandidates));
        }

        let ranked = self.rank(job, available).await;
        if ranked.is_empty() {
            return Ok(AllocationDecision::Deferred(DeferReason::Unscored));
        }

        let duration = self.estimated_duration_secs(job) as f64;
        let mut reason = DeferReason::OverBudget;

        for candidate in ranked {
            let projected_cost = candidate.cost_rate * duration;
            if let Err(err) = self.guard.check(job, projected_cost) {
                tracing::debug!(
                    job_id = %job.job_id,
                    node_id = %candidate.node.node_id,
                    error = %err,
                    "Candidate rejected by budget guard"
                );
                continue;
            }

            match self.registry.reserve(&candidate.node.node_id, required).await {
                Ok(incarnation) => {
                    let allocation = Allocation {
                        job_id: job.job_id,
                        node_id: candidate.node.node_id.clone(),
                        attempt: job.current_attempt + 1,
                        units: required,
                        incarnation,
                        reputation: candidate.reputation,
                        projected_cost,
                        score: candidate.score,
                        address: candidate.node.address(),
                    };
                    tracing::debug!(
                        job_id = %job.job_id,
                        node_id = %allocation.node_id,
                        attempt = allocation.attempt,
                        score = allocation.score,
                        projected_cost,
                        "Capacity reserved"
                    );
                    return Ok(AllocationDecision::Assigned(allocation));
                }
                Err(err) if err.is_transient() => {
                    tracing::debug!(
                        job_id = %job.job_id,
                        node_id = %candidate.node.node_id,
                        error = %err,
                        "Candidate lost to concurrent allocation"
                    );
                    reason = DeferReason::Contended;
                }
                Err(err) => return Err(err),
            }
        }

        Ok(AllocationDecision::Deferred(reason))
    }

    /// Score candidates and order them best first
    async fn rank(&self, job: &Job, nodes: Vec<Node>) -> Vec<Candidate> {
        let mut candidates = Vec::with_capacity(nodes.len());
        for node in nodes {
            match self.reputation.score(&node.node_id).await {
                Ok(score) => {
                    candidates.push(Candidate {
                        node,
                        reputation: score.reputation.clamp(0.0, 1.0),
                        cost_rate: score.estimated_cost_rate.max(0.0),
                        score: 0.0,
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        node_id = %node.node_id,
                        error = %err,
                        "Reputation provider failed, skipping candidate"
                    );
                }
            }
        }

        let weights = self.scoring.weights(job.speed_preference);
        let max_compute = candidates
            .iter()
            .map(|c| c.node.compute_score)
            .fold(0.0_f64, f64::max);
        let max_cost = candidates.iter().map(|c| c.cost_rate).fold(0.0_f64, f64::max);

        for c in &mut candidates {
            let compute = if max_compute > 0.0 {
                c.node.compute_score / max_compute
            } else {
                0.0
            };
            let cost = if max_cost > 0.0 {
                c.cost_rate / max_cost
            } else {
                0.0
            };
            c.score = weights.compute * compute + weights.reputation * c.reputation
                - weights.cost * cost;
        }

        candidates.sort_by(compare_candidates);
        candidates
    }
}

/// Highest score, then lowest load, then most recent heartbeat, then ID
fn compare_candidates(a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.node.current_load.cmp(&b.node.current_load))
        .then_with(|| b.node.last_heartbeat.cmp(&a.node.last_heartbeat))
        .then_with(|| a.node.node_id.cmp(&b.node.node_id))
}
