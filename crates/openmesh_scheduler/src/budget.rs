//! Budget guard.
//!
//! Keeps `spent_so_far` monotone and never above `max_budget`.

use openmesh_core::{Job, MeshError, MeshResult};

/// Where a job stands after a spend was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetState {
    /// Money left for further attempts
    Within,
    /// Ceiling reached; no further attempts may be purchased
    Exhausted,
}

/// Checks projected and actual costs against a job's ceiling
#[derive(Debug, Clone, Copy, Default)]
pub struct BudgetGuard;

impl BudgetGuard {
    /// Create a guard
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Check that `projected_cost` fits in what is left of the budget
    ///
    /// # Errors
    ///
    /// Returns `BudgetExceeded` if `spent_so_far + projected_cost` would pass
    /// `max_budget`
    pub fn check(&self, job: &Job, projected_cost: f64) -> MeshResult<()> {
        let projected = projected_cost.max(0.0);
        if job.spent_so_far + projected > job.max_budget {
            return Err(MeshError::BudgetExceeded {
                job_id: job.job_id,
                projected,
                remaining: job.remaining_budget(),
            });
        }
        Ok(())
    }

    /// Add an actual cost to the job's spend
    ///
    /// A spend that would breach the ceiling is refused and not recorded.
    /// Negative costs are treated as zero.
    ///
    /// # Errors
    ///
    /// Returns `BudgetExceeded` if the spend does not fit
    pub fn record_spend(&self, job: &mut Job, actual_cost: f64) -> MeshResult<BudgetState> {
        let cost = if actual_cost.is_finite() {
            actual_cost.max(0.0)
        } else {
            f64::INFINITY
        };
        self.check(job, cost)?;
        job.spent_so_far += cost;
        if job.spent_so_far >= job.max_budget {
            Ok(BudgetState::Exhausted)
        } else {
            Ok(BudgetState::Within)
        }
    }
}
