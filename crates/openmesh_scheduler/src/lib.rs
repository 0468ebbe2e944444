//! OpenMesh Scheduler
//!
//! Matches jobs to nodes under budget, capacity and reliability limits,
//! and recovers from failed attempts and lost nodes.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod allocation;
pub mod budget;
pub mod config;
pub mod control;
pub mod fault;
pub mod monitor;
pub mod state_machine;

pub use allocation::{
    Allocation, AllocationConfig, AllocationDecision, AllocationEngine, DeferReason,
    ScoringConfig, ScoringWeights,
};
pub use budget::{BudgetGuard, BudgetState};
pub use config::{MeshConfig, SchedulerConfig};
pub use control::{ControlPlane, TickReport};
pub use fault::{FaultToleranceController, Resolution, RetryPolicy};
pub use monitor::{
    CounterSnapshot, HealthReport, HealthStatus, JobMetrics, Metrics, NodeMetrics, NodeTally,
    Stats,
};
pub use state_machine::{CancelOutcome, CommitResult, JobEntry, JobStore, Release};
