//! OpenMesh Deterministic Simulation
//!
//! Drives the control plane against simulated nodes on a manual clock.
//! Every run is reproducible from its seed.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod executor;
pub mod failure;
pub mod harness;
pub mod seed;

pub use executor::{SimExecutor, WorkloadModel};
pub use failure::{Churn, CrashInjector, FailureModel};
pub use harness::{SimConfig, SimReport, Simulation, TickSummary};
pub use seed::SimSeed;
