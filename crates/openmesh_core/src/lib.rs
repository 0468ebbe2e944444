//! OpenMesh Core Types
//!
//! This crate contains pure types and logic with no I/O.
//! Nodes, jobs, outcome events and the error taxonomy shared by the
//! registry, the scheduler and the fault-tolerance controller.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod event;
pub mod id;
pub mod job;
pub mod node;
pub mod time;
pub mod version;

// Re-exports
pub use error::{MeshError, MeshResult};
pub use event::{OutcomeEvent, OutcomeKind};
pub use id::{JobId, NodeId};
pub use job::{Job, JobSpec, JobStatus, SpeedPreference, Transition};
pub use node::{Node, NodeDescriptor, NodeStatus, Telemetry};
pub use time::{Clock, ManualClock, SystemClock, Timestamp};
pub use version::Version;
