//! Simulated execution layer.
//!
//! Dispatch decides up front how and when an attempt ends; the harness pulls
//! finished attempts with [`SimExecutor::drain_due`]. Attempts on a crashed
//! node never report back.

use crate::failure::{CrashInjector, FailureModel};
use crate::seed::SimSeed;
use async_trait::async_trait;
use openmesh_cluster::{DispatchAck, DispatchRequest, ExecutionLayer};
use openmesh_core::{Clock, MeshError, MeshResult, NodeId, OutcomeEvent, OutcomeKind, Timestamp};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Attempt timing and pricing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadModel {
    /// Shortest attempt run time
    pub min_run_ms: u64,
    /// Longest attempt run time
    pub max_run_ms: u64,
    /// Money billed per second of successful run time
    pub cost_per_sec: f64,
}

impl WorkloadModel {
    /// Check the ranges
    ///
    /// # Errors
    ///
    /// Returns `Config` for an empty range or a negative price
    pub fn validate(&self) -> MeshResult<()> {
        if self.min_run_ms == 0 || self.min_run_ms > self.max_run_ms {
            return Err(MeshError::Config(
                "workload run time range must satisfy 0 < min_run_ms <= max_run_ms".to_string(),
            ));
        }
        if !self.cost_per_sec.is_finite() || self.cost_per_sec < 0.0 {
            return Err(MeshError::Config(
                "workload.cost_per_sec must be a non-negative number".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for WorkloadModel {
    fn default() -> Self {
        Self {
            min_run_ms: 1_000,
            max_run_ms: 8_000,
            cost_per_sec: 0.1 / 60.0,
        }
    }
}

#[derive(Debug, Clone)]
struct InFlight {
    due: Timestamp,
    event: OutcomeEvent,
}

/// Execution layer backed by a seeded RNG
#[derive(Debug, Clone)]
pub struct SimExecutor {
    rng: Arc<Mutex<ChaCha8Rng>>,
    in_flight: Arc<Mutex<Vec<InFlight>>>,
    injector: Arc<CrashInjector>,
    failures: FailureModel,
    workload: WorkloadModel,
    clock: Arc<dyn Clock>,
}

impl SimExecutor {
    /// Create an executor
    #[must_use]
    pub fn new(
        seed: &SimSeed,
        failures: FailureModel,
        workload: WorkloadModel,
        injector: Arc<CrashInjector>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            rng: Arc::new(Mutex::new(seed.derive("executor").rng())),
            in_flight: Arc::new(Mutex::new(Vec::new())),
            injector,
            failures,
            workload,
            clock,
        }
    }

    /// Outcomes due at or before `now`, in due order
    ///
    /// Attempts whose node is down are dropped.
    pub async fn drain_due(&self, now: Timestamp) -> Vec<OutcomeEvent> {
        let mut in_flight = self.in_flight.lock().await;
        let (mut due, pending): (Vec<_>, Vec<_>) =
            in_flight.drain(..).partition(|task| task.due <= now);
        *in_flight = pending;
        drop(in_flight);

        due.sort_by_key(|task| task.due);
        let mut out = Vec::with_capacity(due.len());
        for task in due {
            if self.injector.is_crashed(&task.event.node_id).await {
                tracing::debug!(
                    job_id = %task.event.job_id,
                    node_id = %task.event.node_id,
                    attempt = task.event.attempt,
                    "Dropping attempt on crashed node"
                );
                continue;
            }
            out.push(task.event);
        }
        out
    }

    /// Forget everything running on a node
    pub async fn drop_node(&self, node_id: &NodeId) -> usize {
        let mut in_flight = self.in_flight.lock().await;
        let before = in_flight.len();
        in_flight.retain(|task| &task.event.node_id != node_id);
        before - in_flight.len()
    }

    /// Attempts still running
    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }
}

#[async_trait]
impl ExecutionLayer for SimExecutor {
    async fn dispatch(&self, request: DispatchRequest) -> MeshResult<DispatchAck> {
        if self.injector.is_crashed(&request.node_id).await {
            return Err(MeshError::Collaborator {
                collaborator: "execution".to_string(),
                message: format!("{} is unreachable", request.address),
            });
        }

        let mut rng = self.rng.lock().await;
        if self.failures.rejects(&mut rng) {
            return Ok(DispatchAck::Rejected {
                reason: "node busy".to_string(),
            });
        }

        let run_ms = rng.gen_range(self.workload.min_run_ms..=self.workload.max_run_ms);
        let kind = self.failures.attempt_outcome(&mut rng);
        drop(rng);

        let due = self
            .clock
            .now()
            .saturating_add(Duration::from_millis(run_ms));
        let event = match kind {
            OutcomeKind::Success => OutcomeEvent::success(
                request.job_id,
                request.node_id,
                request.attempt,
                self.workload.cost_per_sec * run_ms as f64 / 1_000.0,
            ),
            OutcomeKind::Timeout => {
                OutcomeEvent::timeout(request.job_id, request.node_id, request.attempt)
            }
            _ => OutcomeEvent::failure(
                request.job_id,
                request.node_id,
                request.attempt,
                "simulated task failure",
            ),
        };

        tracing::debug!(
            job_id = %event.job_id,
            node_id = %event.node_id,
            attempt = event.attempt,
            outcome = %event.outcome,
            due = %due,
            "Simulated attempt started"
        );
        self.in_flight.lock().await.push(InFlight { due, event });
        Ok(DispatchAck::Accepted)
    }
}
