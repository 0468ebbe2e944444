//! Control plane facade.
//!
//! Wires the registry, allocation engine, job state machine and
//! fault-tolerance controller together and exposes the operations the
//! transport layer calls. Background work (heartbeat ageing, scheduling
//! ticks, outcome intake) runs as loops that call the same operations.

use crate::allocation::{Allocation, AllocationDecision, AllocationEngine};
use crate::config::MeshConfig;
use crate::fault::{FaultToleranceController, Resolution};
use crate::monitor::{HealthReport, JobMetrics, Metrics, NodeMetrics, Stats, mean};
use crate::state_machine::{CancelOutcome, CommitResult, JobStore, Release};
use openmesh_cluster::{
    DispatchAck, DispatchRequest, ExecutionLayer, HeartbeatMonitor, NodeLoss, NodeRegistry,
    ReputationProvider,
};
use openmesh_core::{
    Clock, Job, JobId, JobSpec, MeshError, MeshResult, Node, NodeDescriptor, NodeId, NodeStatus,
    OutcomeEvent, SpeedPreference, Telemetry,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// What one scheduling pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    /// Attempts dispatched and acknowledged
    pub dispatched: usize,
    /// Jobs left waiting
    pub deferred: usize,
    /// Dispatches refused by nodes
    pub rejected: usize,
    /// Jobs whose cancel won the race with allocation
    pub cancelled: usize,
    /// Running attempts timed out by the sweep
    pub timed_out: usize,
}

enum Step {
    Dispatched,
    Rejected,
    Cancelled,
    Skipped,
}

/// Node registry + job scheduler + fault-tolerance controller
pub struct ControlPlane {
    config: MeshConfig,
    registry: Arc<NodeRegistry>,
    jobs: Arc<JobStore>,
    engine: AllocationEngine,
    controller: FaultToleranceController,
    heartbeat: HeartbeatMonitor,
    execution: Arc<dyn ExecutionLayer>,
    metrics: Arc<Metrics>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlPlane")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ControlPlane {
    /// Build a control plane over its collaborators
    ///
    /// # Errors
    ///
    /// Returns `Config` if the configuration is invalid
    pub fn new(
        config: MeshConfig,
        reputation: Arc<dyn ReputationProvider>,
        execution: Arc<dyn ExecutionLayer>,
        clock: Arc<dyn Clock>,
    ) -> MeshResult<Self> {
        config.validate()?;

        let registry = Arc::new(
            NodeRegistry::new(config.registry.clone(), clock.clone())
                .with_liveness_timeout(config.heartbeat.timeout())
                .with_initial_reputation(config.reputation.initial),
        );
        let jobs = Arc::new(JobStore::new(clock.clone()));
        let metrics = Arc::new(Metrics::new());
        let engine = AllocationEngine::new(
            registry.clone(),
            reputation.clone(),
            config.scoring.clone(),
            config.allocation.clone(),
        );
        let controller = FaultToleranceController::new(
            jobs.clone(),
            registry.clone(),
            reputation,
            metrics.clone(),
            config.retry.clone(),
            clock.clone(),
        );
        let heartbeat = HeartbeatMonitor::new(registry.clone(), config.heartbeat.clone());

        Ok(Self {
            config,
            registry,
            jobs,
            engine,
            controller,
            heartbeat,
            execution,
            metrics,
            clock,
        })
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// Node registry
    #[must_use]
    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Scheduler counters
    #[must_use]
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    // Nodes

    /// Register a node
    ///
    /// # Errors
    ///
    /// Returns `DuplicateNode` if it is already registered and live
    pub async fn register_node(&self, descriptor: NodeDescriptor) -> MeshResult<NodeId> {
        self.registry.register(descriptor).await
    }

    /// Record a node heartbeat
    ///
    /// # Errors
    ///
    /// Returns `UnknownNode` if the node is not registered
    pub async fn node_heartbeat(&self, node_id: &NodeId, telemetry: &Telemetry) -> MeshResult<NodeStatus> {
        self.registry.heartbeat(node_id, telemetry).await
    }

    /// Retire a node and hand off the attempts it was running
    ///
    /// # Errors
    ///
    /// Returns `UnknownNode` if the node is not registered
    pub async fn deregister_node(&self, node_id: &NodeId) -> MeshResult<()> {
        let loss = self.registry.deregister(node_id).await?;
        self.handle_node_lost(&loss).await;
        Ok(())
    }

    /// Node snapshot
    ///
    /// # Errors
    ///
    /// Returns `UnknownNode` if the node is not registered
    pub async fn get_node(&self, node_id: &NodeId) -> MeshResult<Node> {
        self.registry
            .get(node_id)
            .await
            .ok_or_else(|| MeshError::UnknownNode {
                node_id: node_id.clone(),
            })
    }

    /// Every node that is not retired
    pub async fn list_nodes(&self) -> Vec<Node> {
        self.registry
            .list()
            .await
            .into_iter()
            .filter(|n| n.status != NodeStatus::Retired)
            .collect()
    }

    // Jobs

    /// Submit a job
    ///
    /// # Errors
    ///
    /// Returns a validation error for a bad budget or capacity
    pub async fn submit_job(
        &self,
        spec: JobSpec,
        max_budget: f64,
        speed_preference: SpeedPreference,
    ) -> MeshResult<JobId> {
        self.jobs.submit(spec, max_budget, speed_preference).await
    }

    /// Job snapshot
    ///
    /// # Errors
    ///
    /// Returns `UnknownJob` if the job does not exist
    pub async fn get_job(&self, job_id: &JobId) -> MeshResult<Job> {
        self.jobs
            .get(job_id)
            .await
            .ok_or(MeshError::UnknownJob { job_id: *job_id })
    }

    /// Skip the backoff of a waiting job
    ///
    /// # Errors
    ///
    /// Returns `NotRetryable` unless the job is `retrying` or `pending`
    pub async fn retry_job(&self, job_id: &JobId) -> MeshResult<()> {
        self.jobs.retry(job_id).await
    }

    /// Cancel a job
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` for a job already in a terminal state
    pub async fn cancel_job(&self, job_id: &JobId) -> MeshResult<CancelOutcome> {
        self.jobs.cancel(job_id).await
    }

    /// Feed an outcome report from the execution layer
    ///
    /// # Errors
    ///
    /// Returns `UnknownJob` if the job does not exist
    pub async fn report_outcome(&self, event: OutcomeEvent) -> MeshResult<Resolution> {
        self.controller.handle(event).await
    }

    // Background work

    /// Demote silent nodes and hand off their attempts
    pub async fn sweep_heartbeats(&self) -> Vec<NodeId> {
        let lost = self.heartbeat.sweep().await;
        for loss in &lost {
            self.handle_node_lost(loss).await;
        }
        lost.into_iter().map(|loss| loss.node_id).collect()
    }

    /// Hand off the attempts a node left stranded when it left service
    ///
    /// Attempts placed on the node after it came back are kept, however
    /// late the notice arrives.
    pub async fn handle_node_lost(&self, loss: &NodeLoss) {
        let resolutions = self.controller.node_lost(loss).await;
        if !resolutions.is_empty() {
            tracing::warn!(
                node_id = %loss.node_id,
                incarnation = loss.incarnation,
                jobs = resolutions.len(),
                "Jobs handed off from lost node"
            );
        }
    }

    /// One scheduling pass: time out stale attempts, then try to place
    /// every eligible job
    pub async fn schedule_tick(&self) -> TickReport {
        let mut report = TickReport {
            timed_out: self
                .controller
                .sweep_timeouts(self.config.scheduler.attempt_timeout())
                .await
                .len(),
            ..TickReport::default()
        };

        let now = self.clock.now();
        for job in self.jobs.eligible(now).await {
            match self.engine.allocate(&job).await {
                Ok(AllocationDecision::Assigned(allocation)) => {
                    match self.dispatch(&job, allocation).await {
                        Step::Dispatched => report.dispatched += 1,
                        Step::Rejected => report.rejected += 1,
                        Step::Cancelled => report.cancelled += 1,
                        Step::Skipped => {}
                    }
                }
                Ok(AllocationDecision::Deferred(reason)) => {
                    self.metrics.record_deferral();
                    report.deferred += 1;
                    tracing::debug!(job_id = %job.job_id, %reason, "Allocation deferred");
                }
                Err(err) => {
                    self.metrics.record_deferral();
                    report.deferred += 1;
                    if err.is_transient() {
                        tracing::debug!(job_id = %job.job_id, error = %err, "Allocation deferred");
                    } else {
                        tracing::warn!(job_id = %job.job_id, error = %err, "Allocation failed");
                    }
                }
            }
        }

        if report != TickReport::default() {
            tracing::debug!(?report, "Scheduling tick");
        }
        report
    }

    async fn release(&self, release: Option<Release>) {
        if let Some(release) = release {
            self.registry.release(&release.node_id, release.units).await;
        }
    }

    /// Commit an allocation, then dispatch outside any lock
    async fn dispatch(&self, job: &Job, allocation: Allocation) -> Step {
        let node_id = allocation.node_id.clone();
        let attempt = allocation.attempt;

        match self.jobs.commit_allocation(&allocation).await {
            Ok(CommitResult::Committed) => {}
            Ok(CommitResult::Cancelled) => {
                self.registry.release(&node_id, allocation.units).await;
                return Step::Cancelled;
            }
            Err(err) => {
                tracing::debug!(job_id = %job.job_id, error = %err, "Allocation superseded");
                self.registry.release(&node_id, allocation.units).await;
                return Step::Skipped;
            }
        }
        self.metrics.record_allocation();
        self.registry
            .set_reputation(&node_id, allocation.reputation)
            .await;

        let request = DispatchRequest {
            job_id: job.job_id,
            node_id: node_id.clone(),
            attempt,
            spec: job.spec.clone(),
            address: allocation.address,
        };
        let ack = match self.execution.dispatch(request).await {
            Ok(ack) => ack,
            Err(err) => DispatchAck::Rejected {
                reason: err.to_string(),
            },
        };

        match ack {
            DispatchAck::Accepted => {
                self.registry.record_dispatch_accepted(&node_id).await;
                match self.jobs.mark_running(&job.job_id, attempt).await {
                    Ok(release) => self.release(release).await,
                    Err(err) => {
                        tracing::debug!(job_id = %job.job_id, error = %err, "Dispatch ack after attempt settled");
                    }
                }
                Step::Dispatched
            }
            DispatchAck::Rejected { reason } => {
                self.metrics.record_dispatch_rejection();
                tracing::warn!(
                    job_id = %job.job_id,
                    node_id = %node_id,
                    attempt,
                    reason = %reason,
                    "Dispatch rejected"
                );
                match self.jobs.requeue_rejected(&job.job_id, attempt, &reason).await {
                    Ok(release) => self.release(release).await,
                    Err(err) => {
                        tracing::debug!(job_id = %job.job_id, error = %err, "Rejection after attempt settled");
                    }
                }
                match self.registry.record_dispatch_rejected(&node_id).await {
                    Ok(Some(loss)) => self.handle_node_lost(&loss).await,
                    Ok(None) => {}
                    Err(err) => {
                        tracing::debug!(node_id = %node_id, error = %err, "Rejection for unknown node");
                    }
                }
                Step::Rejected
            }
        }
    }

    // Monitoring

    /// Aggregate counts and averages
    pub async fn stats(&self) -> Stats {
        let nodes = self.registry.list().await;
        let jobs = self.jobs.list().await;
        let in_service: Vec<&Node> = nodes
            .iter()
            .filter(|n| n.status != NodeStatus::Retired)
            .collect();

        Stats {
            nodes: self.registry.status_counts().await,
            jobs: self.jobs.counts().await,
            total_nodes: nodes.len(),
            total_jobs: jobs.len(),
            average_reputation: mean(in_service.iter().map(|n| n.reputation)),
            average_compute_score: mean(in_service.iter().map(|n| n.compute_score)),
            total_spent: jobs.iter().map(|j| j.spent_so_far).sum(),
            counters: self.metrics.snapshot(),
        }
    }

    /// Healthy unless no node is active or trust across active nodes is low
    pub async fn health(&self) -> HealthReport {
        let active: Vec<Node> = self
            .registry
            .list()
            .await
            .into_iter()
            .filter(|n| n.status == NodeStatus::Active)
            .collect();
        HealthReport::assess(&active, self.clock.now())
    }

    /// Per-node view
    ///
    /// # Errors
    ///
    /// Returns `UnknownNode` if the node is not registered
    pub async fn node_metrics(&self, node_id: &NodeId) -> MeshResult<NodeMetrics> {
        let node = self.get_node(node_id).await?;
        let active_jobs = self.jobs.in_flight_on(node_id).await.len();
        let utilization = f64::from(node.current_load) / f64::from(node.gpu_memory.max(1));
        Ok(NodeMetrics {
            tally: self.metrics.tally(node_id).await,
            node,
            active_jobs,
            utilization,
        })
    }

    /// Per-job view including its transition history
    ///
    /// # Errors
    ///
    /// Returns `UnknownJob` if the job does not exist
    pub async fn job_metrics(&self, job_id: &JobId) -> MeshResult<JobMetrics> {
        let entry = self
            .jobs
            .snapshot(job_id)
            .await
            .ok_or(MeshError::UnknownJob { job_id: *job_id })?;
        let job = entry.job().clone();
        Ok(JobMetrics {
            budget_used: job.spent_so_far / job.max_budget,
            history: entry.history().to_vec(),
            retry_at: entry.retry_at(),
            cancel_requested: entry.cancel_requested(),
            job,
        })
    }

    /// Start the background loops
    ///
    /// One task ages heartbeats; another owns the scheduling tick and
    /// drains outcome reports and lost-node notices. Both stop when
    /// `cancel` fires.
    pub fn spawn(
        self: &Arc<Self>,
        mut outcomes: mpsc::Receiver<OutcomeEvent>,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let (lost_tx, mut lost_rx) = mpsc::channel(self.config.scheduler.channel_capacity);
        let monitor = self.heartbeat.clone();
        let heartbeat = tokio::spawn(monitor.run(lost_tx, cancel.clone()));

        let plane = Arc::clone(self);
        let core = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(plane.config.scheduler.tick_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(
                tick_interval_ms = plane.config.scheduler.tick_interval_ms,
                "Scheduler loop started"
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("Scheduler loop shutting down");
                        break;
                    }
                    Some(loss) = lost_rx.recv() => {
                        plane.handle_node_lost(&loss).await;
                    }
                    Some(event) = outcomes.recv() => {
                        if let Err(err) = plane.report_outcome(event).await {
                            tracing::warn!(error = %err, "Outcome report rejected");
                        }
                    }
                    _ = ticker.tick() => {
                        plane.schedule_tick().await;
                    }
                }
            }
        });

        vec![heartbeat, core]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::RetryPolicy;
    use crate::monitor::HealthStatus;
    use openmesh_cluster::{InMemoryReputation, RecordingExecutor, ReputationConfig};
    use openmesh_core::{JobStatus, ManualClock, OutcomeKind, Timestamp};
    use std::time::Duration;

    struct Fixture {
        plane: Arc<ControlPlane>,
        executor: RecordingExecutor,
        clock: ManualClock,
    }

    fn fixture(config: MeshConfig) -> Fixture {
        let clock = ManualClock::new(Timestamp::from_millis(1_000_000));
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let executor = RecordingExecutor::new();
        let reputation = Arc::new(InMemoryReputation::new(ReputationConfig::default(), shared.clone()));
        let plane = ControlPlane::new(config, reputation, Arc::new(executor.clone()), shared).unwrap();
        Fixture {
            plane: Arc::new(plane),
            executor,
            clock,
        }
    }

    async fn live_node(fx: &Fixture, name: &str, capacity: u32) -> NodeId {
        let id = fx
            .plane
            .register_node(
                NodeDescriptor::new(NodeId::new(name).unwrap(), "10.3.0.1", 7000)
                    .with_gpu_memory(capacity)
                    .with_compute_score(4.0),
            )
            .await
            .unwrap();
        fx.plane.node_heartbeat(&id, &Telemetry::healthy()).await.unwrap();
        id
    }

    async fn submit(fx: &Fixture) -> JobId {
        fx.plane
            .submit_job(JobSpec::new("inference", "llama-7b"), 10.0, SpeedPreference::Balanced)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        let config = MeshConfig::new().with_retry(RetryPolicy::default().with_max_attempts(0));
        let result = ControlPlane::new(
            config,
            Arc::new(InMemoryReputation::new(ReputationConfig::default(), clock.clone())),
            Arc::new(RecordingExecutor::new()),
            clock,
        );
        assert!(matches!(result, Err(MeshError::Config(_))));
    }

    #[tokio::test]
    async fn test_submit_dispatch_complete() {
        let fx = fixture(MeshConfig::new());
        let node = live_node(&fx, "n1", 1).await;
        let job_id = submit(&fx).await;

        let report = fx.plane.schedule_tick().await;
        assert_eq!(report.dispatched, 1);
        let job = fx.plane.get_job(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.assigned_node_id, Some(node.clone()));

        let request = fx.executor.last_for(&job_id).await.unwrap();
        assert_eq!(request.address, "10.3.0.1:7000");
        let res = fx
            .plane
            .report_outcome(OutcomeEvent::success(job_id, node.clone(), request.attempt, 0.8))
            .await
            .unwrap();
        assert_eq!(res, Resolution::Completed);

        let metrics = fx.plane.node_metrics(&node).await.unwrap();
        assert_eq!(metrics.tally.completed, 1);
        assert_eq!(metrics.active_jobs, 0);
        assert_eq!(metrics.node.current_load, 0);

        let job_metrics = fx.plane.job_metrics(&job_id).await.unwrap();
        let path: Vec<_> = job_metrics.history.iter().map(|t| t.to).collect();
        assert_eq!(
            path,
            vec![JobStatus::Allocated, JobStatus::Running, JobStatus::Completed]
        );
    }

    #[tokio::test]
    async fn test_rejection_requeues_and_retires_node() {
        let config = MeshConfig::new().with_registry(
            openmesh_cluster::RegistryConfig::default().with_max_allocation_failures(2),
        );
        let fx = fixture(config);
        let node = live_node(&fx, "flaky", 1).await;
        fx.executor.reject_on(node.clone()).await;
        let job_id = submit(&fx).await;

        assert_eq!(fx.plane.schedule_tick().await.rejected, 1);
        let job = fx.plane.get_job(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.current_attempt, 1);
        assert_eq!(fx.plane.get_node(&node).await.unwrap().current_load, 0);

        assert_eq!(fx.plane.schedule_tick().await.rejected, 1);
        assert_eq!(
            fx.plane.get_node(&node).await.unwrap().status,
            NodeStatus::Retired
        );
        assert!(fx.plane.list_nodes().await.is_empty());

        // Late report for a rejected attempt is stale
        let res = fx
            .plane
            .report_outcome(OutcomeEvent::success(job_id, node, 1, 1.0))
            .await
            .unwrap();
        assert_eq!(res, Resolution::Discarded);
    }

    #[tokio::test]
    async fn test_cancel_running_then_outcome() {
        let fx = fixture(MeshConfig::new());
        let node = live_node(&fx, "n1", 1).await;
        let job_id = submit(&fx).await;
        fx.plane.schedule_tick().await;

        assert_eq!(
            fx.plane.cancel_job(&job_id).await.unwrap(),
            CancelOutcome::Deferred
        );
        let res = fx
            .plane
            .report_outcome(OutcomeEvent::failure(job_id, node, 1, "killed"))
            .await
            .unwrap();
        assert_eq!(res, Resolution::Aborted);
        assert!(matches!(
            fx.plane.cancel_job(&job_id).await,
            Err(MeshError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_retry_job_skips_backoff() {
        let config = MeshConfig::new().with_retry(RetryPolicy::default().with_base_delay_ms(30_000));
        let fx = fixture(config);
        let node = live_node(&fx, "n1", 1).await;
        let job_id = submit(&fx).await;
        fx.plane.schedule_tick().await;
        fx.plane
            .report_outcome(OutcomeEvent::failure(job_id, node, 1, "flake"))
            .await
            .unwrap();

        assert_eq!(fx.plane.schedule_tick().await.dispatched, 0);
        fx.plane.retry_job(&job_id).await.unwrap();
        assert_eq!(fx.plane.schedule_tick().await.dispatched, 1);
        assert_eq!(fx.plane.get_job(&job_id).await.unwrap().current_attempt, 2);

        assert!(matches!(
            fx.plane.retry_job(&job_id).await,
            Err(MeshError::NotRetryable { .. })
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_sweep_hands_off_jobs() {
        let fx = fixture(MeshConfig::new());
        let node = live_node(&fx, "n1", 2).await;
        let job_id = submit(&fx).await;
        fx.plane.schedule_tick().await;

        fx.clock.advance(Duration::from_secs(11));
        assert_eq!(fx.plane.sweep_heartbeats().await, vec![node.clone()]);
        let job = fx.plane.get_job(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Retrying);
        assert_eq!(job.attempt_count, 1);
        assert!(fx.plane.sweep_heartbeats().await.is_empty());
        assert_eq!(fx.plane.stats().await.counters.node_lost_events, 1);
    }

    #[tokio::test]
    async fn test_deregister_hands_off_jobs() {
        let fx = fixture(MeshConfig::new());
        let node = live_node(&fx, "n1", 1).await;
        let job_id = submit(&fx).await;
        fx.plane.schedule_tick().await;

        fx.plane.deregister_node(&node).await.unwrap();
        assert_eq!(
            fx.plane.get_job(&job_id).await.unwrap().status,
            JobStatus::Retrying
        );
        assert!(fx.plane.deregister_node(&NodeId::new("ghost").unwrap()).await.is_err());
    }

    #[tokio::test]
    async fn test_retirement_by_rejection_hands_off_running_attempts() {
        let config = MeshConfig::new()
            .with_registry(
                openmesh_cluster::RegistryConfig::default().with_max_allocation_failures(1),
            )
            .with_retry(RetryPolicy::default().with_base_delay_ms(60_000));
        let fx = fixture(config);
        let node = live_node(&fx, "n1", 2).await;
        let a = submit(&fx).await;
        assert_eq!(fx.plane.schedule_tick().await.dispatched, 1);

        fx.executor.reject_on(node.clone()).await;
        let b = submit(&fx).await;
        assert_eq!(fx.plane.schedule_tick().await.rejected, 1);

        let retired = fx.plane.get_node(&node).await.unwrap();
        assert_eq!(retired.status, NodeStatus::Retired);
        assert_eq!(retired.current_load, 0);
        assert_eq!(fx.plane.get_job(&a).await.unwrap().status, JobStatus::Retrying);
        assert_eq!(fx.plane.get_job(&b).await.unwrap().status, JobStatus::Pending);
        assert_eq!(fx.plane.stats().await.counters.node_lost_events, 1);

        // The node comes back and fills up with fresh work
        fx.executor.accept_on(&node).await;
        live_node(&fx, "n1", 2).await;
        let c = submit(&fx).await;
        assert_eq!(fx.plane.schedule_tick().await.dispatched, 2);
        for id in [b, c] {
            assert_eq!(fx.plane.get_job(&id).await.unwrap().status, JobStatus::Running);
        }

        let res = fx
            .plane
            .report_outcome(OutcomeEvent::success(a, node.clone(), 1, 0.5))
            .await
            .unwrap();
        assert_eq!(res, Resolution::Discarded);
        assert_eq!(fx.plane.get_node(&node).await.unwrap().current_load, 2);

        submit(&fx).await;
        let report = fx.plane.schedule_tick().await;
        assert_eq!((report.dispatched, report.deferred), (0, 1));
        assert_eq!(fx.plane.get_node(&node).await.unwrap().current_load, 2);
    }

    #[tokio::test]
    async fn test_late_lost_notice_spares_attempts_after_return() {
        let fx = fixture(MeshConfig::new());
        let node = live_node(&fx, "n1", 2).await;
        let a = submit(&fx).await;
        fx.plane.schedule_tick().await;

        // Demoted by the monitor; the notice is still queued
        fx.clock.advance(Duration::from_secs(11));
        let lost = fx
            .plane
            .registry()
            .demote_silent(fx.plane.config().heartbeat.timeout())
            .await;
        assert_eq!(lost.len(), 1);

        assert_eq!(
            fx.plane.node_heartbeat(&node, &Telemetry::healthy()).await.unwrap(),
            NodeStatus::Active
        );
        assert_eq!(fx.plane.get_node(&node).await.unwrap().current_load, 1);
        let b = submit(&fx).await;
        assert_eq!(fx.plane.schedule_tick().await.dispatched, 1);
        assert_eq!(fx.plane.get_node(&node).await.unwrap().current_load, 2);

        fx.plane.handle_node_lost(&lost[0]).await;
        fx.plane.handle_node_lost(&lost[0]).await;

        assert_eq!(fx.plane.get_job(&a).await.unwrap().status, JobStatus::Retrying);
        let job_b = fx.plane.get_job(&b).await.unwrap();
        assert_eq!(job_b.status, JobStatus::Running);
        assert_eq!(job_b.assigned_node_id, Some(node.clone()));
        assert_eq!(fx.plane.get_node(&node).await.unwrap().current_load, 1);
        assert_eq!(fx.plane.stats().await.counters.node_lost_events, 1);
    }

    #[tokio::test]
    async fn test_registry_seeded_with_initial_reputation() {
        let config = MeshConfig::new().with_reputation(ReputationConfig {
            initial: 0.2,
            ..ReputationConfig::default()
        });
        let fx = fixture(config);
        let node = live_node(&fx, "n1", 1).await;
        assert_eq!(fx.plane.get_node(&node).await.unwrap().reputation, 0.2);
    }

    #[tokio::test]
    async fn test_stats_and_health() {
        let fx = fixture(MeshConfig::new());
        assert_eq!(fx.plane.health().await.status, HealthStatus::Degraded);

        let node = live_node(&fx, "n1", 1).await;
        let job_id = submit(&fx).await;
        submit(&fx).await;
        fx.plane.schedule_tick().await;
        fx.plane
            .report_outcome(OutcomeEvent::success(job_id, node, 1, 1.25))
            .await
            .unwrap();

        let stats = fx.plane.stats().await;
        assert_eq!(stats.total_nodes, 1);
        assert_eq!(stats.total_jobs, 2);
        assert_eq!(stats.jobs[&JobStatus::Completed], 1);
        assert_eq!(stats.jobs[&JobStatus::Pending], 1);
        assert_eq!(stats.nodes[&NodeStatus::Active], 1);
        assert_eq!(stats.total_spent, 1.25);
        assert_eq!(stats.counters.allocations, 1);
        assert_eq!(stats.counters.deferrals, 1);
        assert_eq!(stats.average_compute_score, 4.0);

        assert_eq!(fx.plane.health().await.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_attempt_timeout_sweep() {
        let config = MeshConfig::new().with_scheduler(crate::config::SchedulerConfig {
            attempt_timeout_ms: 5_000,
            ..Default::default()
        });
        let fx = fixture(config);
        let node = live_node(&fx, "n1", 1).await;
        let job_id = submit(&fx).await;
        fx.plane.schedule_tick().await;

        fx.clock.advance(Duration::from_secs(6));
        fx.plane.node_heartbeat(&node, &Telemetry::healthy()).await.unwrap();
        let report = fx.plane.schedule_tick().await;
        assert_eq!(report.timed_out, 1);
        let history = fx.plane.job_metrics(&job_id).await.unwrap().history;
        assert!(history.last().unwrap().reason.contains(&OutcomeKind::Timeout.to_string()));
    }

    #[tokio::test]
    async fn test_spawned_loops_settle_job() {
        let config = MeshConfig::new().with_scheduler(crate::config::SchedulerConfig {
            tick_interval_ms: 10,
            ..Default::default()
        });
        let fx = fixture(config);
        let node = live_node(&fx, "n1", 1).await;
        let job_id = submit(&fx).await;

        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handles = fx.plane.spawn(rx, cancel.clone());

        let attempt = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(req) = fx.executor.last_for(&job_id).await {
                    break req.attempt;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        tx.send(OutcomeEvent::success(job_id, node, attempt, 0.5))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while fx.plane.get_job(&job_id).await.unwrap().status != JobStatus::Completed {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
