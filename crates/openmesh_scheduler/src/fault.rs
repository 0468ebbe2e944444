//! Fault-tolerance controller.
//!
//! Settles attempts from outcome reports. The job lock is held only while
//! the decision is applied; capacity release and the reputation report
//! happen after it is dropped.

use crate::budget::BudgetGuard;
use crate::monitor::Metrics;
use crate::state_machine::{JobEntry, JobStore};
use openmesh_cluster::{NodeLoss, NodeRegistry, ReputationProvider};
use openmesh_core::{Clock, JobStatus, MeshError, MeshResult, OutcomeEvent, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Retry limit and backoff curve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Failed attempts after which a job is `failed`
    pub max_attempts: u32,
    /// Delay after the first failure
    pub base_delay_ms: u64,
    /// Ceiling on any delay
    pub max_delay_ms: u64,
    /// Growth factor per failure
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Set the retry limit
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the first delay
    #[must_use]
    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    /// Delay before the attempt following failure number `failures`
    #[must_use]
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(63) as i32;
        let delay = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = delay.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Check the policy is usable
    ///
    /// # Errors
    ///
    /// Returns `Config` for a zero limit or a shrinking curve
    pub fn validate(&self) -> MeshResult<()> {
        if self.max_attempts == 0 {
            return Err(MeshError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(MeshError::Config(format!(
                "retry.multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(MeshError::Config(format!(
                "retry.max_delay_ms ({}) is below retry.base_delay_ms ({})",
                self.max_delay_ms, self.base_delay_ms
            )));
        }
        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

/// What an outcome report did to its job
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Job finished
    Completed,
    /// Job waits out a backoff before the next attempt
    Retrying {
        /// Failed attempts so far
        failures: u32,
        /// Earliest next allocation
        retry_at: Timestamp,
    },
    /// Out of attempts
    Failed,
    /// Budget exhausted or breached
    AbortedBudget,
    /// Cancel honored
    Aborted,
    /// Report was stale and ignored
    Discarded,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::Retrying { failures, .. } => write!(f, "retrying after {} failures", failures),
            Self::Failed => f.write_str("failed"),
            Self::AbortedBudget => f.write_str("aborted_budget"),
            Self::Aborted => f.write_str("aborted"),
            Self::Discarded => f.write_str("discarded"),
        }
    }
}

/// Drives retries and reassignment from attempt outcomes
pub struct FaultToleranceController {
    jobs: Arc<JobStore>,
    registry: Arc<NodeRegistry>,
    reputation: Arc<dyn ReputationProvider>,
    metrics: Arc<Metrics>,
    policy: RetryPolicy,
    guard: BudgetGuard,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for FaultToleranceController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultToleranceController")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl FaultToleranceController {
    /// Create a controller
    #[must_use]
    pub fn new(
        jobs: Arc<JobStore>,
        registry: Arc<NodeRegistry>,
        reputation: Arc<dyn ReputationProvider>,
        metrics: Arc<Metrics>,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            jobs,
            registry,
            reputation,
            metrics,
            policy,
            guard: BudgetGuard::new(),
            clock,
        }
    }

    /// Retry policy in use
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Settle one outcome report
    ///
    /// Reports for an old attempt, another node or a finished job are
    /// discarded without touching state.
    ///
    /// # Errors
    ///
    /// Returns `UnknownJob` if the job does not exist
    pub async fn handle(&self, event: OutcomeEvent) -> MeshResult<Resolution> {
        let now = self.clock.now();
        let mut entry = self.jobs.lock(&event.job_id).await?;

        if let Err(err) = entry.check_attempt(&event.node_id, event.attempt) {
            drop(entry);
            self.metrics.record_stale_event();
            tracing::debug!(
                job_id = %event.job_id,
                node_id = %event.node_id,
                attempt = event.attempt,
                outcome = %event.outcome,
                error = %err,
                "Discarding stale outcome"
            );
            return Ok(Resolution::Discarded);
        }

        if entry.job().status == JobStatus::Allocated {
            entry.transition(JobStatus::Running, "outcome arrived before dispatch ack", now)?;
        }

        let release = entry.release();
        let spent_before = entry.job().spent_so_far;
        let resolution = self.resolve(&mut entry, &event, now)?;
        let billed = entry.job().spent_so_far - spent_before;
        drop(entry);

        if let Some(release) = release {
            self.registry.release(&release.node_id, release.units).await;
        }
        self.record(&event, resolution, billed).await;

        if let Err(err) = self
            .reputation
            .report_outcome(&event.node_id, event.outcome)
            .await
        {
            tracing::warn!(
                node_id = %event.node_id,
                error = %err,
                "Failed to report outcome to reputation provider"
            );
        }

        Ok(resolution)
    }

    fn resolve(
        &self,
        entry: &mut JobEntry,
        event: &OutcomeEvent,
        now: Timestamp,
    ) -> MeshResult<Resolution> {
        let job_id = entry.job().job_id;
        let spend = entry.record_spend(&self.guard, event.cost);

        if let Err(err) = &spend {
            tracing::warn!(job_id = %job_id, cost = event.cost, error = %err, "Spend refused");
            entry.transition(JobStatus::AbortedBudget, err.to_string(), now)?;
            return Ok(Resolution::AbortedBudget);
        }

        if entry.cancel_requested() {
            entry.transition(JobStatus::Aborted, "cancelled while running", now)?;
            return Ok(Resolution::Aborted);
        }

        if event.outcome.is_success() {
            entry.transition(JobStatus::Completed, "attempt succeeded", now)?;
            return Ok(Resolution::Completed);
        }

        let failures = entry.record_failure();
        let detail = event
            .reason
            .clone()
            .unwrap_or_else(|| event.outcome.to_string());

        if entry.job().remaining_budget() <= 0.0 {
            entry.transition(
                JobStatus::AbortedBudget,
                format!("budget exhausted after {}: {}", event.outcome, detail),
                now,
            )?;
            return Ok(Resolution::AbortedBudget);
        }

        if failures >= self.policy.max_attempts {
            let err = MeshError::RetryLimitExceeded {
                job_id,
                attempts: failures,
            };
            entry.transition(JobStatus::Failed, format!("{}: {}", err, detail), now)?;
            return Ok(Resolution::Failed);
        }

        let retry_at = now.saturating_add(self.policy.backoff(failures));
        entry.transition(
            JobStatus::Retrying,
            format!("attempt {} {}: {}", event.attempt, event.outcome, detail),
            now,
        )?;
        entry.schedule_retry(retry_at);
        Ok(Resolution::Retrying { failures, retry_at })
    }

    async fn record(&self, event: &OutcomeEvent, resolution: Resolution, billed: f64) {
        match resolution {
            Resolution::Retrying { .. } => self.metrics.record_retry(),
            Resolution::AbortedBudget => self.metrics.record_budget_abort(),
            _ => {}
        }
        self.metrics
            .record_attempt(&event.node_id, event.outcome.is_success(), billed)
            .await;

        tracing::info!(
            job_id = %event.job_id,
            node_id = %event.node_id,
            attempt = event.attempt,
            outcome = %event.outcome,
            %resolution,
            "Attempt settled"
        );
    }

    /// Hand off the attempts a node left stranded when it left service
    ///
    /// Each attempt gets one `node_lost` report; a second call for the same
    /// loss finds nothing left to hand off. Attempts placed after the node
    /// came back are untouched.
    pub async fn node_lost(&self, loss: &NodeLoss) -> Vec<Resolution> {
        let node_id = &loss.node_id;
        let mut out = Vec::new();
        for (job_id, attempt) in self.jobs.stranded_by(loss).await {
            self.metrics.record_node_lost();
            let event = OutcomeEvent::node_lost(job_id, node_id.clone(), attempt);
            match self.handle(event).await {
                Ok(resolution) => out.push(resolution),
                Err(err) => {
                    tracing::warn!(job_id = %job_id, node_id = %node_id, error = %err, "Node-lost handoff failed");
                }
            }
        }
        out
    }

    /// Time out running attempts older than `timeout`
    pub async fn sweep_timeouts(&self, timeout: Duration) -> Vec<Resolution> {
        let now = self.clock.now();
        let mut out = Vec::new();
        for (job_id, node_id, attempt) in self.jobs.overdue(now, timeout).await {
            self.metrics.record_timeout();
            let event = OutcomeEvent::timeout(job_id, node_id, attempt);
            match self.handle(event).await {
                Ok(resolution) => out.push(resolution),
                Err(err) => {
                    tracing::warn!(job_id = %job_id, error = %err, "Timeout handling failed");
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::Allocation;
    use openmesh_cluster::{InMemoryReputation, RegistryConfig, ReputationConfig};
    use openmesh_core::{
        JobId, JobSpec, ManualClock, NodeDescriptor, NodeId, SpeedPreference, Telemetry,
    };

    struct Fixture {
        jobs: Arc<JobStore>,
        registry: Arc<NodeRegistry>,
        reputation: Arc<InMemoryReputation>,
        metrics: Arc<Metrics>,
        controller: FaultToleranceController,
        clock: ManualClock,
    }

    async fn fixture(policy: RetryPolicy) -> Fixture {
        let clock = ManualClock::new(Timestamp::from_millis(100_000));
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let jobs = Arc::new(JobStore::new(shared.clone()));
        let registry = Arc::new(NodeRegistry::new(RegistryConfig::default(), shared.clone()));
        let reputation = Arc::new(InMemoryReputation::new(
            ReputationConfig::default(),
            shared.clone(),
        ));
        let metrics = Arc::new(Metrics::new());
        let controller = FaultToleranceController::new(
            jobs.clone(),
            registry.clone(),
            reputation.clone(),
            metrics.clone(),
            policy,
            shared,
        );
        for name in ["n1", "n2", "n3"] {
            let id = NodeId::new(name).unwrap();
            registry
                .register(NodeDescriptor::new(id.clone(), "10.2.0.1", 7000).with_gpu_memory(2))
                .await
                .unwrap();
            registry.heartbeat(&id, &Telemetry::healthy()).await.unwrap();
        }
        Fixture {
            jobs,
            registry,
            reputation,
            metrics,
            controller,
            clock,
        }
    }

    fn node(name: &str) -> NodeId {
        NodeId::new(name).unwrap()
    }

    /// Submit (or reuse) a job and start its next attempt on `node_name`
    async fn start(fx: &Fixture, job_id: Option<JobId>, budget: f64, node_name: &str) -> (JobId, u32) {
        let job_id = match job_id {
            Some(id) => id,
            None => fx
                .jobs
                .submit(JobSpec::new("train", "gpt2"), budget, SpeedPreference::Balanced)
                .await
                .unwrap(),
        };
        let job = fx.jobs.get(&job_id).await.unwrap();
        fx.registry.reserve(&node(node_name), 1).await.unwrap();
        let allocation = Allocation {
            job_id,
            node_id: node(node_name),
            attempt: job.current_attempt + 1,
            units: 1,
            incarnation: fx.registry.get(&node(node_name)).await.unwrap().incarnation,
            reputation: 0.5,
            projected_cost: 0.0,
            score: 0.0,
            address: String::new(),
        };
        fx.jobs.commit_allocation(&allocation).await.unwrap();
        fx.jobs.mark_running(&job_id, allocation.attempt).await.unwrap();
        (job_id, allocation.attempt)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(2), Duration::from_millis(2_000));
        assert_eq!(policy.backoff(3), Duration::from_millis(4_000));
        assert_eq!(policy.backoff(30), Duration::from_millis(60_000));
    }

    #[test]
    fn test_policy_validate() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy::default().with_max_attempts(0).validate().is_err());
        let shrinking = RetryPolicy {
            multiplier: 0.5,
            ..RetryPolicy::default()
        };
        assert!(shrinking.validate().is_err());
    }

    #[tokio::test]
    async fn test_success_completes_and_bills() {
        let fx = fixture(RetryPolicy::default()).await;
        let (job_id, attempt) = start(&fx, None, 10.0, "n1").await;

        let res = fx
            .controller
            .handle(OutcomeEvent::success(job_id, node("n1"), attempt, 2.5))
            .await
            .unwrap();
        assert_eq!(res, Resolution::Completed);

        let job = fx.jobs.get(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.spent_so_far, 2.5);
        assert_eq!(fx.registry.get(&node("n1")).await.unwrap().current_load, 0);
        assert_eq!(fx.metrics.tally(&node("n1")).await.earned, 2.5);
        assert!(fx.reputation.score(&node("n1")).await.unwrap().reputation > 0.5);
    }

    #[tokio::test]
    async fn test_failure_schedules_backoff() {
        let fx = fixture(RetryPolicy::default()).await;
        let (job_id, attempt) = start(&fx, None, 10.0, "n1").await;

        let res = fx
            .controller
            .handle(OutcomeEvent::failure(job_id, node("n1"), attempt, "CUDA OOM"))
            .await
            .unwrap();
        let expected_at = fx.clock.now().saturating_add(Duration::from_millis(1_000));
        assert_eq!(
            res,
            Resolution::Retrying {
                failures: 1,
                retry_at: expected_at
            }
        );
        let entry = fx.jobs.snapshot(&job_id).await.unwrap();
        assert_eq!(entry.job().status, JobStatus::Retrying);
        assert_eq!(entry.retry_at(), Some(expected_at));
        assert_eq!(fx.registry.get(&node("n1")).await.unwrap().current_load, 0);
        assert!(fx.reputation.score(&node("n1")).await.unwrap().reputation < 0.5);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_fail_and_later_reports_ignored() {
        let fx = fixture(RetryPolicy::default()).await;
        let mut job_id = None;
        let mut attempts = Vec::new();
        for name in ["n1", "n2", "n3"] {
            let (id, attempt) = start(&fx, job_id, 10.0, name).await;
            job_id = Some(id);
            attempts.push((id, attempt));
            fx.controller
                .handle(OutcomeEvent::failure(id, node(name), attempt, "crash"))
                .await
                .unwrap();
            fx.clock.advance(Duration::from_secs(120));
        }
        let last = attempts[2];
        assert_eq!(attempts.iter().map(|a| a.1).collect::<Vec<_>>(), vec![1, 2, 3]);
        let job = fx.jobs.get(&last.0).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt_count, 3);
        assert!(job.error_message.unwrap().contains("Retry limit exceeded"));

        let res = fx
            .controller
            .handle(OutcomeEvent::success(last.0, node("n3"), last.1, 1.0))
            .await
            .unwrap();
        assert_eq!(res, Resolution::Discarded);
        assert_eq!(fx.jobs.get(&last.0).await.unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_stale_attempt_discarded() {
        let fx = fixture(RetryPolicy::default()).await;
        let (job_id, first) = start(&fx, None, 10.0, "n1").await;
        fx.controller
            .handle(OutcomeEvent::timeout(job_id, node("n1"), first))
            .await
            .unwrap();
        let (_, second) = start(&fx, Some(job_id), 10.0, "n2").await;
        let before = fx.jobs.get(&job_id).await.unwrap();

        let res = fx
            .controller
            .handle(OutcomeEvent::success(job_id, node("n1"), first, 1.0))
            .await
            .unwrap();
        assert_eq!(res, Resolution::Discarded);
        assert_eq!(fx.jobs.get(&job_id).await.unwrap(), before);
        assert_eq!(before.current_attempt, second);
        assert_eq!(fx.metrics.snapshot().stale_events, 1);
    }

    #[tokio::test]
    async fn test_overspend_aborts_without_recording() {
        let fx = fixture(RetryPolicy::default()).await;
        let (job_id, attempt) = start(&fx, None, 3.0, "n1").await;
        let res = fx
            .controller
            .handle(OutcomeEvent::success(job_id, node("n1"), attempt, 5.0))
            .await
            .unwrap();
        assert_eq!(res, Resolution::AbortedBudget);
        let job = fx.jobs.get(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::AbortedBudget);
        assert_eq!(job.spent_so_far, 0.0);
        assert_eq!(fx.metrics.snapshot().budget_aborts, 1);
    }

    #[tokio::test]
    async fn test_failure_with_spent_budget_aborts() {
        let fx = fixture(RetryPolicy::default()).await;
        let (job_id, attempt) = start(&fx, None, 3.0, "n1").await;
        let res = fx
            .controller
            .handle(OutcomeEvent::failure(job_id, node("n1"), attempt, "partial").with_cost(3.0))
            .await
            .unwrap();
        assert_eq!(res, Resolution::AbortedBudget);
        assert_eq!(fx.jobs.get(&job_id).await.unwrap().spent_so_far, 3.0);
    }

    #[tokio::test]
    async fn test_cancel_while_running_forces_abort() {
        let fx = fixture(RetryPolicy::default()).await;
        let (job_id, attempt) = start(&fx, None, 10.0, "n1").await;
        fx.jobs.cancel(&job_id).await.unwrap();

        let res = fx
            .controller
            .handle(OutcomeEvent::success(job_id, node("n1"), attempt, 1.0))
            .await
            .unwrap();
        assert_eq!(res, Resolution::Aborted);
        assert_eq!(fx.jobs.get(&job_id).await.unwrap().status, JobStatus::Aborted);
        assert_eq!(fx.registry.get(&node("n1")).await.unwrap().current_load, 0);
    }

    #[tokio::test]
    async fn test_node_lost_hands_off_once() {
        let fx = fixture(RetryPolicy::default()).await;
        let (a, _) = start(&fx, None, 10.0, "n1").await;
        let (b, _) = start(&fx, None, 10.0, "n1").await;

        let loss = fx.registry.deregister(&node("n1")).await.unwrap();
        let first = fx.controller.node_lost(&loss).await;
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|r| matches!(r, Resolution::Retrying { .. })));
        assert!(fx.controller.node_lost(&loss).await.is_empty());
        assert_eq!(fx.metrics.snapshot().node_lost_events, 2);

        for id in [a, b] {
            assert_eq!(fx.jobs.get(&id).await.unwrap().status, JobStatus::Retrying);
        }
    }

    #[tokio::test]
    async fn test_sweep_timeouts() {
        let fx = fixture(RetryPolicy::default()).await;
        let (job_id, _) = start(&fx, None, 10.0, "n2").await;
        assert!(fx.controller.sweep_timeouts(Duration::from_secs(60)).await.is_empty());

        fx.clock.advance(Duration::from_secs(61));
        let res = fx.controller.sweep_timeouts(Duration::from_secs(60)).await;
        assert_eq!(res.len(), 1);
        assert_eq!(fx.jobs.get(&job_id).await.unwrap().attempt_count, 1);
        assert_eq!(fx.metrics.snapshot().timeouts, 1);
    }

    #[tokio::test]
    async fn test_outcome_before_ack_counts() {
        let fx = fixture(RetryPolicy::default()).await;
        let job_id = fx
            .jobs
            .submit(JobSpec::new("train", "gpt2"), 10.0, SpeedPreference::Fast)
            .await
            .unwrap();
        fx.registry.reserve(&node("n1"), 1).await.unwrap();
        fx.jobs
            .commit_allocation(&Allocation {
                job_id,
                node_id: node("n1"),
                attempt: 1,
                units: 1,
                incarnation: 0,
                reputation: 0.5,
                projected_cost: 0.0,
                score: 0.0,
                address: String::new(),
            })
            .await
            .unwrap();

        let res = fx
            .controller
            .handle(OutcomeEvent::success(job_id, node("n1"), 1, 0.5))
            .await
            .unwrap();
        assert_eq!(res, Resolution::Completed);
        // Late ack for the settled attempt is stale
        assert!(fx.jobs.mark_running(&job_id, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let fx = fixture(RetryPolicy::default()).await;
        let err = fx
            .controller
            .handle(OutcomeEvent::success(JobId::new(), node("n1"), 1, 0.0))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::UnknownJob { .. }));
    }
}
