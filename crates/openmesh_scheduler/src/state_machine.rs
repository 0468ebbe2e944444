//! Job state machine.
//!
//! [`JobEntry`] is the only place a job's status changes. Every accepted
//! step is checked against the lifecycle edges, bumps the job's version
//! and is appended to its transition history. [`JobStore`] holds one lock
//! per job; the map lock is only held long enough to find the entry.

use crate::allocation::Allocation;
use crate::budget::{BudgetGuard, BudgetState};
use indexmap::IndexMap;
use openmesh_cluster::NodeLoss;
use openmesh_core::{
    Clock, Job, JobId, JobSpec, JobStatus, MeshError, MeshResult, NodeId, SpeedPreference,
    Timestamp, Transition,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// Capacity a finished attempt hands back to its node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    /// Node holding the reservation
    pub node_id: NodeId,
    /// Units to free
    pub units: u32,
}

/// Result of binding an allocation to its job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitResult {
    /// Job is now `allocated`
    Committed,
    /// A cancel arrived first; the job is `aborted`
    Cancelled,
}

/// Result of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Job moved to `aborted` right away
    Aborted,
    /// An attempt is in flight; the job aborts at its next step
    Deferred,
}

/// A job plus the scheduler's bookkeeping for it
#[derive(Debug, Clone)]
pub struct JobEntry {
    job: Job,
    cancel_requested: bool,
    retry_at: Option<Timestamp>,
    running_since: Option<Timestamp>,
    reserved_units: u32,
    incarnation: u64,
    history: Vec<Transition>,
}

impl JobEntry {
    fn new(job: Job) -> Self {
        Self {
            job,
            cancel_requested: false,
            retry_at: None,
            running_since: None,
            reserved_units: 0,
            incarnation: 0,
            history: Vec::new(),
        }
    }

    /// The job
    #[must_use]
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Whether a cancel is waiting for the in-flight attempt
    #[must_use]
    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    /// End of the current backoff, if any
    #[must_use]
    pub fn retry_at(&self) -> Option<Timestamp> {
        self.retry_at
    }

    /// When the current attempt started running
    #[must_use]
    pub fn running_since(&self) -> Option<Timestamp> {
        self.running_since
    }

    /// Accepted transitions, oldest first
    #[must_use]
    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    /// Whether the job may be offered to the allocation engine at `now`
    #[must_use]
    pub fn is_eligible(&self, now: Timestamp) -> bool {
        if self.cancel_requested {
            return false;
        }
        match self.job.status {
            JobStatus::Pending => true,
            JobStatus::Retrying => self.retry_at.is_none_or(|at| at <= now),
            _ => false,
        }
    }

    /// Move to `to`
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if the edge is not part of the lifecycle
    pub fn transition(
        &mut self,
        to: JobStatus,
        reason: impl Into<String>,
        now: Timestamp,
    ) -> MeshResult<()> {
        let from = self.job.status;
        if !from.can_transition_to(to) {
            return Err(MeshError::InvalidTransition {
                job_id: self.job.job_id,
                from,
                to,
            });
        }
        let reason = reason.into();

        self.job.status = to;
        self.job.version = self.job.version.next();
        self.job.updated_at = now;

        match to {
            JobStatus::Running => self.running_since = Some(now),
            JobStatus::Allocated => {
                self.retry_at = None;
                self.running_since = None;
            }
            _ => self.running_since = None,
        }
        if !to.holds_capacity() {
            self.reserved_units = 0;
        }
        if to == JobStatus::Pending {
            self.job.assigned_node_id = None;
        }
        if matches!(
            to,
            JobStatus::Failed | JobStatus::AbortedBudget | JobStatus::Aborted
        ) {
            self.job.error_message = Some(reason.clone());
        }

        tracing::info!(
            job_id = %self.job.job_id,
            %from,
            %to,
            version = self.job.version.as_u64(),
            attempt = self.job.current_attempt,
            reason = %reason,
            "Job transition"
        );

        self.history.push(Transition {
            from,
            to,
            version: self.job.version,
            at: now,
            reason,
        });
        Ok(())
    }

    /// Check that a report belongs to the attempt in flight
    ///
    /// # Errors
    ///
    /// Returns `StaleEvent` for an old attempt, another node, or a job that
    /// holds no capacity (including terminal jobs)
    pub fn check_attempt(&self, node_id: &NodeId, attempt: u32) -> MeshResult<()> {
        let current = self.job.current_attempt;
        let same_node = self.job.assigned_node_id.as_ref() == Some(node_id);
        if attempt != current || !same_node || !self.job.status.holds_capacity() {
            return Err(MeshError::StaleEvent {
                job_id: self.job.job_id,
                attempt,
                current,
            });
        }
        Ok(())
    }

    /// Capacity held by the attempt in flight
    #[must_use]
    pub fn release(&self) -> Option<Release> {
        if !self.job.status.holds_capacity() {
            return None;
        }
        self.job.assigned_node_id.as_ref().map(|node_id| Release {
            node_id: node_id.clone(),
            units: self.reserved_units,
        })
    }

    /// Count one failed attempt and return the new total
    pub fn record_failure(&mut self) -> u32 {
        self.job.attempt_count = self.job.attempt_count.saturating_add(1);
        self.job.attempt_count
    }

    /// Charge an attempt's cost through the guard
    ///
    /// # Errors
    ///
    /// Returns `BudgetExceeded` if the cost does not fit; nothing is recorded
    pub fn record_spend(&mut self, guard: &BudgetGuard, cost: f64) -> MeshResult<BudgetState> {
        guard.record_spend(&mut self.job, cost)
    }

    /// Wait before the next allocation
    pub fn schedule_retry(&mut self, at: Timestamp) {
        self.retry_at = Some(at);
    }
}

/// Owner of every job's lifecycle
#[derive(Debug)]
pub struct JobStore {
    jobs: RwLock<IndexMap<JobId, Arc<Mutex<JobEntry>>>>,
    clock: Arc<dyn Clock>,
}

impl JobStore {
    /// Create an empty store
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: RwLock::new(IndexMap::new()),
            clock,
        }
    }

    async fn entry(&self, job_id: &JobId) -> MeshResult<Arc<Mutex<JobEntry>>> {
        self.jobs
            .read()
            .await
            .get(job_id)
            .cloned()
            .ok_or(MeshError::UnknownJob { job_id: *job_id })
    }

    async fn entries(&self) -> Vec<Arc<Mutex<JobEntry>>> {
        self.jobs.read().await.values().cloned().collect()
    }

    /// Lock one job for a compound update
    ///
    /// # Errors
    ///
    /// Returns `UnknownJob` if the job does not exist
    pub async fn lock(&self, job_id: &JobId) -> MeshResult<OwnedMutexGuard<JobEntry>> {
        Ok(self.entry(job_id).await?.lock_owned().await)
    }

    /// Create a job in `pending`
    ///
    /// # Errors
    ///
    /// Returns a validation error for a bad budget or capacity
    pub async fn submit(
        &self,
        spec: JobSpec,
        max_budget: f64,
        speed_preference: SpeedPreference,
    ) -> MeshResult<JobId> {
        let job = Job::new(spec, max_budget, speed_preference, self.clock.now())?;
        let job_id = job.job_id;
        tracing::info!(
            job_id = %job_id,
            max_budget,
            %speed_preference,
            model = %job.spec.model,
            "Job submitted"
        );
        self.jobs
            .write()
            .await
            .insert(job_id, Arc::new(Mutex::new(JobEntry::new(job))));
        Ok(job_id)
    }

    /// Job snapshot
    pub async fn get(&self, job_id: &JobId) -> Option<Job> {
        let entry = self.entry(job_id).await.ok()?;
        let entry = entry.lock().await;
        Some(entry.job.clone())
    }

    /// Full entry snapshot including history
    pub async fn snapshot(&self, job_id: &JobId) -> Option<JobEntry> {
        let entry = self.entry(job_id).await.ok()?;
        let entry = entry.lock().await;
        Some(entry.clone())
    }

    /// Jobs the allocation engine should consider at `now`, in submission order
    pub async fn eligible(&self, now: Timestamp) -> Vec<Job> {
        let mut out = Vec::new();
        for entry in self.entries().await {
            let entry = entry.lock().await;
            if entry.is_eligible(now) {
                out.push(entry.job.clone());
            }
        }
        out
    }

    /// Bind an allocation to its job
    ///
    /// The allocation was computed from a snapshot; it only applies if the
    /// job is still waiting for exactly that attempt.
    ///
    /// # Errors
    ///
    /// Returns `StaleEvent` if the job moved on since the snapshot, or
    /// `UnknownJob`
    pub async fn commit_allocation(&self, allocation: &Allocation) -> MeshResult<CommitResult> {
        let mut entry = self.lock(&allocation.job_id).await?;
        let now = self.clock.now();
        let current = entry.job.current_attempt;

        if !entry.job.status.awaits_allocation() || allocation.attempt != current + 1 {
            return Err(MeshError::StaleEvent {
                job_id: allocation.job_id,
                attempt: allocation.attempt,
                current,
            });
        }
        if entry.cancel_requested {
            entry.transition(JobStatus::Aborted, "cancelled before allocation", now)?;
            return Ok(CommitResult::Cancelled);
        }

        entry.transition(
            JobStatus::Allocated,
            format!("allocated to {}", allocation.node_id),
            now,
        )?;
        entry.job.current_attempt = allocation.attempt;
        entry.job.assigned_node_id = Some(allocation.node_id.clone());
        entry.reserved_units = allocation.units;
        entry.incarnation = allocation.incarnation;
        Ok(CommitResult::Committed)
    }

    /// Record the dispatch acknowledgement for an attempt
    ///
    /// Returns the capacity to free if a pending cancel aborted the job
    /// instead. A repeat for an attempt already running is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `StaleEvent` if the attempt is no longer current
    pub async fn mark_running(&self, job_id: &JobId, attempt: u32) -> MeshResult<Option<Release>> {
        let mut entry = self.lock(job_id).await?;
        let now = self.clock.now();
        let current = entry.job.current_attempt;
        if attempt != current || !entry.job.status.holds_capacity() {
            return Err(MeshError::StaleEvent {
                job_id: *job_id,
                attempt,
                current,
            });
        }
        if entry.job.status == JobStatus::Running {
            return Ok(None);
        }
        if entry.cancel_requested {
            let release = entry.release();
            entry.transition(JobStatus::Aborted, "cancelled before dispatch ack", now)?;
            return Ok(release);
        }
        entry.transition(JobStatus::Running, "dispatch accepted", now)?;
        Ok(None)
    }

    /// Put a job back in line after its node refused the attempt
    ///
    /// Returns the capacity the refused attempt held.
    ///
    /// # Errors
    ///
    /// Returns `StaleEvent` if the attempt is no longer current or no
    /// longer `allocated`
    pub async fn requeue_rejected(
        &self,
        job_id: &JobId,
        attempt: u32,
        reason: &str,
    ) -> MeshResult<Option<Release>> {
        let mut entry = self.lock(job_id).await?;
        let now = self.clock.now();
        let current = entry.job.current_attempt;
        if attempt != current || entry.job.status != JobStatus::Allocated {
            return Err(MeshError::StaleEvent {
                job_id: *job_id,
                attempt,
                current,
            });
        }
        let release = entry.release();
        if entry.cancel_requested {
            entry.transition(JobStatus::Aborted, "cancelled after dispatch rejected", now)?;
        } else {
            entry.transition(
                JobStatus::Pending,
                format!("dispatch rejected: {}", reason),
                now,
            )?;
        }
        Ok(release)
    }

    /// Cancel a job
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` for a terminal job, or `UnknownJob`
    pub async fn cancel(&self, job_id: &JobId) -> MeshResult<CancelOutcome> {
        let mut entry = self.lock(job_id).await?;
        let now = self.clock.now();
        match entry.job.status {
            JobStatus::Pending | JobStatus::Retrying => {
                entry.transition(JobStatus::Aborted, "cancelled", now)?;
                Ok(CancelOutcome::Aborted)
            }
            JobStatus::Allocated | JobStatus::Running => {
                entry.cancel_requested = true;
                tracing::info!(job_id = %job_id, status = %entry.job.status, "Cancel deferred until attempt settles");
                Ok(CancelOutcome::Deferred)
            }
            from => Err(MeshError::InvalidTransition {
                job_id: *job_id,
                from,
                to: JobStatus::Aborted,
            }),
        }
    }

    /// Make a waiting job eligible on the next tick
    ///
    /// # Errors
    ///
    /// Returns `NotRetryable` unless the job is `retrying` or `pending`
    pub async fn retry(&self, job_id: &JobId) -> MeshResult<()> {
        let mut entry = self.lock(job_id).await?;
        match entry.job.status {
            JobStatus::Retrying | JobStatus::Pending if !entry.cancel_requested => {
                entry.retry_at = None;
                tracing::info!(job_id = %job_id, "Backoff cleared by retry request");
                Ok(())
            }
            status => Err(MeshError::NotRetryable {
                job_id: *job_id,
                status,
            }),
        }
    }

    /// In-flight attempts on a node as `(job, attempt)`
    pub async fn in_flight_on(&self, node_id: &NodeId) -> Vec<(JobId, u32)> {
        let mut out = Vec::new();
        for entry in self.entries().await {
            let entry = entry.lock().await;
            if entry.job.status.holds_capacity()
                && entry.job.assigned_node_id.as_ref() == Some(node_id)
            {
                out.push((entry.job.job_id, entry.job.current_attempt));
            }
        }
        out
    }

    /// In-flight attempts left stranded by a node leaving service
    ///
    /// Attempts placed on a later incarnation of the node are not included.
    pub async fn stranded_by(&self, loss: &NodeLoss) -> Vec<(JobId, u32)> {
        let mut out = Vec::new();
        for entry in self.entries().await {
            let entry = entry.lock().await;
            if entry.job.status.holds_capacity()
                && entry.job.assigned_node_id.as_ref() == Some(&loss.node_id)
                && loss.strands(entry.incarnation)
            {
                out.push((entry.job.job_id, entry.job.current_attempt));
            }
        }
        out
    }

    /// Running attempts started more than `timeout` before `now`
    pub async fn overdue(&self, now: Timestamp, timeout: Duration) -> Vec<(JobId, NodeId, u32)> {
        let mut out = Vec::new();
        for entry in self.entries().await {
            let entry = entry.lock().await;
            let Some(since) = entry.running_since else {
                continue;
            };
            if entry.job.status != JobStatus::Running || now.saturating_since(since) <= timeout {
                continue;
            }
            if let Some(node_id) = entry.job.assigned_node_id.clone() {
                out.push((entry.job.job_id, node_id, entry.job.current_attempt));
            }
        }
        out
    }

    /// Snapshot of every job, in submission order
    pub async fn list(&self) -> Vec<Job> {
        let mut out = Vec::new();
        for entry in self.entries().await {
            out.push(entry.lock().await.job.clone());
        }
        out
    }

    /// Job counts per status; every status is present
    pub async fn counts(&self) -> BTreeMap<JobStatus, usize> {
        let mut counts: BTreeMap<JobStatus, usize> =
            JobStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for job in self.list().await {
            *counts.entry(job.status).or_default() += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openmesh_core::{ManualClock, Version};

    fn store() -> (JobStore, ManualClock) {
        let clock = ManualClock::new(Timestamp::from_millis(10_000));
        (JobStore::new(Arc::new(clock.clone())), clock)
    }

    fn node(name: &str) -> NodeId {
        NodeId::new(name).unwrap()
    }

    fn allocation(job: &Job, node_name: &str) -> Allocation {
        Allocation {
            job_id: job.job_id,
            node_id: node(node_name),
            attempt: job.current_attempt + 1,
            units: 1,
            incarnation: 0,
            reputation: 0.5,
            projected_cost: 1.0,
            score: 0.5,
            address: "10.0.0.1:7000".to_string(),
        }
    }

    async fn submitted(store: &JobStore) -> JobId {
        store
            .submit(JobSpec::new("inference", "phi-3"), 10.0, SpeedPreference::Fast)
            .await
            .unwrap()
    }

    async fn allocated(store: &JobStore, node_name: &str) -> JobId {
        let id = submitted(store).await;
        let job = store.get(&id).await.unwrap();
        store.commit_allocation(&allocation(&job, node_name)).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_submit_and_get() {
        let (store, _) = store();
        let id = submitted(&store).await;
        let job = store.get(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.created_at.as_millis(), 10_000);
        assert!(store.get(&JobId::new()).await.is_none());
    }

    #[tokio::test]
    async fn test_commit_allocation() {
        let (store, _) = store();
        let id = allocated(&store, "n1").await;
        let entry = store.snapshot(&id).await.unwrap();
        assert_eq!(entry.job().status, JobStatus::Allocated);
        assert_eq!(entry.job().current_attempt, 1);
        assert_eq!(entry.job().version, Version::from_raw(1));
        assert_eq!(
            entry.release(),
            Some(Release {
                node_id: node("n1"),
                units: 1
            })
        );
        assert_eq!(entry.history().len(), 1);
    }

    #[tokio::test]
    async fn test_commit_with_stale_snapshot() {
        let (store, _) = store();
        let id = submitted(&store).await;
        let snapshot = store.get(&id).await.unwrap();
        store.commit_allocation(&allocation(&snapshot, "n1")).await.unwrap();

        let err = store
            .commit_allocation(&allocation(&snapshot, "n2"))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::StaleEvent { .. }));
    }

    #[tokio::test]
    async fn test_mark_running_idempotent() {
        let (store, _) = store();
        let id = allocated(&store, "n1").await;
        assert_eq!(store.mark_running(&id, 1).await.unwrap(), None);
        assert_eq!(store.mark_running(&id, 1).await.unwrap(), None);
        let entry = store.snapshot(&id).await.unwrap();
        assert_eq!(entry.job().status, JobStatus::Running);
        assert!(entry.running_since().is_some());
        assert!(store.mark_running(&id, 0).await.is_err());
    }

    #[tokio::test]
    async fn test_requeue_rejected_returns_capacity() {
        let (store, _) = store();
        let id = allocated(&store, "n1").await;
        let release = store.requeue_rejected(&id, 1, "busy").await.unwrap();
        assert_eq!(release.map(|r| r.node_id), Some(node("n1")));

        let job = store.get(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.assigned_node_id, None);
        assert_eq!(job.current_attempt, 1);
        assert_eq!(job.attempt_count, 0);

        // Second report for the same attempt is stale
        assert!(store.requeue_rejected(&id, 1, "busy").await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_pending_aborts_now() {
        let (store, _) = store();
        let id = submitted(&store).await;
        assert_eq!(store.cancel(&id).await.unwrap(), CancelOutcome::Aborted);
        assert_eq!(store.get(&id).await.unwrap().status, JobStatus::Aborted);

        let err = store.cancel(&id).await.unwrap_err();
        assert!(matches!(err, MeshError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_cancel_allocated_applies_on_ack() {
        let (store, _) = store();
        let id = allocated(&store, "n1").await;
        assert_eq!(store.cancel(&id).await.unwrap(), CancelOutcome::Deferred);
        assert!(store.eligible(Timestamp::from_millis(u64::MAX)).await.is_empty());

        let release = store.mark_running(&id, 1).await.unwrap();
        assert!(release.is_some());
        assert_eq!(store.get(&id).await.unwrap().status, JobStatus::Aborted);
    }

    #[tokio::test]
    async fn test_cancel_before_commit() {
        let (store, _) = store();
        let id = submitted(&store).await;
        let snapshot = store.get(&id).await.unwrap();
        // Cancel lands between the snapshot and the commit
        store.lock(&id).await.unwrap().cancel_requested = true;
        let result = store.commit_allocation(&allocation(&snapshot, "n1")).await.unwrap();
        assert_eq!(result, CommitResult::Cancelled);
        assert_eq!(store.get(&id).await.unwrap().status, JobStatus::Aborted);
    }

    #[tokio::test]
    async fn test_retry_rules() {
        let (store, clock) = store();
        let id = allocated(&store, "n1").await;
        assert!(matches!(
            store.retry(&id).await.unwrap_err(),
            MeshError::NotRetryable {
                status: JobStatus::Allocated,
                ..
            }
        ));

        store.mark_running(&id, 1).await.unwrap();
        {
            let mut entry = store.lock(&id).await.unwrap();
            entry.record_failure();
            entry.transition(JobStatus::Retrying, "boom", clock.now()).unwrap();
            entry.schedule_retry(clock.now().saturating_add(Duration::from_secs(30)));
        }
        assert!(store.eligible(clock.now()).await.is_empty());
        store.retry(&id).await.unwrap();
        assert_eq!(store.eligible(clock.now()).await.len(), 1);
    }

    #[tokio::test]
    async fn test_overdue_and_in_flight() {
        let (store, clock) = store();
        let running = allocated(&store, "n1").await;
        store.mark_running(&running, 1).await.unwrap();
        let waiting = allocated(&store, "n1").await;

        let mut in_flight = store.in_flight_on(&node("n1")).await;
        in_flight.sort();
        let mut expected = vec![(running, 1), (waiting, 1)];
        expected.sort();
        assert_eq!(in_flight, expected);
        assert!(store.in_flight_on(&node("n2")).await.is_empty());

        clock.advance(Duration::from_secs(61));
        let overdue = store.overdue(clock.now(), Duration::from_secs(60)).await;
        assert_eq!(overdue, vec![(running, node("n1"), 1)]);
    }

    #[tokio::test]
    async fn test_stranded_by_skips_later_incarnation() {
        let (store, _) = store();
        let old = allocated(&store, "n1").await;
        let snapshot = store.get(&submitted(&store).await).await.unwrap();
        let mut later = allocation(&snapshot, "n1");
        later.incarnation = 1;
        store.commit_allocation(&later).await.unwrap();

        let loss = NodeLoss {
            node_id: node("n1"),
            incarnation: 0,
        };
        assert_eq!(store.stranded_by(&loss).await, vec![(old, 1)]);
        assert_eq!(store.in_flight_on(&node("n1")).await.len(), 2);
    }

    #[tokio::test]
    async fn test_terminal_rejects_transitions() {
        let (store, clock) = store();
        let id = submitted(&store).await;
        store.cancel(&id).await.unwrap();
        let mut entry = store.lock(&id).await.unwrap();
        for to in JobStatus::ALL {
            assert!(entry.transition(to, "again", clock.now()).is_err());
        }
        assert_eq!(entry.history().len(), 1);
    }

    #[tokio::test]
    async fn test_counts() {
        let (store, _) = store();
        submitted(&store).await;
        allocated(&store, "n1").await;
        let counts = store.counts().await;
        assert_eq!(counts[&JobStatus::Pending], 1);
        assert_eq!(counts[&JobStatus::Allocated], 1);
        assert_eq!(counts[&JobStatus::Completed], 0);
    }
}
