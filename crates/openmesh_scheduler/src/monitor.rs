//! Counters and read models for observability.
//!
//! Counters are plain atomics so the hot paths never wait on them.

use openmesh_core::{Job, JobStatus, Node, NodeId, NodeStatus, Timestamp, Transition};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Average reputation of active nodes below which the mesh is degraded
pub const MIN_HEALTHY_REPUTATION: f64 = 0.3;

/// Settled attempts per node
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeTally {
    /// Attempts that succeeded
    pub completed: u64,
    /// Attempts that failed, timed out or were lost
    pub failed: u64,
    /// Money billed for successful attempts
    pub earned: f64,
}

/// Scheduler counters
#[derive(Debug, Default)]
pub struct Metrics {
    allocations: AtomicU64,
    deferrals: AtomicU64,
    dispatch_rejections: AtomicU64,
    retries: AtomicU64,
    stale_events: AtomicU64,
    node_lost_events: AtomicU64,
    timeouts: AtomicU64,
    budget_aborts: AtomicU64,
    tallies: RwLock<HashMap<NodeId, NodeTally>>,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            #[doc = concat!("Increment `", stringify!($field), "`")]
            pub fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl Metrics {
    /// Create zeroed counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    counter! {
        record_allocation => allocations,
        record_deferral => deferrals,
        record_dispatch_rejection => dispatch_rejections,
        record_retry => retries,
        record_stale_event => stale_events,
        record_node_lost => node_lost_events,
        record_timeout => timeouts,
        record_budget_abort => budget_aborts,
    }

    /// Count a settled attempt against its node
    pub async fn record_attempt(&self, node_id: &NodeId, success: bool, billed: f64) {
        let mut tallies = self.tallies.write().await;
        let tally = tallies.entry(node_id.clone()).or_default();
        if success {
            tally.completed += 1;
            tally.earned += billed;
        } else {
            tally.failed += 1;
        }
    }

    /// Tally for one node
    pub async fn tally(&self, node_id: &NodeId) -> NodeTally {
        self.tallies
            .read()
            .await
            .get(node_id)
            .copied()
            .unwrap_or_default()
    }

    /// Point-in-time copy of the counters
    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            allocations: self.allocations.load(Ordering::Relaxed),
            deferrals: self.deferrals.load(Ordering::Relaxed),
            dispatch_rejections: self.dispatch_rejections.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            stale_events: self.stale_events.load(Ordering::Relaxed),
            node_lost_events: self.node_lost_events.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            budget_aborts: self.budget_aborts.load(Ordering::Relaxed),
        }
    }
}

/// Counter values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    /// Allocations committed
    pub allocations: u64,
    /// Allocation attempts deferred
    pub deferrals: u64,
    /// Dispatches refused by nodes
    pub dispatch_rejections: u64,
    /// Attempts scheduled for retry
    pub retries: u64,
    /// Outcome reports discarded as stale
    pub stale_events: u64,
    /// Attempts lost with their node
    pub node_lost_events: u64,
    /// Attempts timed out by the sweep
    pub timeouts: u64,
    /// Jobs aborted on budget
    pub budget_aborts: u64,
}

/// Aggregate view of the mesh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    /// Nodes per status
    pub nodes: BTreeMap<NodeStatus, usize>,
    /// Jobs per status
    pub jobs: BTreeMap<JobStatus, usize>,
    /// Known nodes
    pub total_nodes: usize,
    /// Known jobs
    pub total_jobs: usize,
    /// Mean reputation of nodes that are not retired
    pub average_reputation: f64,
    /// Mean compute score of nodes that are not retired
    pub average_compute_score: f64,
    /// Money spent across all jobs
    pub total_spent: f64,
    /// Scheduler counters
    pub counters: CounterSnapshot,
}

/// Overall health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Work can be placed
    Healthy,
    /// No active nodes or low trust across the pool
    Degraded,
}

/// Health summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Verdict
    pub status: HealthStatus,
    /// Active nodes
    pub active_nodes: usize,
    /// Mean reputation of active nodes
    pub average_reputation: f64,
    /// What is wrong, empty when healthy
    pub issues: Vec<String>,
    /// When the report was taken
    pub checked_at: Timestamp,
}

impl HealthReport {
    /// Judge the pool from its active nodes
    #[must_use]
    pub fn assess(active: &[Node], checked_at: Timestamp) -> Self {
        let mut issues = Vec::new();
        let average_reputation = mean(active.iter().map(|n| n.reputation));

        if active.is_empty() {
            issues.push("no active nodes".to_string());
        } else if average_reputation < MIN_HEALTHY_REPUTATION {
            issues.push(format!(
                "average reputation {:.2} below {:.2}",
                average_reputation, MIN_HEALTHY_REPUTATION
            ));
        }

        Self {
            status: if issues.is_empty() {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            active_nodes: active.len(),
            average_reputation,
            issues,
            checked_at,
        }
    }
}

/// Per-node view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    /// Node snapshot
    pub node: Node,
    /// Attempts in flight on the node
    pub active_jobs: usize,
    /// Settled attempts
    pub tally: NodeTally,
    /// Fraction of declared capacity in use
    pub utilization: f64,
}

/// Per-job view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMetrics {
    /// Job snapshot
    pub job: Job,
    /// Accepted transitions
    pub history: Vec<Transition>,
    /// End of the current backoff
    pub retry_at: Option<Timestamp>,
    /// Cancel waiting on the in-flight attempt
    pub cancel_requested: bool,
    /// Fraction of the budget spent
    pub budget_used: f64,
}

/// Arithmetic mean, zero for an empty input
pub(crate) fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 { 0.0 } else { sum / count as f64 }
}
