//! Reputation and cost-rate provider.
//!
//! The scheduler never owns trust scores. It asks a [`ReputationProvider`]
//! for a node's score at allocation time and reports every attempt outcome
//! back to it.

use async_trait::async_trait;
use openmesh_core::{Clock, MeshError, MeshResult, NodeId, OutcomeKind, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

/// What the provider knows about a node
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodeScore {
    /// Trust score in [0,1]
    pub reputation: f64,
    /// Estimated price per second of work
    pub estimated_cost_rate: f64,
}

/// Source of trust scores and prices
#[async_trait]
pub trait ReputationProvider: Send + Sync {
    /// Current score for a node
    ///
    /// # Errors
    ///
    /// Returns `Collaborator` if the provider cannot answer
    async fn score(&self, node_id: &NodeId) -> MeshResult<NodeScore>;

    /// Report how an attempt on a node ended
    ///
    /// # Errors
    ///
    /// Returns `Collaborator` if the report could not be delivered
    async fn report_outcome(&self, node_id: &NodeId, outcome: OutcomeKind) -> MeshResult<()>;
}

/// Tuning for the in-memory provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationConfig {
    /// Score of a node never seen before
    pub initial: f64,
    /// Added on success
    pub success_delta: f64,
    /// Added on failure, timeout or loss
    pub failure_delta: f64,
    /// Price per second for nodes without an explicit rate
    pub default_cost_rate: f64,
    /// Number of score changes kept for inspection
    pub history_limit: usize,
}

impl ReputationConfig {
    /// Check the tuning is usable
    ///
    /// # Errors
    ///
    /// Returns `Config` for out-of-range values
    pub fn validate(&self) -> MeshResult<()> {
        if !(0.0..=1.0).contains(&self.initial) {
            return Err(MeshError::Config(format!(
                "reputation.initial must be within [0, 1], got {}",
                self.initial
            )));
        }
        for (name, delta) in [
            ("success_delta", self.success_delta),
            ("failure_delta", self.failure_delta),
        ] {
            if !delta.is_finite() {
                return Err(MeshError::Config(format!(
                    "reputation.{} must be a finite number, got {}",
                    name, delta
                )));
            }
        }
        if !self.default_cost_rate.is_finite() || self.default_cost_rate < 0.0 {
            return Err(MeshError::Config(format!(
                "reputation.default_cost_rate must be non-negative, got {}",
                self.default_cost_rate
            )));
        }
        Ok(())
    }
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            initial: 0.5,
            success_delta: 0.01,
            failure_delta: -0.05,
            default_cost_rate: 0.1 / 60.0,
            history_limit: 1_024,
        }
    }
}

/// One recorded score change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReputationChange {
    /// Node affected
    pub node_id: NodeId,
    /// Applied delta after clamping
    pub delta: f64,
    /// Score after the change
    pub reputation: f64,
    /// Outcome that caused it
    pub reason: OutcomeKind,
    /// When it happened
    pub at: Timestamp,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    reputation: f64,
    cost_rate: Option<f64>,
}

/// Provider that keeps scores in process
#[derive(Debug)]
pub struct InMemoryReputation {
    config: ReputationConfig,
    entries: RwLock<HashMap<NodeId, Entry>>,
    history: RwLock<VecDeque<ReputationChange>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryReputation {
    /// Create an empty provider
    #[must_use]
    pub fn new(config: ReputationConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::new()),
            clock,
        }
    }

    fn fresh(&self) -> Entry {
        Entry {
            reputation: self.config.initial,
            cost_rate: None,
        }
    }

    /// Override a node's price per second
    pub async fn set_cost_rate(&self, node_id: &NodeId, rate: f64) {
        let fresh = self.fresh();
        let mut entries = self.entries.write().await;
        entries.entry(node_id.clone()).or_insert(fresh).cost_rate = Some(rate.max(0.0));
    }

    /// Override a node's score
    pub async fn set_reputation(&self, node_id: &NodeId, reputation: f64) {
        let fresh = self.fresh();
        let mut entries = self.entries.write().await;
        entries.entry(node_id.clone()).or_insert(fresh).reputation = reputation.clamp(0.0, 1.0);
    }

    /// Recorded score changes, oldest first
    pub async fn history(&self) -> Vec<ReputationChange> {
        self.history.read().await.iter().cloned().collect()
    }

    fn delta_for(&self, outcome: OutcomeKind) -> f64 {
        if outcome.is_success() {
            self.config.success_delta
        } else {
            self.config.failure_delta
        }
    }
}

#[async_trait]
impl ReputationProvider for InMemoryReputation {
    async fn score(&self, node_id: &NodeId) -> MeshResult<NodeScore> {
        let entry = self
            .entries
            .read()
            .await
            .get(node_id)
            .copied()
            .unwrap_or_else(|| self.fresh());
        Ok(NodeScore {
            reputation: entry.reputation,
            estimated_cost_rate: entry.cost_rate.unwrap_or(self.config.default_cost_rate),
        })
    }

    async fn report_outcome(&self, node_id: &NodeId, outcome: OutcomeKind) -> MeshResult<()> {
        let fresh = self.fresh();
        let (before, after) = {
            let mut entries = self.entries.write().await;
            let entry = entries.entry(node_id.clone()).or_insert(fresh);
            let before = entry.reputation;
            entry.reputation = (before + self.delta_for(outcome)).clamp(0.0, 1.0);
            (before, entry.reputation)
        };

        tracing::debug!(node_id = %node_id, %outcome, reputation = after, "Reputation updated");

        let change = ReputationChange {
            node_id: node_id.clone(),
            delta: after - before,
            reputation: after,
            reason: outcome,
            at: self.clock.now(),
        };
        let mut history = self.history.write().await;
        history.push_back(change);
        while history.len() > self.config.history_limit {
            history.pop_front();
        }
        Ok(())
    }
}
