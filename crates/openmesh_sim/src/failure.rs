//! Failure injection for exercising fault tolerance.

use crate::seed::SimSeed;
use openmesh_core::{MeshError, MeshResult, NodeId, OutcomeKind};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, RwLock};

/// How often things go wrong
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailureModel {
    /// Chance an attempt ends in failure
    pub failure_probability: f64,
    /// Chance an attempt ends in timeout
    pub timeout_probability: f64,
    /// Chance a node refuses a dispatch
    pub reject_probability: f64,
    /// Chance per tick that a live node crashes
    pub crash_probability: f64,
    /// Chance per tick that a crashed node comes back
    pub recover_probability: f64,
    /// Crashes to inject at most
    pub max_crashes: usize,
}

impl FailureModel {
    /// A model where nothing fails
    #[must_use]
    pub fn reliable() -> Self {
        Self::default()
    }

    /// A noisy model with every failure kind enabled
    #[must_use]
    pub fn chaotic() -> Self {
        Self {
            failure_probability: 0.1,
            timeout_probability: 0.05,
            reject_probability: 0.02,
            crash_probability: 0.01,
            recover_probability: 0.2,
            max_crashes: usize::MAX,
        }
    }

    /// Set attempt failure probability
    #[must_use]
    pub fn with_failure_probability(mut self, p: f64) -> Self {
        self.failure_probability = p;
        self
    }

    /// Set node crash and recovery probabilities
    #[must_use]
    pub fn with_crashes(mut self, crash: f64, recover: f64) -> Self {
        self.crash_probability = crash;
        self.recover_probability = recover;
        self
    }

    /// Set max crashes
    #[must_use]
    pub fn with_max_crashes(mut self, max: usize) -> Self {
        self.max_crashes = max;
        self
    }

    /// Check every probability is in [0, 1]
    ///
    /// # Errors
    ///
    /// Returns `Config` naming the first bad probability
    pub fn validate(&self) -> MeshResult<()> {
        for (name, p) in [
            ("failure_probability", self.failure_probability),
            ("timeout_probability", self.timeout_probability),
            ("reject_probability", self.reject_probability),
            ("crash_probability", self.crash_probability),
            ("recover_probability", self.recover_probability),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(MeshError::Config(format!(
                    "failure.{} must be within [0, 1], got {}",
                    name, p
                )));
            }
        }
        if self.failure_probability + self.timeout_probability > 1.0 {
            return Err(MeshError::Config(
                "failure.failure_probability + failure.timeout_probability exceeds 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Draw how an attempt ends
    pub fn attempt_outcome(&self, rng: &mut ChaCha8Rng) -> OutcomeKind {
        let roll = rng.r#gen::<f64>();
        if roll < self.failure_probability {
            OutcomeKind::Failure
        } else if roll < self.failure_probability + self.timeout_probability {
            OutcomeKind::Timeout
        } else {
            OutcomeKind::Success
        }
    }

    /// Draw whether a dispatch is refused
    pub fn rejects(&self, rng: &mut ChaCha8Rng) -> bool {
        roll(rng, self.reject_probability)
    }
}

impl Default for FailureModel {
    fn default() -> Self {
        Self {
            failure_probability: 0.0,
            timeout_probability: 0.0,
            reject_probability: 0.0,
            crash_probability: 0.0,
            recover_probability: 0.0,
            max_crashes: usize::MAX,
        }
    }
}

fn roll(rng: &mut ChaCha8Rng, probability: f64) -> bool {
    probability > 0.0 && rng.r#gen::<f64>() < probability
}

/// Nodes that changed state in one churn step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Churn {
    /// Nodes that went down
    pub crashed: Vec<NodeId>,
    /// Nodes that came back
    pub recovered: Vec<NodeId>,
}

/// Crashes and recovers nodes
///
/// A crashed node stops heartbeating and loses whatever it was running.
#[derive(Debug)]
pub struct CrashInjector {
    rng: Mutex<ChaCha8Rng>,
    crashed: RwLock<BTreeSet<NodeId>>,
    model: FailureModel,
    crashes: AtomicUsize,
}

impl CrashInjector {
    /// Create an injector
    #[must_use]
    pub fn new(seed: &SimSeed, model: FailureModel) -> Self {
        Self {
            rng: Mutex::new(seed.derive("crash").rng()),
            crashed: RwLock::new(BTreeSet::new()),
            model,
            crashes: AtomicUsize::new(0),
        }
    }

    /// Whether the node is down
    pub async fn is_crashed(&self, node_id: &NodeId) -> bool {
        self.crashed.read().await.contains(node_id)
    }

    /// Take a node down, false if it already was
    pub async fn crash(&self, node_id: &NodeId) -> bool {
        let inserted = self.crashed.write().await.insert(node_id.clone());
        if inserted {
            self.crashes.fetch_add(1, Ordering::Relaxed);
            tracing::info!(node_id = %node_id, "Injected node crash");
        }
        inserted
    }

    /// Bring a node back, false if it was not down
    pub async fn recover(&self, node_id: &NodeId) -> bool {
        let removed = self.crashed.write().await.remove(node_id);
        if removed {
            tracing::info!(node_id = %node_id, "Node recovered");
        }
        removed
    }

    /// Nodes currently down
    pub async fn crashed_nodes(&self) -> Vec<NodeId> {
        self.crashed.read().await.iter().cloned().collect()
    }

    /// Crashes injected so far
    #[must_use]
    pub fn crash_count(&self) -> usize {
        self.crashes.load(Ordering::Relaxed)
    }

    /// Roll crash or recovery for every node, in the given order
    pub async fn step(&self, nodes: &[NodeId]) -> Churn {
        let mut churn = Churn::default();
        let mut rng = self.rng.lock().await;
        for node_id in nodes {
            if self.is_crashed(node_id).await {
                if roll(&mut rng, self.model.recover_probability) && self.recover(node_id).await {
                    churn.recovered.push(node_id.clone());
                }
            } else if self.crash_count() < self.model.max_crashes
                && roll(&mut rng, self.model.crash_probability)
                && self.crash(node_id).await
            {
                churn.crashed.push(node_id.clone());
            }
        }
        churn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<NodeId> {
        (0..n)
            .map(|i| NodeId::new(format!("sim-{i}")).unwrap())
            .collect()
    }

    #[test]
    fn test_validate() {
        assert!(FailureModel::reliable().validate().is_ok());
        assert!(FailureModel::chaotic().validate().is_ok());
        assert!(
            FailureModel::default()
                .with_failure_probability(1.5)
                .validate()
                .is_err()
        );
        let mut model = FailureModel::default().with_failure_probability(0.7);
        model.timeout_probability = 0.5;
        assert!(matches!(model.validate(), Err(MeshError::Config(_))));
    }

    #[test]
    fn test_attempt_outcome_extremes() {
        let mut rng = SimSeed::new(1).rng();
        let reliable = FailureModel::reliable();
        let doomed = FailureModel::default().with_failure_probability(1.0);
        for _ in 0..100 {
            assert_eq!(reliable.attempt_outcome(&mut rng), OutcomeKind::Success);
            assert_eq!(doomed.attempt_outcome(&mut rng), OutcomeKind::Failure);
            assert!(!reliable.rejects(&mut rng));
        }
    }

    #[tokio::test]
    async fn test_crash_and_recover() {
        let injector = CrashInjector::new(&SimSeed::default(), FailureModel::reliable());
        let node = NodeId::new("n1").unwrap();

        assert!(injector.crash(&node).await);
        assert!(!injector.crash(&node).await);
        assert!(injector.is_crashed(&node).await);
        assert_eq!(injector.crash_count(), 1);

        assert!(injector.recover(&node).await);
        assert!(!injector.recover(&node).await);
        assert!(injector.crashed_nodes().await.is_empty());
    }

    #[tokio::test]
    async fn test_step_respects_max_crashes() {
        let model = FailureModel::reliable().with_crashes(1.0, 0.0).with_max_crashes(2);
        let injector = CrashInjector::new(&SimSeed::default(), model);
        let nodes = ids(5);

        let churn = injector.step(&nodes).await;
        assert_eq!(churn.crashed, nodes[..2].to_vec());
        assert!(injector.step(&nodes).await.crashed.is_empty());
        assert_eq!(injector.crash_count(), 2);
    }

    #[tokio::test]
    async fn test_step_recovers() {
        let model = FailureModel::reliable().with_crashes(0.0, 1.0);
        let injector = CrashInjector::new(&SimSeed::default(), model);
        let nodes = ids(2);
        injector.crash(&nodes[1]).await;

        let churn = injector.step(&nodes).await;
        assert!(churn.crashed.is_empty());
        assert_eq!(churn.recovered, vec![nodes[1].clone()]);
    }

    #[tokio::test]
    async fn test_step_reproducible() {
        let model = FailureModel::chaotic().with_crashes(0.3, 0.3);
        let nodes = ids(8);
        let a = CrashInjector::new(&SimSeed::new(9), model.clone());
        let b = CrashInjector::new(&SimSeed::new(9), model);
        for _ in 0..10 {
            assert_eq!(a.step(&nodes).await, b.step(&nodes).await);
        }
    }
}
