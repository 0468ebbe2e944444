//! Simulation harness driving a control plane on a manual clock.

use crate::executor::{SimExecutor, WorkloadModel};
use crate::failure::{CrashInjector, FailureModel};
use crate::seed::SimSeed;
use openmesh_cluster::InMemoryReputation;
use openmesh_core::{
    Clock, JobId, JobSpec, JobStatus, ManualClock, MeshError, MeshResult, NodeDescriptor, NodeId,
    SpeedPreference, Telemetry, Timestamp,
};
use openmesh_scheduler::{ControlPlane, MeshConfig, Stats};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Simulated wall clock start, fixed so runs are reproducible
const EPOCH: Timestamp = Timestamp::from_millis(1_700_000_000_000);

/// Simulation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Seed for every random draw
    pub seed: u64,
    /// Nodes to register
    pub nodes: usize,
    /// Jobs to submit
    pub jobs: usize,
    /// Ticks to run at most
    pub max_ticks: u64,
    /// Simulated time per tick
    pub tick_ms: u64,
    /// Budget of every job
    pub job_budget: f64,
    /// Smallest node capacity
    pub min_capacity: u32,
    /// Largest node capacity
    pub max_capacity: u32,
    /// What goes wrong
    pub failures: FailureModel,
    /// How long attempts run and what they cost
    pub workload: WorkloadModel,
}

impl SimConfig {
    /// Create a config for a seed
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            ..Self::default()
        }
    }

    /// Set node count
    #[must_use]
    pub fn with_nodes(mut self, nodes: usize) -> Self {
        self.nodes = nodes;
        self
    }

    /// Set job count
    #[must_use]
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs;
        self
    }

    /// Set max ticks
    #[must_use]
    pub fn with_max_ticks(mut self, max: u64) -> Self {
        self.max_ticks = max;
        self
    }

    /// Give every node the same capacity
    #[must_use]
    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.min_capacity = capacity;
        self.max_capacity = capacity;
        self
    }

    /// Set failure model
    #[must_use]
    pub fn with_failures(mut self, failures: FailureModel) -> Self {
        self.failures = failures;
        self
    }

    /// Set workload model
    #[must_use]
    pub fn with_workload(mut self, workload: WorkloadModel) -> Self {
        self.workload = workload;
        self
    }

    /// Check the config is runnable
    ///
    /// # Errors
    ///
    /// Returns `Config` naming the first invalid field
    pub fn validate(&self) -> MeshResult<()> {
        if self.tick_ms == 0 {
            return Err(MeshError::Config("sim.tick_ms must be greater than zero".to_string()));
        }
        if self.min_capacity == 0 || self.min_capacity > self.max_capacity {
            return Err(MeshError::Config(
                "sim capacity range must satisfy 0 < min_capacity <= max_capacity".to_string(),
            ));
        }
        if !self.job_budget.is_finite() || self.job_budget <= 0.0 {
            return Err(MeshError::Config(
                "sim.job_budget must be a positive number".to_string(),
            ));
        }
        self.failures.validate()?;
        self.workload.validate()
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            nodes: 4,
            jobs: 20,
            max_ticks: 600,
            tick_ms: 1_000,
            job_budget: 10.0,
            min_capacity: 1,
            max_capacity: 4,
            failures: FailureModel::chaotic(),
            workload: WorkloadModel::default(),
        }
    }
}

/// What happened in one tick
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickSummary {
    /// Tick number, starting at 1
    pub tick: u64,
    /// Outcomes delivered to the control plane
    pub outcomes: usize,
    /// Attempts dispatched
    pub dispatched: usize,
    /// Jobs left waiting
    pub deferred: usize,
    /// Nodes demoted by the heartbeat sweep
    pub lost: usize,
    /// Nodes crashed this tick
    pub crashed: usize,
    /// Nodes recovered this tick
    pub recovered: usize,
}

/// Result of a whole run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimReport {
    /// Seed the run used
    pub seed: u64,
    /// Ticks executed
    pub ticks: u64,
    /// Every job reached a terminal state
    pub finished: bool,
    /// Crashes injected
    pub crashes: usize,
    /// Control plane stats at the end
    pub stats: Stats,
}

/// A control plane wired to simulated nodes
#[derive(Debug)]
pub struct Simulation {
    config: SimConfig,
    plane: Arc<ControlPlane>,
    executor: SimExecutor,
    injector: Arc<CrashInjector>,
    clock: ManualClock,
    nodes: Vec<NodeId>,
    jobs: Vec<JobId>,
    tick: u64,
}

impl Simulation {
    /// Build the control plane, register nodes and submit jobs
    ///
    /// # Errors
    ///
    /// Returns `Config` if either config is invalid
    pub async fn start(mesh: MeshConfig, config: SimConfig) -> MeshResult<Self> {
        config.validate()?;

        let seed = SimSeed::new(config.seed);
        let clock = ManualClock::new(EPOCH);
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let injector = Arc::new(CrashInjector::new(&seed, config.failures.clone()));
        let executor = SimExecutor::new(
            &seed,
            config.failures.clone(),
            config.workload.clone(),
            injector.clone(),
            shared.clone(),
        );
        let reputation = Arc::new(InMemoryReputation::new(mesh.reputation.clone(), shared.clone()));
        let plane = Arc::new(ControlPlane::new(
            mesh,
            reputation,
            Arc::new(executor.clone()),
            shared,
        )?);

        let mut rng = seed.derive("population").rng();
        let mut nodes = Vec::with_capacity(config.nodes);
        let mut largest = 0;
        for i in 0..config.nodes {
            let capacity = rng.gen_range(config.min_capacity..=config.max_capacity);
            largest = largest.max(capacity);
            let descriptor = NodeDescriptor::new(
                NodeId::new(format!("sim-{i:03}"))?,
                format!("sim-{i:03}.mesh.local"),
                8080,
            )
            .with_gpu_memory(capacity)
            .with_compute_score(rng.gen_range(1.0..10.0))
            .with_metadata("region", if i % 2 == 0 { "east" } else { "west" });
            nodes.push(plane.register_node(descriptor).await?);
        }

        let preferences = [
            SpeedPreference::Fast,
            SpeedPreference::Balanced,
            SpeedPreference::Cheap,
        ];
        let estimated_secs = config.workload.max_run_ms.div_ceil(1_000);
        let mut jobs = Vec::with_capacity(config.jobs);
        for i in 0..config.jobs {
            let mut spec = JobSpec::new("finetune", format!("model-{}", i % 5))
                .with_dataset(format!("dataset-{i}"))
                .with_estimated_duration_secs(estimated_secs);
            // Wide jobs only when some node can hold them
            if largest >= 2 && rng.gen_bool(0.25) {
                spec = spec.with_required_capacity(2);
            }
            let preference = preferences[rng.gen_range(0..preferences.len())];
            jobs.push(plane.submit_job(spec, config.job_budget, preference).await?);
        }

        tracing::info!(
            seed = config.seed,
            nodes = nodes.len(),
            jobs = jobs.len(),
            "Simulation started"
        );

        Ok(Self {
            config,
            plane,
            executor,
            injector,
            clock,
            nodes,
            jobs,
            tick: 0,
        })
    }

    /// Control plane under test
    #[must_use]
    pub fn plane(&self) -> &Arc<ControlPlane> {
        &self.plane
    }

    /// Simulated execution layer
    #[must_use]
    pub fn executor(&self) -> &SimExecutor {
        &self.executor
    }

    /// Registered nodes
    #[must_use]
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Submitted jobs
    #[must_use]
    pub fn jobs(&self) -> &[JobId] {
        &self.jobs
    }

    /// Current simulated time
    #[must_use]
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Crash a node now, dropping everything it runs
    pub async fn crash(&self, node_id: &NodeId) {
        if self.injector.crash(node_id).await {
            self.executor.drop_node(node_id).await;
        }
    }

    /// Bring a crashed node back
    pub async fn recover(&self, node_id: &NodeId) -> bool {
        self.injector.recover(node_id).await
    }

    /// Advance one tick: churn, heartbeats, outcomes, sweep, allocation
    pub async fn step(&mut self) -> TickSummary {
        self.tick += 1;
        self.clock
            .advance(Duration::from_millis(self.config.tick_ms));
        let now = self.clock.now();

        let churn = self.injector.step(&self.nodes).await;
        for node_id in &churn.crashed {
            self.executor.drop_node(node_id).await;
        }

        for node_id in &self.nodes {
            if self.injector.is_crashed(node_id).await {
                continue;
            }
            if let Err(err) = self.plane.node_heartbeat(node_id, &Telemetry::healthy()).await {
                tracing::debug!(node_id = %node_id, error = %err, "Heartbeat refused");
            }
        }

        let events = self.executor.drain_due(now).await;
        let outcomes = events.len();
        for event in events {
            let job_id = event.job_id;
            if let Err(err) = self.plane.report_outcome(event).await {
                tracing::warn!(job_id = %job_id, error = %err, "Outcome rejected");
            }
        }

        let lost = self.plane.sweep_heartbeats().await.len();
        let report = self.plane.schedule_tick().await;

        let summary = TickSummary {
            tick: self.tick,
            outcomes,
            dispatched: report.dispatched,
            deferred: report.deferred,
            lost,
            crashed: churn.crashed.len(),
            recovered: churn.recovered.len(),
        };
        tracing::debug!(?summary, "Tick complete");
        summary
    }

    /// Whether every job reached a terminal state
    pub async fn finished(&self) -> bool {
        let stats = self.plane.stats().await;
        let terminal: usize = stats
            .jobs
            .iter()
            .filter(|(status, _)| status.is_terminal())
            .map(|(_, n)| n)
            .sum();
        terminal == self.jobs.len()
    }

    /// Step until every job is terminal or the tick limit is hit
    pub async fn run(&mut self) -> SimReport {
        while self.tick < self.config.max_ticks {
            if self.finished().await {
                break;
            }
            self.step().await;
        }
        let report = SimReport {
            seed: self.config.seed,
            ticks: self.tick,
            finished: self.finished().await,
            crashes: self.injector.crash_count(),
            stats: self.plane.stats().await,
        };
        tracing::info!(
            ticks = report.ticks,
            finished = report.finished,
            crashes = report.crashes,
            completed = report.stats.jobs.get(&JobStatus::Completed).copied().unwrap_or(0),
            "Simulation finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn count(stats: &Stats, status: JobStatus) -> usize {
        stats.jobs.get(&status).copied().unwrap_or(0)
    }

    #[test]
    fn test_config_validate() {
        assert!(SimConfig::default().validate().is_ok());
        let mut bad = SimConfig::default();
        bad.min_capacity = 5;
        assert!(bad.validate().is_err());
        bad = SimConfig::default();
        bad.job_budget = 0.0;
        assert!(bad.validate().is_err());
    }

    #[tokio::test]
    async fn test_reliable_run_completes_everything() {
        let config = SimConfig::new(5)
            .with_nodes(3)
            .with_jobs(10)
            .with_capacity(2)
            .with_max_ticks(100)
            .with_failures(FailureModel::reliable());
        let mut sim = Simulation::start(MeshConfig::new(), config).await.unwrap();
        let report = sim.run().await;

        assert!(report.finished);
        assert_eq!(count(&report.stats, JobStatus::Completed), 10);
        assert_eq!(report.stats.counters.retries, 0);
        assert_eq!(report.crashes, 0);
        assert!(report.stats.total_spent > 0.0);
    }

    #[tokio::test]
    async fn test_same_seed_same_report() {
        let config = SimConfig::new(11).with_nodes(4).with_jobs(15).with_max_ticks(200);
        let mut a = Simulation::start(MeshConfig::new(), config.clone()).await.unwrap();
        let mut b = Simulation::start(MeshConfig::new(), config).await.unwrap();
        assert_eq!(a.run().await, b.run().await);
    }

    #[tokio::test]
    async fn test_crash_hands_job_off() {
        let config = SimConfig::new(1)
            .with_nodes(1)
            .with_jobs(1)
            .with_capacity(1)
            .with_failures(FailureModel::reliable())
            .with_workload(WorkloadModel {
                min_run_ms: 60_000,
                max_run_ms: 60_000,
                cost_per_sec: 0.001,
            });
        let mut sim = Simulation::start(MeshConfig::new(), config).await.unwrap();
        assert_eq!(sim.step().await.dispatched, 1);

        let node = sim.nodes()[0].clone();
        sim.crash(&node).await;
        assert_eq!(sim.executor().in_flight().await, 0);

        let mut lost = 0;
        for _ in 0..12 {
            lost += sim.step().await.lost;
        }
        let stats = sim.plane().stats().await;
        assert_eq!(lost, 1);
        assert_eq!(stats.counters.node_lost_events, 1);
        assert_eq!(count(&stats, JobStatus::Running), 0);

        assert!(sim.recover(&node).await);
        let report = sim.run().await;
        assert!(report.finished);
        assert_eq!(count(&report.stats, JobStatus::Completed), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        #[test]
        fn churn_never_overbooks_or_overspends(seed in any::<u64>()) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let failures = FailureModel::chaotic().with_crashes(0.05, 0.3);
                let config = SimConfig::new(seed)
                    .with_nodes(3)
                    .with_jobs(12)
                    .with_max_ticks(120)
                    .with_failures(failures);
                let mut sim = Simulation::start(MeshConfig::new(), config).await.unwrap();
                for _ in 0..120 {
                    sim.step().await;
                    for node in sim.plane().list_nodes().await {
                        assert!(node.current_load <= node.gpu_memory);
                    }
                }
                for id in sim.jobs() {
                    let job = sim.plane().get_job(id).await.unwrap();
                    assert!(job.spent_so_far <= job.max_budget);
                }
            });
        }
    }
}
