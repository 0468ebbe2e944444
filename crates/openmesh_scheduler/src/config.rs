//! Control plane configuration.
//!
//! Every field has a default, so an empty TOML document is a valid config.

use crate::allocation::{AllocationConfig, ScoringConfig};
use crate::fault::RetryPolicy;
use openmesh_cluster::{HeartbeatConfig, RegistryConfig, ReputationConfig};
use openmesh_core::{MeshError, MeshResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Scheduling loop timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Interval between allocation passes
    pub tick_interval_ms: u64,
    /// Running attempts older than this are timed out
    pub attempt_timeout_ms: u64,
    /// Capacity of the internal event channels
    pub channel_capacity: usize,
}

impl SchedulerConfig {
    /// Tick interval
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Attempt timeout
    #[must_use]
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            attempt_timeout_ms: 3_600_000,
            channel_capacity: 1_024,
        }
    }
}

/// Complete control plane configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Heartbeat timing
    pub heartbeat: HeartbeatConfig,
    /// Retry limit and backoff
    pub retry: RetryPolicy,
    /// Score weights per speed preference
    pub scoring: ScoringConfig,
    /// Job sizing defaults
    pub allocation: AllocationConfig,
    /// Registry limits
    pub registry: RegistryConfig,
    /// Loop timing
    pub scheduler: SchedulerConfig,
    /// In-memory reputation tuning
    pub reputation: ReputationConfig,
}

impl MeshConfig {
    /// Create the default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a TOML document
    ///
    /// # Errors
    ///
    /// Returns `Config` for malformed TOML or invalid values
    pub fn from_toml_str(input: &str) -> MeshResult<Self> {
        let config: Self =
            toml::from_str(input).map_err(|e| MeshError::Config(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    ///
    /// # Errors
    ///
    /// Returns `Config` if the file cannot be read or is invalid
    pub fn load(path: impl AsRef<Path>) -> MeshResult<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path)
            .map_err(|e| MeshError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&input)
    }

    /// Set heartbeat timing
    #[must_use]
    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Set retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set scoring weights
    #[must_use]
    pub fn with_scoring(mut self, scoring: ScoringConfig) -> Self {
        self.scoring = scoring;
        self
    }

    /// Set allocation defaults
    #[must_use]
    pub fn with_allocation(mut self, allocation: AllocationConfig) -> Self {
        self.allocation = allocation;
        self
    }

    /// Set registry limits
    #[must_use]
    pub fn with_registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = registry;
        self
    }

    /// Set loop timing
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Set reputation tuning
    #[must_use]
    pub fn with_reputation(mut self, reputation: ReputationConfig) -> Self {
        self.reputation = reputation;
        self
    }

    /// Check every section
    ///
    /// # Errors
    ///
    /// Returns `Config` naming the first invalid field
    pub fn validate(&self) -> MeshResult<()> {
        self.heartbeat.validate()?;
        self.retry.validate()?;
        self.scoring.validate()?;
        self.allocation.validate()?;
        self.reputation.validate()?;
        if self.registry.max_allocation_failures == 0 {
            return Err(MeshError::Config(
                "registry.max_allocation_failures must be at least 1".to_string(),
            ));
        }
        if self.scheduler.tick_interval_ms == 0 || self.scheduler.attempt_timeout_ms == 0 {
            return Err(MeshError::Config(
                "scheduler.tick_interval_ms and scheduler.attempt_timeout_ms must be greater than zero"
                    .to_string(),
            ));
        }
        if self.scheduler.channel_capacity == 0 {
            return Err(MeshError::Config(
                "scheduler.channel_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
