//! Heartbeat monitor.
//!
//! Periodically demotes nodes that went silent and reports each one once
//! so the scheduler can hand off the jobs that were running there.

use crate::registry::{NodeLoss, NodeRegistry};
use openmesh_core::{MeshError, MeshResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Heartbeat timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// How often nodes are expected to heartbeat, and how often the monitor sweeps
    pub interval_ms: u64,
    /// Silence after which a node is unreachable
    pub timeout_ms: u64,
}

impl HeartbeatConfig {
    /// Create a config
    #[must_use]
    pub fn new(interval_ms: u64, timeout_ms: u64) -> Self {
        Self {
            interval_ms,
            timeout_ms,
        }
    }

    /// Sweep interval
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Silence timeout
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Check the timing is usable
    ///
    /// # Errors
    ///
    /// Returns `Config` if either value is zero or the timeout does not
    /// exceed the interval
    pub fn validate(&self) -> MeshResult<()> {
        if self.interval_ms == 0 {
            return Err(MeshError::Config(
                "heartbeat.interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.timeout_ms <= self.interval_ms {
            return Err(MeshError::Config(format!(
                "heartbeat.timeout_ms ({}) must exceed heartbeat.interval_ms ({})",
                self.timeout_ms, self.interval_ms
            )));
        }
        Ok(())
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::new(2_000, 10_000)
    }
}

/// Demotes silent nodes
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    registry: Arc<NodeRegistry>,
    config: HeartbeatConfig,
}

impl HeartbeatMonitor {
    /// Create a monitor over a registry
    #[must_use]
    pub fn new(registry: Arc<NodeRegistry>, config: HeartbeatConfig) -> Self {
        Self { registry, config }
    }

    /// Timing in use
    #[must_use]
    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    /// Run one pass and return the nodes that just became unreachable
    pub async fn sweep(&self) -> Vec<NodeLoss> {
        self.registry.demote_silent(self.config.timeout()).await
    }

    /// Sweep on every interval tick until cancelled
    ///
    /// Each demotion is sent on `lost_tx` exactly once per transition.
    /// The loop also stops if the receiver is dropped.
    pub async fn run(self, lost_tx: mpsc::Sender<NodeLoss>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            interval_ms = self.config.interval_ms,
            timeout_ms = self.config.timeout_ms,
            "Heartbeat monitor started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Heartbeat monitor shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    for loss in self.sweep().await {
                        if lost_tx.send(loss).await.is_err() {
                            tracing::debug!("Lost-node receiver closed, stopping monitor");
                            return;
                        }
                    }
                }
            }
        }
    }
}
