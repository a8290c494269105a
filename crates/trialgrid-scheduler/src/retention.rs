//! Evicts finished trial records once they outlive the retention TTL.
//!
//! Trials still holding their deployment (finished without
//! `notify_on_completion` and not yet released by the caller) are kept
//! until they are released.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use trialgrid_core::{RetentionConfig, TrialId};

use crate::manager::TrialManager;
use crate::registry::{epoch_secs, TrialRegistry};

pub struct RetentionSweeper {
    registry: TrialRegistry,
    manager: Arc<TrialManager>,
    ttl: Duration,
    interval: Duration,
}

impl RetentionSweeper {
    pub fn new(registry: TrialRegistry, manager: Arc<TrialManager>, config: &RetentionConfig) -> Self {
        Self {
            registry,
            manager,
            ttl: Duration::from_secs(config.ttl_secs),
            interval: Duration::from_secs(config.sweep_interval_secs.max(1)),
        }
    }

    pub fn enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    /// Evict everything that finished more than one TTL ago.
    pub async fn sweep_once(&self) -> Vec<TrialId> {
        if !self.enabled() || self.registry.is_empty().await {
            return Vec::new();
        }
        let pinned: Vec<TrialId> = self
            .manager
            .active_deployments()
            .await
            .into_iter()
            .map(|(_, trial)| trial)
            .collect();
        let cutoff = epoch_secs().saturating_sub(self.ttl.as_secs());
        let evicted = self.registry.evict_finished_before(cutoff, &pinned).await;
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "finished trials evicted");
        }
        evicted
    }

    /// Run the sweep loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if !self.enabled() {
            info!("trial retention disabled, finished trials are kept");
            return;
        }
        info!(
            ttl_secs = self.ttl.as_secs(),
            interval_secs = self.interval.as_secs(),
            "retention sweeper started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.sweep_once().await;
                }
                _ = shutdown.changed() => {
                    info!("retention sweeper shutting down");
                    break;
                }
            }
        }
    }
}
