//! Pipeline — assembles the registry, queues, pools, consumers and trial
//! manager into one running system, and is the surface callers use.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use trialgrid_core::{DeploymentKey, TrialGridConfig, TrialId, TrialSpec, TrialStatus};

use crate::consumer::{run_immediate_consumer, run_scheduled_consumer, ConsumerStats, Dispatcher};
use crate::error::{TrialError, TrialResult};
use crate::handler::HandlerFactory;
use crate::manager::TrialManager;
use crate::pool::{PoolSize, WorkerPools};
use crate::queue::WorkQueues;
use crate::registry::{TrialRecord, TrialRegistry};
use crate::retention::RetentionSweeper;
use crate::runner::TrialRunner;
use crate::stage::{is_legal, Stage};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A running trial pipeline.
pub struct Pipeline {
    registry: TrialRegistry,
    queues: WorkQueues,
    manager: Arc<TrialManager>,
    pools: Arc<WorkerPools>,
    dispatcher: Dispatcher,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    /// Build the pipeline and spawn its consumers and retention sweeper.
    /// Must be called from within a tokio runtime.
    pub fn start(config: &TrialGridConfig, factory: HandlerFactory) -> Self {
        let registry = TrialRegistry::new();
        let (queues, receivers) = WorkQueues::new();
        let manager = Arc::new(TrialManager::new(registry.clone(), queues.clone()));
        let pools = Arc::new(WorkerPools::new(
            PoolSize::from(&config.pool),
            PoolSize::from(&config.scheduled_pool),
        ));
        let runner = Arc::new(TrialRunner::new(
            registry.clone(),
            Arc::new(factory),
            queues.clone(),
            Arc::clone(&manager),
            config.pipeline.batch_immediate_stages,
        ));
        let dispatcher = Dispatcher::new(registry.clone(), runner, Arc::clone(&pools));
        let sweeper = RetentionSweeper::new(registry.clone(), Arc::clone(&manager), &config.retention);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(run_immediate_consumer(
                dispatcher.clone(),
                receivers.immediate,
                shutdown_rx.clone(),
            )),
            tokio::spawn(run_scheduled_consumer(
                dispatcher.clone(),
                receivers.scheduled,
                shutdown_rx.clone(),
            )),
            tokio::spawn(async move { sweeper.run(shutdown_rx).await }),
        ];

        info!(
            batch_immediate_stages = config.pipeline.batch_immediate_stages,
            "trial pipeline started"
        );

        Self {
            registry,
            queues,
            manager,
            pools,
            dispatcher,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        }
    }

    /// Register a trial and line it up for its deployment.
    pub async fn submit(&self, spec: TrialSpec) -> TrialResult<()> {
        let id = spec.id.clone();
        let deployment = spec.deployment.clone();
        self.registry.insert(spec).await?;
        if let Err(e) = self.manager.enqueue(&id, &deployment).await {
            let _ = self.registry.mark_failed(&id, &e.to_string()).await;
            return Err(e);
        }
        Ok(())
    }

    pub async fn status(&self, id: &str) -> Option<TrialRecord> {
        self.registry.get(id).await
    }

    pub async fn trials(&self) -> Vec<TrialRecord> {
        self.registry.list().await
    }

    /// Trial ids lined up for `deployment`, the running one first.
    pub async fn deployment_queue(&self, deployment: &DeploymentKey) -> Vec<TrialId> {
        self.manager.queue_snapshot(deployment).await
    }

    /// Cancel a trial. A waiting trial leaves its deployment queue at once;
    /// a running one stops before its next stage. Finished trials are left
    /// as they are.
    pub async fn cancel(&self, id: &str) -> TrialResult<()> {
        let record = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| TrialError::UnknownTrial(id.to_string()))?;
        match record.status {
            TrialStatus::Waiting => {
                if !self.manager.cancel_waiting(id).await? {
                    self.request_cancel(id).await?;
                }
            }
            TrialStatus::InProgress => self.request_cancel(id).await?,
            TrialStatus::Completed | TrialStatus::Failed => {}
        }
        Ok(())
    }

    async fn request_cancel(&self, id: &str) -> TrialResult<()> {
        self.registry.update(id, |r| r.cancel_requested = true).await?;
        info!(trial = %id, "cancellation requested");
        Ok(())
    }

    /// Release the deployment held by a finished trial that was submitted
    /// without `notify_on_completion`. Returns the promoted trial.
    pub async fn complete(&self, id: &str) -> TrialResult<Option<TrialId>> {
        let status = self
            .registry
            .status_of(id)
            .await
            .ok_or_else(|| TrialError::UnknownTrial(id.to_string()))?;
        if !status.is_terminal() {
            return Err(TrialError::NotFinished(id.to_string()));
        }
        self.manager.on_completion(id).await
    }

    /// Point a running trial at a new target stage. Requests already queued
    /// for the old target become stale.
    ///
    /// Only an `IN_PROGRESS` trial can be retargeted. While one of its
    /// handlers is running the new target is only recorded; the runner
    /// queues it once the handler returns.
    pub async fn retarget(&self, id: &str, target: Stage) -> TrialResult<()> {
        let queue_now = self
            .registry
            .update(id, |r| {
                if r.status != TrialStatus::InProgress || !is_legal(r.current_stage, target) {
                    return Err(TrialError::InvalidTransition {
                        trial: r.id.clone(),
                        from: r.current_stage,
                        to: target,
                    });
                }
                r.target_stage = target;
                Ok((!r.in_flight).then(|| r.config.clone()))
            })
            .await??;

        match queue_now {
            Some(config) => self.queues.push_for_stage(id, target, &config)?,
            None => debug!(trial = %id, ?target, "handler running, target queued on return"),
        }
        info!(trial = %id, ?target, "trial retargeted");
        Ok(())
    }

    /// The worker pools, for runtime resizing and stats.
    pub fn pools(&self) -> &WorkerPools {
        &self.pools
    }

    /// (immediate, scheduled) consumer counters.
    pub fn consumer_stats(&self) -> (ConsumerStats, ConsumerStats) {
        (self.dispatcher.immediate_stats(), self.dispatcher.scheduled_stats())
    }

    /// Wait until the trial finishes. `None` on timeout or unknown trial.
    pub async fn wait_for_terminal(&self, id: &str, timeout: Duration) -> Option<TrialRecord> {
        tokio::time::timeout(timeout, async {
            loop {
                match self.registry.get(id).await {
                    Some(record) if record.status.is_terminal() => return Some(record),
                    Some(_) => tokio::time::sleep(POLL_INTERVAL).await,
                    None => return None,
                }
            }
        })
        .await
        .ok()
        .flatten()
    }

    /// Wait until every registered trial has finished.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let trials = self.registry.list().await;
                if trials.iter().all(|r| r.status.is_terminal()) {
                    return;
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        })
        .await
        .is_ok()
    }

    /// Stop the consumers and the sweeper, then close the pools.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "pipeline task ended abnormally");
            }
        }
        for pool in [&self.pools.regular, &self.pools.scheduled] {
            let stats = pool.stats();
            info!(
                pool = pool.name(),
                completed = stats.completed,
                failed = stats.failed,
                "worker pool totals"
            );
        }
        self.pools.close();
        info!("trial pipeline stopped");
    }
}
