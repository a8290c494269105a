//! Trial manager — serializes trials that target the same deployment.
//!
//! Each deployment key owns a FIFO of trial ids. The head is the only
//! trial allowed to be `IN_PROGRESS`; everyone behind it waits. When the
//! head finishes it is popped and the next waiting trial is admitted and
//! fed back into the immediate work queue.
//!
//! Lock order: the deployment map is always taken before the registry.

use std::collections::{HashMap, VecDeque};

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use trialgrid_core::{DeploymentKey, TrialId, TrialStatus};

use crate::error::{TrialError, TrialResult};
use crate::queue::WorkQueues;
use crate::registry::TrialRegistry;
use crate::stage::next_stage;

pub struct TrialManager {
    registry: TrialRegistry,
    queues: WorkQueues,
    deployments: Mutex<HashMap<DeploymentKey, VecDeque<TrialId>>>,
}

impl TrialManager {
    pub fn new(registry: TrialRegistry, queues: WorkQueues) -> Self {
        Self {
            registry,
            queues,
            deployments: Mutex::new(HashMap::new()),
        }
    }

    /// Line a registered trial up for its deployment. Returns `true` when
    /// the trial was admitted straight away.
    pub async fn enqueue(&self, trial: &str, deployment: &DeploymentKey) -> TrialResult<bool> {
        let mut deployments = self.deployments.lock().await;
        let queue = deployments.entry(deployment.clone()).or_default();
        let admit = queue.is_empty();
        queue.push_back(trial.to_string());

        if admit {
            if let Err(e) = self.admit(trial).await {
                queue.pop_back();
                if queue.is_empty() {
                    deployments.remove(deployment);
                }
                return Err(e);
            }
            info!(%trial, %deployment, "trial admitted");
        } else {
            self.registry
                .update(trial, |r| r.set_status(TrialStatus::Waiting))
                .await?;
            info!(%trial, %deployment, position = queue.len() - 1, "trial waiting for deployment");
        }
        Ok(admit)
    }

    /// Mark `trial` in progress and queue its first pending transition.
    async fn admit(&self, trial: &str) -> TrialResult<()> {
        let (target, config) = self
            .registry
            .update(trial, |r| {
                r.set_status(TrialStatus::InProgress);
                r.target_stage = next_stage(r.current_stage);
                (r.target_stage, r.config.clone())
            })
            .await?;
        self.queues.push_for_stage(trial, target, &config)
    }

    /// Release the deployment held by a finished trial and promote the
    /// next waiting trial, if any. Returns the promoted trial.
    ///
    /// The finishing trial must be the head of its deployment queue;
    /// otherwise nothing changes and `NotDeploymentHead` is returned.
    pub async fn on_completion(&self, trial: &str) -> TrialResult<Option<TrialId>> {
        let deployment = self
            .registry
            .get(trial)
            .await
            .map(|r| r.deployment)
            .ok_or_else(|| TrialError::UnknownTrial(trial.to_string()))?;

        let mut deployments = self.deployments.lock().await;
        let not_head = || TrialError::NotDeploymentHead {
            trial: trial.to_string(),
            deployment: deployment.to_string(),
        };
        let queue = deployments.get_mut(&deployment).ok_or_else(not_head)?;
        if queue.front().map(String::as_str) != Some(trial) {
            error!(%trial, %deployment, head = ?queue.front(), "completion from non-head trial");
            return Err(not_head());
        }
        queue.pop_front();
        debug!(%trial, %deployment, "deployment released");

        let mut promoted = None;
        while let Some(next) = queue.front().cloned() {
            match self.registry.status_of(&next).await {
                Some(TrialStatus::Waiting) => {}
                Some(status) => {
                    warn!(trial = %next, %status, "skipping non-waiting trial at queue head");
                    queue.pop_front();
                    continue;
                }
                None => {
                    warn!(trial = %next, "skipping unregistered trial at queue head");
                    queue.pop_front();
                    continue;
                }
            }

            match self.admit(&next).await {
                Ok(()) => {
                    info!(trial = %next, %deployment, "next trial promoted");
                    promoted = Some(next);
                    break;
                }
                Err(e) => {
                    error!(trial = %next, error = %e, "failed to promote trial");
                    let _ = self.registry.mark_failed(&next, &e.to_string()).await;
                    queue.pop_front();
                }
            }
        }

        if queue.is_empty() {
            deployments.remove(&deployment);
        }
        Ok(promoted)
    }

    /// Withdraw a trial that is still waiting for its deployment. Returns
    /// `false` if the trial is not waiting (it may be running or gone).
    pub async fn cancel_waiting(&self, trial: &str) -> TrialResult<bool> {
        let record = self
            .registry
            .get(trial)
            .await
            .ok_or_else(|| TrialError::UnknownTrial(trial.to_string()))?;
        if record.status != TrialStatus::Waiting {
            return Ok(false);
        }

        let mut deployments = self.deployments.lock().await;
        let Some(queue) = deployments.get_mut(&record.deployment) else {
            return Ok(false);
        };
        // The head is never waiting, so this only removes queued entries.
        let Some(pos) = queue.iter().skip(1).position(|id| id == trial) else {
            return Ok(false);
        };
        queue.remove(pos + 1);
        self.registry.mark_failed(trial, "cancelled").await?;
        info!(%trial, deployment = %record.deployment, "waiting trial cancelled");
        Ok(true)
    }

    /// Trial ids queued for `deployment`, head first.
    pub async fn queue_snapshot(&self, deployment: &DeploymentKey) -> Vec<TrialId> {
        let deployments = self.deployments.lock().await;
        deployments
            .get(deployment)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Deployments with a trial holding them, and that trial.
    pub async fn active_deployments(&self) -> Vec<(DeploymentKey, TrialId)> {
        let deployments = self.deployments.lock().await;
        let mut active: Vec<_> = deployments
            .iter()
            .filter_map(|(key, q)| q.front().map(|head| (key.clone(), head.clone())))
            .collect();
        active.sort();
        active
    }
}
