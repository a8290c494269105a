//! The trial runner: the unit of work a pool worker executes.
//!
//! Given a transition request the runner checks the move is legal, runs
//! the stage's handler, and decides what happens next: run the following
//! stage inline (when no delay separates them), queue it, or hand the
//! finished trial's deployment back to the trial manager.
//!
//! Everything a handler can do wrong (error, panic, return without moving
//! the trial) ends with the trial marked `FAILED`; a failed trial still
//! releases its deployment so the next trial can start.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use trialgrid_core::{TrialId, TrialStatus};

use crate::error::{TrialError, TrialResult};
use crate::handler::{HandlerFactory, TrialContext};
use crate::manager::TrialManager;
use crate::queue::{TransitionRequest, WorkQueues};
use crate::registry::TrialRegistry;
use crate::stage::{furthest_reachable_without_delay, is_legal, next_stage, Stage};

pub struct TrialRunner {
    registry: TrialRegistry,
    factory: Arc<HandlerFactory>,
    queues: WorkQueues,
    manager: Arc<TrialManager>,
    batch_immediate_stages: bool,
}

impl TrialRunner {
    pub fn new(
        registry: TrialRegistry,
        factory: Arc<HandlerFactory>,
        queues: WorkQueues,
        manager: Arc<TrialManager>,
        batch_immediate_stages: bool,
    ) -> Self {
        Self {
            registry,
            factory,
            queues,
            manager,
            batch_immediate_stages,
        }
    }

    /// Execute `request`. Resolves to the trial id on success.
    pub async fn run(&self, request: TransitionRequest) -> TrialResult<TrialId> {
        let trial = request.trial;
        let current = self
            .registry
            .update(&trial, |r| {
                if r.target_stage != request.target {
                    return Err(TrialError::StaleRequest {
                        trial: r.id.clone(),
                        requested: request.target,
                        recorded: r.target_stage,
                    });
                }
                // Only the trial holding its deployment runs, one dispatch at a time.
                if r.status != TrialStatus::InProgress
                    || r.in_flight
                    || !is_legal(r.current_stage, r.target_stage)
                {
                    return Err(TrialError::InvalidTransition {
                        trial: r.id.clone(),
                        from: r.current_stage,
                        to: r.target_stage,
                    });
                }
                r.in_flight = true;
                Ok(r.current_stage)
            })
            .await??;

        let batch_limit = if self.batch_immediate_stages {
            furthest_reachable_without_delay(current)
        } else {
            None
        };

        let outcome = self.drive(&trial, request.target, batch_limit).await;
        let failure = outcome.as_ref().err().map(|e| {
            error!(%trial, error = %e, "trial failed");
            e.to_string()
        });
        let _ = self
            .registry
            .update(&trial, |r| {
                // A queued next stage already cleared the flag and may own it now.
                if failure.is_some() || r.status.is_terminal() {
                    r.in_flight = false;
                }
                if let Some(reason) = failure
                    && !r.status.is_terminal()
                {
                    r.fail(reason);
                }
            })
            .await;

        self.release_if_finished(&trial).await;
        outcome.map(|()| trial)
    }

    /// Run handlers from `target` onwards until the trial finishes or the
    /// next stage has to go back through a queue.
    async fn drive(&self, trial: &str, mut target: Stage, batch_limit: Option<Stage>) -> TrialResult<()> {
        loop {
            let cancelled = self
                .registry
                .update(trial, |r| {
                    if r.cancel_requested && !r.status.is_terminal() {
                        r.fail("cancelled");
                        return true;
                    }
                    false
                })
                .await?;
            if cancelled {
                info!(%trial, "trial cancelled before {:?}", target);
                return Ok(());
            }

            let handler = self.factory.resolve(target)?;
            debug!(%trial, stage = ?target, "running stage handler");

            let ctx = TrialContext::new(trial, target, self.registry.clone());
            match tokio::spawn(handler.handle(ctx)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(TrialError::Handler(format!("{target:?}: {e:#}"))),
                Err(_) => return Err(TrialError::HandlerPanicked(trial.to_string())),
            }

            let record = self
                .registry
                .get(trial)
                .await
                .ok_or_else(|| TrialError::UnknownTrial(trial.to_string()))?;

            match record.status {
                TrialStatus::Completed | TrialStatus::Failed => {
                    info!(%trial, status = %record.status, stage = ?record.current_stage, "trial finished");
                    return Ok(());
                }
                TrialStatus::Waiting => {
                    return Err(TrialError::Handler(format!(
                        "{target:?}: handler moved trial back to WAITING"
                    )));
                }
                TrialStatus::InProgress => {}
            }

            if record.current_stage < target {
                return Err(TrialError::Handler(format!(
                    "{target:?}: handler returned without reaching the stage (at {:?})",
                    record.current_stage
                )));
            }

            if record.current_stage.is_terminal() {
                self.registry
                    .update(trial, |r| r.set_status(TrialStatus::Completed))
                    .await?;
                info!(%trial, "trial completed at terminal stage");
                return Ok(());
            }

            // A retarget made while the handler ran takes precedence over
            // the table order; it was left for this runner to queue.
            let next = next_stage(record.current_stage);
            let queued = self
                .registry
                .update(trial, |r| {
                    let retargeted =
                        r.target_stage != target && is_legal(r.current_stage, r.target_stage);
                    if !retargeted {
                        r.target_stage = next;
                    }
                    let inline = !retargeted
                        && !next.requires_delay()
                        && batch_limit.is_some_and(|limit| next <= limit);
                    if !inline {
                        r.in_flight = false;
                    }
                    (!inline).then_some(r.target_stage)
                })
                .await?;

            let Some(stage) = queued else {
                debug!(%trial, stage = ?next, "continuing inline");
                target = next;
                continue;
            };
            if stage != next {
                info!(%trial, ?stage, "trial retargeted while its handler ran");
            }
            self.queues.push_for_stage(trial, stage, &record.config)?;
            return Ok(());
        }
    }

    /// Hand the deployment back when the trial is done and asked for it.
    async fn release_if_finished(&self, trial: &str) {
        let Some(record) = self.registry.get(trial).await else {
            return;
        };
        if !record.status.is_terminal() {
            return;
        }
        if !record.notify_on_completion {
            debug!(%trial, "trial finished, deployment release left to caller");
            return;
        }
        match self.manager.on_completion(trial).await {
            Ok(Some(next)) => debug!(%trial, %next, "deployment handed over"),
            Ok(None) => debug!(%trial, "deployment idle"),
            Err(e) => warn!(%trial, error = %e, "deployment release failed"),
        }
    }
}
