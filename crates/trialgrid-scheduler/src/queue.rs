//! Immediate and scheduled transition request queues.
//!
//! Both queues are unbounded FIFO channels. `WorkQueues` is the producer
//! half and is cloned into everything that advances trials; the receivers
//! are owned by the two consumer tasks.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use trialgrid_core::{TrialConfig, TrialId};

use crate::error::{TrialError, TrialResult};
use crate::stage::{stage_delay, Stage};

/// A request to advance `trial` to `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRequest {
    pub trial: TrialId,
    pub target: Stage,
}

impl TransitionRequest {
    pub fn new(trial: &str, target: Stage) -> Self {
        Self {
            trial: trial.to_string(),
            target,
        }
    }
}

/// A transition request that must wait `delay` before it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledRequest {
    pub request: TransitionRequest,
    pub delay: Duration,
}

/// Producer side of both work queues.
#[derive(Clone)]
pub struct WorkQueues {
    immediate: mpsc::UnboundedSender<TransitionRequest>,
    scheduled: mpsc::UnboundedSender<ScheduledRequest>,
}

/// Consumer side of both work queues.
pub struct QueueReceivers {
    pub immediate: mpsc::UnboundedReceiver<TransitionRequest>,
    pub scheduled: mpsc::UnboundedReceiver<ScheduledRequest>,
}

impl WorkQueues {
    pub fn new() -> (Self, QueueReceivers) {
        let (immediate_tx, immediate_rx) = mpsc::unbounded_channel();
        let (scheduled_tx, scheduled_rx) = mpsc::unbounded_channel();
        (
            Self {
                immediate: immediate_tx,
                scheduled: scheduled_tx,
            },
            QueueReceivers {
                immediate: immediate_rx,
                scheduled: scheduled_rx,
            },
        )
    }

    pub fn push_immediate(&self, request: TransitionRequest) -> TrialResult<()> {
        debug!(trial = %request.trial, target = ?request.target, "immediate request queued");
        self.immediate
            .send(request)
            .map_err(|_| TrialError::QueueClosed)
    }

    pub fn push_scheduled(&self, request: TransitionRequest, delay: Duration) -> TrialResult<()> {
        debug!(
            trial = %request.trial,
            target = ?request.target,
            delay_ms = delay.as_millis() as u64,
            "scheduled request queued"
        );
        self.scheduled
            .send(ScheduledRequest { request, delay })
            .map_err(|_| TrialError::QueueClosed)
    }

    /// Queue a request on whichever queue the target stage belongs to.
    pub fn push_for_stage(
        &self,
        trial: &str,
        target: Stage,
        config: &TrialConfig,
    ) -> TrialResult<()> {
        let request = TransitionRequest::new(trial, target);
        if target.requires_delay() {
            self.push_scheduled(request, stage_delay(config, target))
        } else {
            self.push_immediate(request)
        }
    }
}
