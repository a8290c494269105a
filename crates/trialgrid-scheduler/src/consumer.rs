//! Queue consumers: one long-running task per work queue.
//!
//! Each consumer takes requests in FIFO order, checks them against the
//! registry, and hands the survivors to its worker pool. A bad request is
//! logged and dropped; the loop only ends on shutdown or once every
//! producer has gone away.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{TrialError, TrialResult};
use crate::pool::{TaskHandle, WorkerPools};
use crate::queue::{ScheduledRequest, TransitionRequest};
use crate::registry::TrialRegistry;
use crate::runner::TrialRunner;

/// Counters for one consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ConsumerStats {
    pub dispatched: u64,
    pub rejected: u64,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    rejected: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ConsumerStats {
        ConsumerStats {
            dispatched: self.dispatched.load(Ordering::SeqCst),
            rejected: self.rejected.load(Ordering::SeqCst),
        }
    }
}

/// Validates dequeued requests and submits them to the pools.
#[derive(Clone)]
pub struct Dispatcher {
    registry: TrialRegistry,
    runner: Arc<TrialRunner>,
    pools: Arc<WorkerPools>,
    immediate: Arc<Counters>,
    scheduled: Arc<Counters>,
}

impl Dispatcher {
    pub fn new(registry: TrialRegistry, runner: Arc<TrialRunner>, pools: Arc<WorkerPools>) -> Self {
        Self {
            registry,
            runner,
            pools,
            immediate: Arc::default(),
            scheduled: Arc::default(),
        }
    }

    /// A request is current only while the registry still records its
    /// target for the trial.
    pub async fn validate(&self, request: &TransitionRequest) -> TrialResult<()> {
        match self.registry.target_of(&request.trial).await {
            None => Err(TrialError::UnknownTrial(request.trial.clone())),
            Some(recorded) if recorded != request.target => Err(TrialError::StaleRequest {
                trial: request.trial.clone(),
                requested: request.target,
                recorded,
            }),
            Some(_) => Ok(()),
        }
    }

    pub async fn dispatch_immediate(&self, request: TransitionRequest) -> TrialResult<TaskHandle> {
        self.admit(&self.immediate, &request).await?;
        let runner = Arc::clone(&self.runner);
        Ok(self.pools.regular.submit(async move { runner.run(request).await }))
    }

    pub async fn dispatch_scheduled(&self, scheduled: ScheduledRequest) -> TrialResult<TaskHandle> {
        self.admit(&self.scheduled, &scheduled.request).await?;
        let runner = Arc::clone(&self.runner);
        let ScheduledRequest { request, delay } = scheduled;
        Ok(self
            .pools
            .scheduled
            .submit_after(delay, async move { runner.run(request).await }))
    }

    async fn admit(&self, counters: &Counters, request: &TransitionRequest) -> TrialResult<()> {
        match self.validate(request).await {
            Ok(()) => {
                counters.dispatched.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                counters.rejected.fetch_add(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    pub fn immediate_stats(&self) -> ConsumerStats {
        self.immediate.snapshot()
    }

    pub fn scheduled_stats(&self) -> ConsumerStats {
        self.scheduled.snapshot()
    }
}

/// Consume the immediate queue until shutdown.
pub async fn run_immediate_consumer(
    dispatcher: Dispatcher,
    mut queue: mpsc::UnboundedReceiver<TransitionRequest>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("immediate consumer started");
    loop {
        tokio::select! {
            request = queue.recv() => {
                let Some(request) = request else {
                    debug!("immediate queue closed");
                    break;
                };
                let trial = request.trial.clone();
                if let Err(e) = dispatcher.dispatch_immediate(request).await {
                    warn!(%trial, error = %e, "immediate request dropped");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    info!("immediate consumer stopped");
}

/// Consume the scheduled queue until shutdown.
pub async fn run_scheduled_consumer(
    dispatcher: Dispatcher,
    mut queue: mpsc::UnboundedReceiver<ScheduledRequest>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("scheduled consumer started");
    loop {
        tokio::select! {
            scheduled = queue.recv() => {
                let Some(scheduled) = scheduled else {
                    debug!("scheduled queue closed");
                    break;
                };
                let trial = scheduled.request.trial.clone();
                if let Err(e) = dispatcher.dispatch_scheduled(scheduled).await {
                    warn!(%trial, error = %e, "scheduled request dropped");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    info!("scheduled consumer stopped");
}
