//! Scheduler error types.

use thiserror::Error;
use trialgrid_core::TrialId;

use crate::stage::Stage;

/// Errors that can occur while driving a trial through its stages.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TrialError {
    #[error("invalid transition for trial {trial}: {from:?} -> {to:?}")]
    InvalidTransition { trial: TrialId, from: Stage, to: Stage },

    #[error("stale request for trial {trial}: requested {requested:?}, recorded target {recorded:?}")]
    StaleRequest {
        trial: TrialId,
        requested: Stage,
        recorded: Stage,
    },

    #[error("unknown trial: {0}")]
    UnknownTrial(TrialId),

    #[error("trial already registered: {0}")]
    DuplicateTrial(TrialId),

    #[error("no handler registered for stage {0:?}")]
    NoHandlerForStage(Stage),

    #[error("trial {trial} is not at the head of deployment queue {deployment}")]
    NotDeploymentHead { trial: TrialId, deployment: String },

    #[error("trial {0} has not finished")]
    NotFinished(TrialId),

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("handler panicked for trial {0}")]
    HandlerPanicked(TrialId),

    #[error("work queue closed")]
    QueueClosed,

    #[error("worker pool closed: {0}")]
    PoolClosed(&'static str),
}

impl TrialError {
    /// Stale requests are a flavour of invalid transition: the request no
    /// longer matches what the registry wants to run.
    pub fn is_invalid_transition(&self) -> bool {
        matches!(
            self,
            TrialError::InvalidTransition { .. } | TrialError::StaleRequest { .. }
        )
    }
}

pub type TrialResult<T> = Result<T, TrialError>;
