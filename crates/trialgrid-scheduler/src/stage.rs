//! Stage table — the fixed, ordered lifecycle every trial walks through.
//!
//! ```text
//! Init(0) ─► Deploy(1) ─► Warmup(2, delayed) ─► Measure(3) ─► Complete(4)
//! ```
//!
//! A transition is legal only when it moves strictly forward. Stages that
//! require a delay are dispatched through the scheduled queue so the
//! warm-up window elapses before their handler runs.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use trialgrid_core::TrialConfig;

/// One step of a trial's lifecycle. Declaration order is ordinal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    Deploy,
    Warmup,
    Measure,
    Complete,
}

/// Which transition handler implements a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    /// Apply the trial's resource configuration to the workload.
    Deploy,
    /// Check the workload settled after the warm-up window.
    Warmup,
    /// Collect metrics over the measurement window.
    Measure,
    /// Tear down or roll back the trial configuration.
    Cleanup,
}

/// Static definition of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageDef {
    pub stage: Stage,
    pub requires_delay: bool,
    /// `None` only for the initial stage, which is never a transition target.
    pub handler: Option<HandlerKind>,
}

/// The stage table, in ordinal order.
pub static STAGE_TABLE: [StageDef; 5] = [
    StageDef {
        stage: Stage::Init,
        requires_delay: false,
        handler: None,
    },
    StageDef {
        stage: Stage::Deploy,
        requires_delay: false,
        handler: Some(HandlerKind::Deploy),
    },
    StageDef {
        stage: Stage::Warmup,
        requires_delay: true,
        handler: Some(HandlerKind::Warmup),
    },
    StageDef {
        stage: Stage::Measure,
        requires_delay: false,
        handler: Some(HandlerKind::Measure),
    },
    StageDef {
        stage: Stage::Complete,
        requires_delay: false,
        handler: Some(HandlerKind::Cleanup),
    },
];

impl Stage {
    pub const INITIAL: Stage = Stage::Init;
    pub const TERMINAL: Stage = Stage::Complete;

    pub fn ordinal(self) -> usize {
        self as usize
    }

    pub fn from_ordinal(ordinal: usize) -> Option<Stage> {
        STAGE_TABLE.get(ordinal).map(|def| def.stage)
    }

    pub fn def(self) -> &'static StageDef {
        &STAGE_TABLE[self.ordinal()]
    }

    pub fn requires_delay(self) -> bool {
        self.def().requires_delay
    }

    pub fn handler(self) -> Option<HandlerKind> {
        self.def().handler
    }

    pub fn is_terminal(self) -> bool {
        self == Stage::TERMINAL
    }
}

/// A transition is legal iff it moves strictly forward.
pub fn is_legal(current: Stage, target: Stage) -> bool {
    target.ordinal() > current.ordinal()
}

/// The stage after `current`, or `current` itself at the end of the table.
pub fn next_stage(current: Stage) -> Stage {
    Stage::from_ordinal(current.ordinal() + 1).unwrap_or(current)
}

/// Furthest stage reachable from `current` without crossing a delay.
///
/// Returns `None` when the very next stage needs a delay or `current` is
/// terminal. Running off the end of the table yields the terminal stage.
pub fn furthest_reachable_without_delay(current: Stage) -> Option<Stage> {
    STAGE_TABLE[current.ordinal() + 1..]
        .iter()
        .take_while(|def| !def.requires_delay)
        .last()
        .map(|def| def.stage)
}

/// How long a delayed stage waits before its handler runs.
pub fn stage_delay(config: &TrialConfig, stage: Stage) -> Duration {
    match stage {
        Stage::Warmup => Duration::from_secs(config.warmup_secs),
        Stage::Measure => Duration::from_secs(config.measurement_secs),
        _ => Duration::ZERO,
    }
}
