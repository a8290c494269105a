//! trialgrid-scheduler — the trial stage pipeline.
//!
//! Drives every trial through the fixed stage table, one deployment at a
//! time, dispatching stage work onto bounded worker pools.
//!
//! # Architecture
//!
//! ```text
//! Pipeline::submit
//!   └── TrialManager (one active trial per deployment)
//!         └── WorkQueues ── immediate ──► consumer ──► regular pool ───┐
//!                       └── scheduled ──► consumer ──► scheduled pool ─┤ (after delay)
//!                                                                      ▼
//!                                 TrialRunner ── HandlerFactory ── TransitionHandler
//!                                   │                                   │
//!                                   ├── next stage ─► WorkQueues        ▼
//!                                   └── finished ──► TrialManager   TrialRegistry
//! ```

pub mod consumer;
pub mod error;
pub mod handler;
pub mod manager;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod retention;
pub mod runner;
pub mod stage;

#[cfg(test)]
pub(crate) mod test_support;

pub use consumer::{ConsumerStats, Dispatcher};
pub use error::{TrialError, TrialResult};
pub use handler::{BoxFuture, HandlerFactory, HandlerFactoryBuilder, TransitionHandler, TrialContext};
pub use manager::TrialManager;
pub use pipeline::Pipeline;
pub use pool::{PoolSize, PoolStats, TaskHandle, WorkerPool, WorkerPools};
pub use queue::{ScheduledRequest, TransitionRequest, WorkQueues};
pub use registry::{TrialRecord, TrialRegistry};
pub use retention::RetentionSweeper;
pub use runner::TrialRunner;
pub use stage::{
    furthest_reachable_without_delay, is_legal, next_stage, stage_delay, HandlerKind, Stage,
    StageDef, STAGE_TABLE,
};
