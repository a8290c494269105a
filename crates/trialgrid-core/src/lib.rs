pub mod config;
pub mod types;

pub use config::{
    DryRunConfig, PipelineConfig, PoolSizeConfig, RetentionConfig, TrialGridConfig,
};
pub use types::*;
