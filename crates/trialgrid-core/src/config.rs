//! trialgrid.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrialGridConfig {
    /// Workers running immediate transitions.
    #[serde(default = "PoolSizeConfig::regular")]
    pub pool: PoolSizeConfig,
    /// Workers running delayed (scheduled) transitions.
    #[serde(default = "PoolSizeConfig::scheduled")]
    pub scheduled_pool: PoolSizeConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub dry_run: DryRunConfig,
}

impl Default for TrialGridConfig {
    fn default() -> Self {
        Self {
            pool: PoolSizeConfig::regular(),
            scheduled_pool: PoolSizeConfig::scheduled(),
            pipeline: PipelineConfig::default(),
            retention: RetentionConfig::default(),
            dry_run: DryRunConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolSizeConfig {
    pub core_size: usize,
    pub max_size: usize,
}

impl PoolSizeConfig {
    fn regular() -> Self {
        Self {
            core_size: 4,
            max_size: 8,
        }
    }

    fn scheduled() -> Self {
        Self {
            core_size: 2,
            max_size: 4,
        }
    }
}

impl Default for PoolSizeConfig {
    fn default() -> Self {
        Self::regular()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Run consecutive stages that need no delay inside one dispatch.
    #[serde(default = "default_true")]
    pub batch_immediate_stages: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_immediate_stages: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetentionConfig {
    /// Seconds a finished trial stays in the registry. 0 keeps it forever.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// Settings for the daemon's simulated stage handlers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DryRunConfig {
    /// Seconds each simulated stage takes.
    #[serde(default)]
    pub stage_secs: u64,
    /// Override every trial's warmup/measurement windows (seconds).
    #[serde(default = "default_window_secs")]
    pub window_secs: Option<u64>,
}

impl Default for DryRunConfig {
    fn default() -> Self {
        Self {
            stage_secs: 0,
            window_secs: default_window_secs(),
        }
    }
}

fn default_window_secs() -> Option<u64> {
    Some(1)
}

fn default_true() -> bool {
    true
}

fn default_ttl_secs() -> u64 {
    3600
}

fn default_sweep_interval_secs() -> u64 {
    60
}

/// Rejected configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{pool}: core_size must be at least 1")]
    ZeroCoreSize { pool: &'static str },

    #[error("{pool}: core_size {core} exceeds max_size {max}")]
    CoreAboveMax {
        pool: &'static str,
        core: usize,
        max: usize,
    },

    #[error("retention.sweep_interval_secs must be at least 1")]
    ZeroSweepInterval,
}

impl TrialGridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate a TOML document.
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: TrialGridConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_pool("pool", &self.pool)?;
        check_pool("scheduled_pool", &self.scheduled_pool)?;
        if self.retention.ttl_secs > 0 && self.retention.sweep_interval_secs == 0 {
            return Err(ConfigError::ZeroSweepInterval);
        }
        Ok(())
    }
}

fn check_pool(pool: &'static str, size: &PoolSizeConfig) -> Result<(), ConfigError> {
    if size.core_size == 0 {
        return Err(ConfigError::ZeroCoreSize { pool });
    }
    if size.core_size > size.max_size {
        return Err(ConfigError::CoreAboveMax {
            pool,
            core: size.core_size,
            max: size.max_size,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_uses_defaults() {
        let config = TrialGridConfig::parse("").unwrap();
        assert_eq!(config.pool.core_size, 4);
        assert_eq!(config.scheduled_pool.core_size, 2);
        assert_eq!(config.scheduled_pool.max_size, 4);
        assert!(config.pipeline.batch_immediate_stages);
        assert_eq!(config.retention.ttl_secs, 3600);
    }

    #[test]
    fn parse_full_document() {
        let toml_str = r#"
[pool]
core_size = 2
max_size = 3

[scheduled_pool]
core_size = 1
max_size = 1

[pipeline]
batch_immediate_stages = false

[retention]
ttl_secs = 0
sweep_interval_secs = 0

[dry_run]
stage_secs = 2
"#;
        let config = TrialGridConfig::parse(toml_str).unwrap();
        assert_eq!(config.pool.max_size, 3);
        assert_eq!(config.scheduled_pool.max_size, 1);
        assert!(!config.pipeline.batch_immediate_stages);
        assert_eq!(config.retention.ttl_secs, 0);
        assert_eq!(config.dry_run.stage_secs, 2);
        assert_eq!(config.dry_run.window_secs, Some(1));
    }

    #[test]
    fn dry_run_window_default_ignores_section_presence() {
        let absent = TrialGridConfig::parse("").unwrap();
        let partial = TrialGridConfig::parse("[dry_run]\nstage_secs = 3\n").unwrap();
        let empty = TrialGridConfig::parse("[dry_run]\n").unwrap();

        assert_eq!(absent.dry_run.window_secs, Some(1));
        assert_eq!(partial.dry_run.window_secs, Some(1));
        assert_eq!(empty.dry_run, DryRunConfig::default());

        let explicit = TrialGridConfig::parse("[dry_run]\nwindow_secs = 0\n").unwrap();
        assert_eq!(explicit.dry_run.window_secs, Some(0));
    }

    #[test]
    fn rejects_core_above_max() {
        let toml_str = r#"
[pool]
core_size = 5
max_size = 2
"#;
        let err = TrialGridConfig::parse(toml_str).unwrap_err();
        let err = err.downcast::<ConfigError>().unwrap();
        assert_eq!(
            err,
            ConfigError::CoreAboveMax {
                pool: "pool",
                core: 5,
                max: 2
            }
        );
    }

    #[test]
    fn rejects_zero_core() {
        let mut config = TrialGridConfig::default();
        config.scheduled_pool.core_size = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroCoreSize {
                pool: "scheduled_pool"
            })
        );
    }

    #[test]
    fn from_file_roundtrips_toml() {
        let config = TrialGridConfig::default();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.to_toml_string().unwrap().as_bytes())
            .unwrap();

        let loaded = TrialGridConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }
}
