//! Shared types used across TrialGrid crates.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque, unique identifier for a trial.
pub type TrialId = String;

// ── Deployment key ─────────────────────────────────────────────────

/// The workload a trial runs against. Trials sharing a key are serialized.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeploymentKey {
    pub namespace: String,
    pub name: String,
}

impl DeploymentKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for DeploymentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

// ── Trial status ───────────────────────────────────────────────────

/// Lifecycle status of a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrialStatus {
    /// Queued behind another trial for the same deployment.
    Waiting,
    /// Admitted; stages are being driven.
    InProgress,
    Completed,
    Failed,
}

impl TrialStatus {
    /// True once the trial will never run another stage.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TrialStatus::Completed | TrialStatus::Failed)
    }

    pub fn label(&self) -> &'static str {
        match self {
            TrialStatus::Waiting => "WAITING",
            TrialStatus::InProgress => "IN_PROGRESS",
            TrialStatus::Completed => "COMPLETED",
            TrialStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ── Trial configuration ────────────────────────────────────────────

/// Container resources applied to the workload for one trial.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerResources {
    /// CPU request in cores.
    pub cpu_request: Option<f64>,
    pub cpu_limit: Option<f64>,
    /// Memory request in MiB.
    pub memory_request_mib: Option<f64>,
    pub memory_limit_mib: Option<f64>,
}

/// Immutable description of what a trial deploys and measures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialConfig {
    pub experiment_name: String,
    pub trial_number: u32,
    /// Container inside the deployment the resources apply to.
    pub container: String,
    #[serde(default)]
    pub resources: ContainerResources,
    /// Time the workload is left to warm up after deployment.
    #[serde(default = "default_warmup_secs")]
    pub warmup_secs: u64,
    /// Length of the measurement window.
    #[serde(default = "default_measurement_secs")]
    pub measurement_secs: u64,
    /// Metric queries collected during measurement, keyed by metric name.
    #[serde(default)]
    pub metrics: HashMap<String, String>,
}

fn default_warmup_secs() -> u64 {
    30
}

fn default_measurement_secs() -> u64 {
    60
}

impl TrialConfig {
    /// Minimal config for an experiment trial.
    pub fn new(experiment_name: &str, trial_number: u32, container: &str) -> Self {
        Self {
            experiment_name: experiment_name.to_string(),
            trial_number,
            container: container.to_string(),
            resources: ContainerResources::default(),
            warmup_secs: default_warmup_secs(),
            measurement_secs: default_measurement_secs(),
            metrics: HashMap::new(),
        }
    }
}

/// A request to run a trial, as handed to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialSpec {
    pub id: TrialId,
    pub deployment: DeploymentKey,
    pub config: TrialConfig,
    /// Promote the next queued trial for the deployment when this one ends.
    #[serde(default = "default_notify")]
    pub notify_on_completion: bool,
}

fn default_notify() -> bool {
    true
}
