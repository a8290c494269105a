//! Trial input and run summary.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::Serialize;

use trialgrid_core::{TrialSpec, TrialStatus};
use trialgrid_scheduler::{Stage, TrialRecord};

/// Read a JSON array of trial specs.
pub fn load_trials(path: &Path) -> anyhow::Result<Vec<TrialSpec>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read trials file {}", path.display()))?;
    let specs: Vec<TrialSpec> = serde_json::from_str(&raw)
        .with_context(|| format!("invalid trials file {}", path.display()))?;
    Ok(specs)
}

/// Replace every trial's warm-up and measurement windows.
pub fn override_windows(specs: &mut [TrialSpec], window_secs: Option<u64>) {
    if let Some(secs) = window_secs {
        for spec in specs {
            spec.config.warmup_secs = secs;
            spec.config.measurement_secs = secs;
        }
    }
}

/// One line of the run summary.
#[derive(Debug, Serialize)]
pub struct TrialSummary {
    pub id: String,
    pub deployment: String,
    pub status: TrialStatus,
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub metrics: BTreeMap<String, f64>,
}

impl From<TrialRecord> for TrialSummary {
    fn from(record: TrialRecord) -> Self {
        Self {
            id: record.id,
            deployment: record.deployment.to_string(),
            status: record.status,
            stage: record.current_stage,
            failure: record.failure,
            metrics: record.metrics,
        }
    }
}
