//! Trial registry — the shared table of trial records.
//!
//! Every component (consumers, runners, the trial manager, handlers) goes
//! through this handle; mutation happens under the write lock only.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use trialgrid_core::{DeploymentKey, TrialConfig, TrialId, TrialSpec, TrialStatus};

use crate::error::{TrialError, TrialResult};
use crate::stage::{is_legal, Stage};

/// Lifecycle record for one trial.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialRecord {
    pub id: TrialId,
    pub deployment: DeploymentKey,
    pub config: TrialConfig,
    pub current_stage: Stage,
    pub target_stage: Stage,
    pub status: TrialStatus,
    pub notify_on_completion: bool,
    /// Metric values recorded by the measurement stage.
    pub metrics: BTreeMap<String, f64>,
    /// Why the trial failed, when it did.
    pub failure: Option<String>,
    pub cancel_requested: bool,
    /// A runner is executing a handler for this trial right now.
    pub in_flight: bool,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
    pub updated_at: u64,
}

impl TrialRecord {
    /// A freshly submitted trial: waiting at the initial stage.
    pub fn from_spec(spec: TrialSpec) -> Self {
        let now = epoch_secs();
        Self {
            id: spec.id,
            deployment: spec.deployment,
            config: spec.config,
            current_stage: Stage::INITIAL,
            target_stage: Stage::INITIAL,
            status: TrialStatus::Waiting,
            notify_on_completion: spec.notify_on_completion,
            metrics: BTreeMap::new(),
            failure: None,
            cancel_requested: false,
            in_flight: false,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    /// Move into `status`, stamping `finished_at` for terminal statuses.
    pub fn set_status(&mut self, status: TrialStatus) {
        let now = epoch_secs();
        self.status = status;
        self.updated_at = now;
        if status == TrialStatus::InProgress && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if status.is_terminal() && self.finished_at.is_none() {
            self.finished_at = Some(now);
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.failure = Some(reason.into());
        self.set_status(TrialStatus::Failed);
    }
}

/// Shared trial-id → record table. Cheap to clone.
#[derive(Clone, Default)]
pub struct TrialRegistry {
    records: Arc<RwLock<HashMap<TrialId, TrialRecord>>>,
}

impl TrialRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new trial. Identifiers must be unique.
    pub async fn insert(&self, spec: TrialSpec) -> TrialResult<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&spec.id) {
            return Err(TrialError::DuplicateTrial(spec.id));
        }
        debug!(trial = %spec.id, deployment = %spec.deployment, "trial registered");
        records.insert(spec.id.clone(), TrialRecord::from_spec(spec));
        Ok(())
    }

    /// Snapshot of a record.
    pub async fn get(&self, id: &str) -> Option<TrialRecord> {
        self.records.read().await.get(id).cloned()
    }

    pub async fn target_of(&self, id: &str) -> Option<Stage> {
        self.records.read().await.get(id).map(|r| r.target_stage)
    }

    pub async fn status_of(&self, id: &str) -> Option<TrialStatus> {
        self.records.read().await.get(id).map(|r| r.status)
    }

    /// Mutate a record under the write lock.
    pub async fn update<F, R>(&self, id: &str, f: F) -> TrialResult<R>
    where
        F: FnOnce(&mut TrialRecord) -> R,
    {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| TrialError::UnknownTrial(id.to_string()))?;
        let out = f(record);
        record.updated_at = epoch_secs();
        Ok(out)
    }

    /// Point a trial at a new target stage. The target must lie ahead of
    /// the trial's current stage.
    pub async fn retarget(&self, id: &str, target: Stage) -> TrialResult<()> {
        self.update(id, |record| {
            if !is_legal(record.current_stage, target) {
                return Err(TrialError::InvalidTransition {
                    trial: record.id.clone(),
                    from: record.current_stage,
                    to: target,
                });
            }
            record.target_stage = target;
            Ok(())
        })
        .await?
    }

    pub async fn mark_failed(&self, id: &str, reason: &str) -> TrialResult<()> {
        self.update(id, |record| record.fail(reason)).await
    }

    pub async fn list(&self) -> Vec<TrialRecord> {
        let mut all: Vec<TrialRecord> = self.records.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    pub async fn remove(&self, id: &str) -> Option<TrialRecord> {
        self.records.write().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Drop finished trials whose `finished_at` is at or before `cutoff`,
    /// except those listed in `pinned`.
    pub async fn evict_finished_before(&self, cutoff: u64, pinned: &[TrialId]) -> Vec<TrialId> {
        let mut records = self.records.write().await;
        let expired: Vec<TrialId> = records
            .values()
            .filter(|r| r.status.is_terminal() && r.finished_at.is_some_and(|t| t <= cutoff))
            .filter(|r| !pinned.contains(&r.id))
            .map(|r| r.id.clone())
            .collect();
        for id in &expired {
            records.remove(id);
        }
        expired
    }
}

/// Current Unix epoch in seconds.
pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_spec;

    #[tokio::test]
    async fn insert_and_get() {
        let registry = TrialRegistry::new();
        registry.insert(test_spec("t1", "api")).await.unwrap();

        let record = registry.get("t1").await.unwrap();
        assert_eq!(record.status, TrialStatus::Waiting);
        assert_eq!(record.current_stage, Stage::Init);
        assert_eq!(record.target_stage, Stage::Init);
        assert!(record.started_at.is_none());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let registry = TrialRegistry::new();
        registry.insert(test_spec("t1", "api")).await.unwrap();
        let err = registry.insert(test_spec("t1", "api")).await.unwrap_err();
        assert_eq!(err, TrialError::DuplicateTrial("t1".to_string()));
    }

    #[tokio::test]
    async fn update_unknown_trial_fails() {
        let registry = TrialRegistry::new();
        let err = registry.update("nope", |_| ()).await.unwrap_err();
        assert_eq!(err, TrialError::UnknownTrial("nope".to_string()));
    }

    #[tokio::test]
    async fn retarget_must_move_forward() {
        let registry = TrialRegistry::new();
        registry.insert(test_spec("t1", "api")).await.unwrap();
        registry
            .update("t1", |r| r.current_stage = Stage::Warmup)
            .await
            .unwrap();

        let err = registry.retarget("t1", Stage::Deploy).await.unwrap_err();
        assert!(matches!(err, TrialError::InvalidTransition { .. }));

        registry.retarget("t1", Stage::Complete).await.unwrap();
        assert_eq!(registry.target_of("t1").await, Some(Stage::Complete));
    }

    #[tokio::test]
    async fn mark_failed_records_reason_and_finish_time() {
        let registry = TrialRegistry::new();
        registry.insert(test_spec("t1", "api")).await.unwrap();
        registry.mark_failed("t1", "boom").await.unwrap();

        let record = registry.get("t1").await.unwrap();
        assert_eq!(record.status, TrialStatus::Failed);
        assert_eq!(record.failure.as_deref(), Some("boom"));
        assert!(record.finished_at.is_some());
    }

    #[tokio::test]
    async fn eviction_only_touches_finished_trials() {
        let registry = TrialRegistry::new();
        registry.insert(test_spec("done", "api")).await.unwrap();
        registry.insert(test_spec("running", "web")).await.unwrap();
        registry
            .update("done", |r| {
                r.set_status(TrialStatus::Completed);
                r.finished_at = Some(100);
            })
            .await
            .unwrap();
        registry
            .update("running", |r| r.set_status(TrialStatus::InProgress))
            .await
            .unwrap();

        assert!(registry.evict_finished_before(99, &[]).await.is_empty());
        assert!(registry
            .evict_finished_before(100, &["done".to_string()])
            .await
            .is_empty());
        assert_eq!(
            registry.evict_finished_before(100, &[]).await,
            vec!["done".to_string()]
        );
        assert!(registry.get("done").await.is_none());
        assert!(registry.get("running").await.is_some());
    }

    #[test]
    fn set_status_stamps_times_once() {
        let mut record = TrialRecord::from_spec(test_spec("t1", "api"));
        record.set_status(TrialStatus::InProgress);
        let started = record.started_at;
        assert!(started.is_some());
        record.set_status(TrialStatus::InProgress);
        assert_eq!(record.started_at, started);
        assert!(record.finished_at.is_none());
        record.set_status(TrialStatus::Completed);
        assert!(record.finished_at.is_some());
    }
}
