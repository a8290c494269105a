//! Transition handlers and the factory that resolves them by stage.
//!
//! A handler performs one stage's real work (deploy a configuration, wait
//! out a warm-up, collect metrics, tear down). Its only contract with the
//! pipeline is the trial record: before returning it moves the record's
//! `current_stage` forward, or completes or fails the trial, through the
//! `TrialContext` it is given.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::debug;

use trialgrid_core::{TrialConfig, TrialId, TrialStatus};

use crate::error::{TrialError, TrialResult};
use crate::registry::{TrialRecord, TrialRegistry};
use crate::stage::{is_legal, HandlerKind, Stage, STAGE_TABLE};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Performs the work of one stage.
pub trait TransitionHandler: Send + Sync {
    fn handle(&self, ctx: TrialContext) -> BoxFuture<anyhow::Result<()>>;
}

impl<F> TransitionHandler for F
where
    F: Fn(TrialContext) -> BoxFuture<anyhow::Result<()>> + Send + Sync,
{
    fn handle(&self, ctx: TrialContext) -> BoxFuture<anyhow::Result<()>> {
        self(ctx)
    }
}

/// A handler's view of the trial it is running.
#[derive(Clone)]
pub struct TrialContext {
    trial: TrialId,
    stage: Stage,
    registry: TrialRegistry,
}

impl TrialContext {
    pub fn new(trial: &str, stage: Stage, registry: TrialRegistry) -> Self {
        Self {
            trial: trial.to_string(),
            stage,
            registry,
        }
    }

    pub fn trial_id(&self) -> &str {
        &self.trial
    }

    /// The stage this handler was invoked for.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub async fn record(&self) -> TrialResult<TrialRecord> {
        self.registry
            .get(&self.trial)
            .await
            .ok_or_else(|| TrialError::UnknownTrial(self.trial.clone()))
    }

    pub async fn config(&self) -> TrialResult<TrialConfig> {
        Ok(self.record().await?.config)
    }

    /// Record that the trial has reached the handler's stage.
    pub async fn advance(&self) -> TrialResult<()> {
        self.advance_to(self.stage).await
    }

    /// Record that the trial has reached `stage`.
    pub async fn advance_to(&self, stage: Stage) -> TrialResult<()> {
        self.registry
            .update(&self.trial, |record| {
                if !is_legal(record.current_stage, stage) {
                    return Err(TrialError::InvalidTransition {
                        trial: record.id.clone(),
                        from: record.current_stage,
                        to: stage,
                    });
                }
                record.current_stage = stage;
                Ok(())
            })
            .await??;
        debug!(trial = %self.trial, ?stage, "stage reached");
        Ok(())
    }

    /// Reach the handler's stage and finish the trial successfully.
    pub async fn complete(&self) -> TrialResult<()> {
        let stage = self.stage;
        self.registry
            .update(&self.trial, |record| {
                if record.current_stage < stage {
                    record.current_stage = stage;
                }
                record.set_status(TrialStatus::Completed);
            })
            .await
    }

    /// Store measured values on the trial record, replacing earlier
    /// values of the same name.
    pub async fn record_metrics(&self, metrics: BTreeMap<String, f64>) -> TrialResult<()> {
        self.registry
            .update(&self.trial, |record| record.metrics.extend(metrics))
            .await
    }

    pub async fn fail(&self, reason: &str) -> TrialResult<()> {
        self.registry.mark_failed(&self.trial, reason).await
    }
}

/// Stage → handler lookup.
pub struct HandlerFactory {
    handlers: HashMap<HandlerKind, Arc<dyn TransitionHandler>>,
}

impl HandlerFactory {
    pub fn builder() -> HandlerFactoryBuilder {
        HandlerFactoryBuilder::default()
    }

    /// The handler implementing `stage`. A missing mapping is a
    /// configuration bug and is reported, never skipped.
    pub fn resolve(&self, stage: Stage) -> TrialResult<Arc<dyn TransitionHandler>> {
        stage
            .handler()
            .and_then(|kind| self.handlers.get(&kind))
            .cloned()
            .ok_or(TrialError::NoHandlerForStage(stage))
    }
}

#[derive(Default)]
pub struct HandlerFactoryBuilder {
    handlers: HashMap<HandlerKind, Arc<dyn TransitionHandler>>,
}

impl HandlerFactoryBuilder {
    pub fn register(mut self, kind: HandlerKind, handler: Arc<dyn TransitionHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    /// Finish the factory. Every stage in the table that names a handler
    /// must have one registered.
    pub fn build(self) -> TrialResult<HandlerFactory> {
        for def in &STAGE_TABLE {
            if let Some(kind) = def.handler
                && !self.handlers.contains_key(&kind)
            {
                return Err(TrialError::NoHandlerForStage(def.stage));
            }
        }
        Ok(HandlerFactory {
            handlers: self.handlers,
        })
    }

    /// Finish without the completeness check. Stages without a handler
    /// fail when they are resolved.
    pub fn build_partial(self) -> HandlerFactory {
        HandlerFactory {
            handlers: self.handlers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{advancing_handler, full_factory, test_spec};

    #[test]
    fn build_fails_fast_on_missing_handler() {
        let result = HandlerFactory::builder()
            .register(HandlerKind::Deploy, advancing_handler())
            .register(HandlerKind::Warmup, advancing_handler())
            .build();
        assert!(matches!(
            result,
            Err(TrialError::NoHandlerForStage(Stage::Measure))
        ));
    }

    #[test]
    fn resolve_finds_every_transition_target() {
        let factory = full_factory();
        for def in STAGE_TABLE.iter().skip(1) {
            assert!(factory.resolve(def.stage).is_ok(), "{:?}", def.stage);
        }
    }

    #[test]
    fn resolve_initial_stage_is_an_error() {
        let factory = full_factory();
        assert!(matches!(
            factory.resolve(Stage::Init),
            Err(TrialError::NoHandlerForStage(Stage::Init))
        ));
    }

    #[test]
    fn partial_factory_reports_missing_stage_on_resolve() {
        let factory = HandlerFactory::builder()
            .register(HandlerKind::Deploy, advancing_handler())
            .build_partial();
        assert!(factory.resolve(Stage::Deploy).is_ok());
        assert!(matches!(
            factory.resolve(Stage::Complete),
            Err(TrialError::NoHandlerForStage(Stage::Complete))
        ));
    }

    #[tokio::test]
    async fn context_advance_and_complete() {
        let registry = TrialRegistry::new();
        registry.insert(test_spec("t1", "api")).await.unwrap();

        let ctx = TrialContext::new("t1", Stage::Deploy, registry.clone());
        ctx.advance().await.unwrap();
        assert_eq!(registry.get("t1").await.unwrap().current_stage, Stage::Deploy);

        // Moving backwards is rejected.
        let back = TrialContext::new("t1", Stage::Init, registry.clone());
        assert!(matches!(
            back.advance().await,
            Err(TrialError::InvalidTransition { .. })
        ));

        let measure = TrialContext::new("t1", Stage::Measure, registry.clone());
        measure.complete().await.unwrap();
        let record = registry.get("t1").await.unwrap();
        assert_eq!(record.current_stage, Stage::Measure);
        assert_eq!(record.status, TrialStatus::Completed);
    }

    #[tokio::test]
    async fn context_records_metrics() {
        let registry = TrialRegistry::new();
        registry.insert(test_spec("t1", "api")).await.unwrap();
        let ctx = TrialContext::new("t1", Stage::Measure, registry.clone());

        ctx.record_metrics(BTreeMap::from([("rps".to_string(), 10.0)]))
            .await
            .unwrap();
        ctx.record_metrics(BTreeMap::from([
            ("rps".to_string(), 12.5),
            ("p99_ms".to_string(), 80.0),
        ]))
        .await
        .unwrap();

        let metrics = registry.get("t1").await.unwrap().metrics;
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics["rps"], 12.5);
    }

    #[tokio::test]
    async fn context_on_unknown_trial() {
        let ctx = TrialContext::new("ghost", Stage::Deploy, TrialRegistry::new());
        assert_eq!(
            ctx.config().await.unwrap_err(),
            TrialError::UnknownTrial("ghost".to_string())
        );
    }
}
