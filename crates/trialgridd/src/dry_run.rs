//! Dry-run transition handlers.
//!
//! Stand-ins for the cluster-facing handlers: each stage sleeps for the
//! configured stage time, logs what it would have done, and moves the trial
//! record forward. The measurement stage records synthetic metrics derived
//! from the trial's resources so the summary has something to show.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use trialgrid_core::{DryRunConfig, TrialConfig};
use trialgrid_scheduler::{
    stage_delay, BoxFuture, HandlerFactory, HandlerKind, Stage, TransitionHandler, TrialContext,
    TrialResult,
};

const HANDLER_KINDS: [HandlerKind; 4] = [
    HandlerKind::Deploy,
    HandlerKind::Warmup,
    HandlerKind::Measure,
    HandlerKind::Cleanup,
];

/// Simulates one kind of stage work.
#[derive(Debug, Clone, Copy)]
pub struct DryRunHandler {
    kind: HandlerKind,
    stage_time: Duration,
}

impl DryRunHandler {
    pub fn new(kind: HandlerKind, stage_time: Duration) -> Self {
        Self { kind, stage_time }
    }

    async fn run(self, ctx: TrialContext) -> anyhow::Result<()> {
        let record = ctx.record().await?;
        tokio::time::sleep(self.stage_time).await;

        match self.kind {
            HandlerKind::Deploy => {
                let resources = &record.config.resources;
                info!(
                    trial = %record.id,
                    deployment = %record.deployment,
                    container = %record.config.container,
                    cpu_request = ?resources.cpu_request,
                    cpu_limit = ?resources.cpu_limit,
                    memory_request_mib = ?resources.memory_request_mib,
                    memory_limit_mib = ?resources.memory_limit_mib,
                    "dry-run: applying trial resources"
                );
                ctx.advance().await?;
            }
            HandlerKind::Warmup => {
                debug!(trial = %record.id, warmup_secs = record.config.warmup_secs, "dry-run: warm-up elapsed");
                ctx.advance().await?;
            }
            HandlerKind::Measure => {
                let window = stage_delay(&record.config, Stage::Measure);
                debug!(trial = %record.id, window = ?window, "dry-run: measuring");
                tokio::time::sleep(window).await;
                let metrics = synthetic_metrics(&record.config);
                info!(trial = %record.id, metrics = metrics.len(), "dry-run: measurement recorded");
                ctx.record_metrics(metrics).await?;
                ctx.advance().await?;
            }
            HandlerKind::Cleanup => {
                info!(trial = %record.id, deployment = %record.deployment, "dry-run: restoring deployment");
                ctx.complete().await?;
            }
        }
        Ok(())
    }
}

impl TransitionHandler for DryRunHandler {
    fn handle(&self, ctx: TrialContext) -> BoxFuture<anyhow::Result<()>> {
        Box::pin(self.run(ctx))
    }
}

/// A factory with a dry-run handler for every stage.
pub fn factory(config: &DryRunConfig) -> TrialResult<HandlerFactory> {
    let stage_time = Duration::from_secs(config.stage_secs);
    HANDLER_KINDS
        .into_iter()
        .fold(HandlerFactory::builder(), |builder, kind| {
            builder.register(kind, Arc::new(DryRunHandler::new(kind, stage_time)))
        })
        .build()
}

/// Plausible-looking usage figures: a trial uses most of what it requests,
/// and latency falls as CPU grows.
///
/// When the trial names metric queries, exactly those names are reported;
/// a name the simulation has no figure for reads as zero.
fn synthetic_metrics(config: &TrialConfig) -> BTreeMap<String, f64> {
    let resources = &config.resources;
    let mut metrics = BTreeMap::new();
    if let Some(cpu) = resources.cpu_request.filter(|cpu| *cpu > 0.0) {
        let usage = cpu * 0.6;
        metrics.insert("cpu_usage_cores".to_string(), usage);
        metrics.insert("response_time_ms".to_string(), 200.0 / cpu);
        if let Some(limit) = resources.cpu_limit.filter(|limit| *limit > 0.0) {
            metrics.insert("cpu_limit_utilization".to_string(), (usage / limit).min(1.0));
        }
    }
    if let Some(memory) = resources.memory_request_mib {
        let usage = memory * 0.7;
        metrics.insert("memory_usage_mib".to_string(), usage);
        if let Some(limit) = resources.memory_limit_mib.filter(|limit| *limit > 0.0) {
            metrics.insert("memory_limit_utilization".to_string(), (usage / limit).min(1.0));
        }
    }

    if config.metrics.is_empty() {
        return metrics;
    }
    config
        .metrics
        .iter()
        .map(|(name, query)| {
            let value = metrics.get(name).copied().unwrap_or_default();
            debug!(metric = %name, query = %query, value, "dry-run: metric query");
            (name.clone(), value)
        })
        .collect()
}
