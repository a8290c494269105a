//! Fixtures shared by the unit tests.

use std::sync::Arc;

use trialgrid_core::{DeploymentKey, TrialConfig, TrialSpec};

use crate::handler::{BoxFuture, HandlerFactory, TransitionHandler, TrialContext};
use crate::stage::HandlerKind;

pub fn test_spec(id: &str, deployment: &str) -> TrialSpec {
    TrialSpec {
        id: id.to_string(),
        deployment: DeploymentKey::new("default", deployment),
        config: TrialConfig::new("exp", 0, "app"),
        notify_on_completion: true,
    }
}

/// Moves the trial to the stage it was invoked for.
pub fn advancing_handler() -> Arc<dyn TransitionHandler> {
    Arc::new(|ctx: TrialContext| -> BoxFuture<anyhow::Result<()>> {
        Box::pin(async move {
            ctx.advance().await?;
            Ok(())
        })
    })
}

/// Reaches the invoked stage and completes the trial.
pub fn completing_handler() -> Arc<dyn TransitionHandler> {
    Arc::new(|ctx: TrialContext| -> BoxFuture<anyhow::Result<()>> {
        Box::pin(async move {
            ctx.complete().await?;
            Ok(())
        })
    })
}

/// A factory using `handler` for every stage.
pub fn factory_with(handler: Arc<dyn TransitionHandler>) -> HandlerFactory {
    [
        HandlerKind::Deploy,
        HandlerKind::Warmup,
        HandlerKind::Measure,
        HandlerKind::Cleanup,
    ]
    .into_iter()
    .fold(HandlerFactory::builder(), |builder, kind| {
        builder.register(kind, Arc::clone(&handler))
    })
    .build_partial()
}

pub fn full_factory() -> HandlerFactory {
    factory_with(advancing_handler())
}
