//! One handler per lifecycle phase.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, info};

use super::{StateContext, StateHandler, Step};
use crate::components::{all_stages, catalog_entry, core_stages, third_party_stages};
use crate::conditions::RESTART_ANNOTATION;
use crate::crd::{ClusterPhase, StatusPatch};
use crate::error::{OperatorError, Result};

/// Phase → handler lookup.
pub struct HandlerTable {
    handlers: HashMap<ClusterPhase, Arc<dyn StateHandler>>,
}

impl HandlerTable {
    pub fn new(handlers: Vec<Arc<dyn StateHandler>>) -> Self {
        Self {
            handlers: handlers.into_iter().map(|h| (h.phase(), h)).collect(),
        }
    }

    /// The handler for every phase.
    pub fn standard() -> Self {
        Self::new(vec![
            Arc::new(InitHandler),
            Arc::new(DeployThirdPartyHandler),
            Arc::new(DeployOrchestHandler),
            Arc::new(UpdateHandler),
            Arc::new(StopHandler),
            Arc::new(StoppedHandler),
            Arc::new(StartHandler),
            Arc::new(RunningHandler),
            Arc::new(ErrorHandler),
        ])
    }

    pub fn get(&self, phase: ClusterPhase) -> Result<Arc<dyn StateHandler>> {
        self.handlers
            .get(&phase)
            .cloned()
            .ok_or_else(|| OperatorError::InvalidState(format!("no handler for phase {}", phase)))
    }
}

/// Status written when a deploy phase completes.
fn settled(ctx: &StateContext<'_>) -> StatusPatch {
    StatusPatch::settled(ctx.hash, ctx.generation()).clear_reason()
}

/// Checks the spec against the catalog and the cluster it lands on, and
/// returns the detected container runtime.
async fn validate(ctx: &StateContext<'_>) -> Result<String> {
    for app in &ctx.spec.third_parties {
        if catalog_entry(&app.name).is_none() {
            return Err(OperatorError::Validation(format!(
                "unsupported third-party application {:?}",
                app.name
            )));
        }
    }

    let client = &ctx.deps.client;
    if let Some(class) = &ctx.spec.storage.storage_class_name {
        if !client.storage_class_exists(class).await? {
            return Err(OperatorError::Validation(format!(
                "storage class {:?} does not exist",
                class
            )));
        }
    }

    client.detect_container_runtime().await?.ok_or_else(|| {
        OperatorError::Validation("no container runtime detected on any node".to_string())
    })
}

/// Validates the spec, writes defaults, adds the finalizer.
pub struct InitHandler;

#[async_trait]
impl StateHandler for InitHandler {
    fn phase(&self) -> ClusterPhase {
        ClusterPhase::Initializing
    }

    async fn enter(&self, ctx: &mut StateContext<'_>) -> Result<()> {
        ctx.state.attempts.clear();
        Ok(())
    }

    async fn reconcile(&self, ctx: &mut StateContext<'_>) -> Result<Step> {
        let runtime = validate(ctx).await?;
        let client = &ctx.deps.client;

        // finalizer first: its patch is pinned to the cached resourceVersion
        client.add_finalizer(ctx.cluster).await?;
        let mut defaulted = ctx.cluster.spec.clone();
        if defaulted.apply_defaults() {
            client
                .patch_spec(&ctx.namespace(), &ctx.name(), &defaulted)
                .await?;
        }

        info!(cluster = %ctx.name(), runtime = %runtime, "Cluster validated");
        Ok(Step::Transition {
            next: ClusterPhase::DeployingThirdParties,
            status: StatusPatch {
                container_runtime: Some(runtime),
                ..Default::default()
            }
            .clear_reason(),
        })
    }
}

/// Installs third-party applications, one stage each, in declared order.
pub struct DeployThirdPartyHandler;

#[async_trait]
impl StateHandler for DeployThirdPartyHandler {
    fn phase(&self) -> ClusterPhase {
        ClusterPhase::DeployingThirdParties
    }

    async fn enter(&self, ctx: &mut StateContext<'_>) -> Result<()> {
        ctx.state.attempts.clear();
        Ok(())
    }

    async fn reconcile(&self, ctx: &mut StateContext<'_>) -> Result<Step> {
        let stages = third_party_stages(ctx.spec);
        if ctx.deploy_stages(&stages, false).await? {
            Ok(Step::to(ClusterPhase::DeployingOrchest))
        } else {
            Ok(Step::RequeueAfter(ctx.deps.settings.poll_interval))
        }
    }
}

/// Installs the core components stage by stage.
pub struct DeployOrchestHandler;

#[async_trait]
impl StateHandler for DeployOrchestHandler {
    fn phase(&self) -> ClusterPhase {
        ClusterPhase::DeployingOrchest
    }

    async fn enter(&self, ctx: &mut StateContext<'_>) -> Result<()> {
        ctx.state.attempts.clear();
        Ok(())
    }

    async fn reconcile(&self, ctx: &mut StateContext<'_>) -> Result<Step> {
        if ctx.deploy_stages(&core_stages(), false).await? {
            // third parties dropped from the spec while the cluster was in Error
            let declared = all_stages(ctx.spec);
            ctx.prune(&declared).await?;
            Ok(Step::Transition {
                next: ClusterPhase::Running,
                status: settled(ctx),
            })
        } else {
            Ok(Step::RequeueAfter(ctx.deps.settings.poll_interval))
        }
    }
}

/// Redeploys every component with the new spec.
pub struct UpdateHandler;

#[async_trait]
impl StateHandler for UpdateHandler {
    fn phase(&self) -> ClusterPhase {
        ClusterPhase::Updating
    }

    async fn enter(&self, ctx: &mut StateContext<'_>) -> Result<()> {
        ctx.state.attempts.clear();
        ctx.state.updated.clear();
        ctx.state.updating_hash = Some(ctx.hash.to_string());
        Ok(())
    }

    async fn reconcile(&self, ctx: &mut StateContext<'_>) -> Result<Step> {
        // spec edited again mid-update: start the rollout over
        if ctx.state.updating_hash.as_deref() != Some(ctx.hash) {
            debug!(cluster = %ctx.name(), "Spec changed during update, restarting rollout");
            ctx.state.updated.clear();
            ctx.state.updating_hash = Some(ctx.hash.to_string());
        }
        validate(ctx).await?;

        let stages = all_stages(ctx.spec);
        if !ctx.deploy_stages(&stages, true).await? {
            return Ok(Step::RequeueAfter(ctx.deps.settings.poll_interval));
        }
        ctx.prune(&stages).await?;
        ctx.state.updated.clear();
        Ok(Step::Transition {
            next: ClusterPhase::Running,
            status: settled(ctx),
        })
    }
}

/// Tears every stage down, last to first.
pub struct StopHandler;

#[async_trait]
impl StateHandler for StopHandler {
    fn phase(&self) -> ClusterPhase {
        ClusterPhase::Stopping
    }

    async fn reconcile(&self, ctx: &mut StateContext<'_>) -> Result<Step> {
        let mut stages = all_stages(ctx.spec);
        let orphans = ctx.orphaned_components(&stages);
        if !orphans.is_empty() {
            // created earlier, no longer declared: they go first
            stages.insert(0, orphans);
        }

        let purge = ctx.is_deleting();
        if ctx.teardown_stages(&stages, purge).await? {
            info!(cluster = %ctx.name(), purge, "Teardown complete");
            Ok(Step::Transition {
                next: ClusterPhase::Stopped,
                status: StatusPatch {
                    observed_generation: ctx.generation(),
                    ..Default::default()
                },
            })
        } else {
            Ok(Step::RequeueAfter(ctx.deps.settings.poll_interval))
        }
    }
}

/// Everything removed. Waits for deletion, a restart, or an unpause.
pub struct StoppedHandler;

#[async_trait]
impl StateHandler for StoppedHandler {
    fn phase(&self) -> ClusterPhase {
        ClusterPhase::Stopped
    }

    async fn reconcile(&self, ctx: &mut StateContext<'_>) -> Result<Step> {
        if ctx.is_deleting() {
            ctx.deps.client.remove_finalizer(ctx.cluster).await?;
            return Ok(Step::Finished);
        }
        if ctx.spec.paused {
            return Ok(Step::Wait);
        }
        if ctx.cluster.annotations().contains_key(RESTART_ANNOTATION) {
            ctx.deps
                .client
                .clear_restart_annotation(&ctx.namespace(), &ctx.name())
                .await?;
            info!(cluster = %ctx.name(), "Restart requested");
        }
        Ok(Step::to(ClusterPhase::Starting))
    }
}

/// Brings a stopped cluster back: third parties, then core.
pub struct StartHandler;

#[async_trait]
impl StateHandler for StartHandler {
    fn phase(&self) -> ClusterPhase {
        ClusterPhase::Starting
    }

    async fn enter(&self, ctx: &mut StateContext<'_>) -> Result<()> {
        ctx.state.attempts.clear();
        if ctx.clear_teardown_events() {
            ctx.persist_events().await?;
        }
        Ok(())
    }

    async fn reconcile(&self, ctx: &mut StateContext<'_>) -> Result<Step> {
        validate(ctx).await?;
        let stages = all_stages(ctx.spec);
        if ctx.deploy_stages(&stages, false).await? {
            Ok(Step::Transition {
                next: ClusterPhase::Running,
                status: settled(ctx),
            })
        } else {
            Ok(Step::RequeueAfter(ctx.deps.settings.poll_interval))
        }
    }
}

/// Steady state. Only a hash change starts an update.
pub struct RunningHandler;

#[async_trait]
impl StateHandler for RunningHandler {
    fn phase(&self) -> ClusterPhase {
        ClusterPhase::Running
    }

    async fn reconcile(&self, ctx: &mut StateContext<'_>) -> Result<Step> {
        if ctx.state.observed_hash.as_deref() != Some(ctx.hash) {
            info!(
                cluster = %ctx.name(),
                observed = ?ctx.state.observed_hash,
                desired = %ctx.hash,
                "Spec drift detected"
            );
            return Ok(Step::to(ClusterPhase::Updating));
        }

        // metadata-only or no-op edit: acknowledge the generation, nothing to roll out
        let generation = ctx.generation();
        if generation.is_some() && generation != ctx.state.observed_generation {
            ctx.write_status(StatusPatch {
                observed_generation: generation,
                ..Default::default()
            })
            .await?;
            ctx.state.observed_generation = generation;
        }
        Ok(Step::RequeueAfter(ctx.deps.settings.resync_interval))
    }
}

/// Terminal until the spec is edited.
pub struct ErrorHandler;

#[async_trait]
impl StateHandler for ErrorHandler {
    fn phase(&self) -> ClusterPhase {
        ClusterPhase::Error
    }

    async fn reconcile(&self, ctx: &mut StateContext<'_>) -> Result<Step> {
        match (ctx.generation(), ctx.state.failed_generation) {
            (Some(current), Some(failed)) if current > failed => {
                info!(cluster = %ctx.name(), generation = current, "Spec edited, retrying from Initializing");
                let declared = all_stages(ctx.spec);
                if ctx.state.observed_hash.as_deref() != Some(ctx.hash)
                    && ctx.clear_deploy_events(&declared)
                {
                    // components created under the old spec are applied again
                    ctx.persist_events().await?;
                }
                Ok(Step::Transition {
                    next: ClusterPhase::Initializing,
                    status: StatusPatch::default().clear_reason(),
                })
            }
            _ => Ok(Step::Wait),
        }
    }
}
