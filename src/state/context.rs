//! Shared deployment algorithm used by the phase handlers.

use std::future::Future;

use chrono::Utc;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::{MachineState, StateDeps};
use crate::components::{Payload, THIRD_PARTY_CATALOG};
use crate::conditions::{
    created, deleted, deleting, deploying, EVENT_CREATED, EVENT_DELETED, EVENT_DELETING,
    EVENT_DEPLOYING,
};
use crate::crd::{ClusterSpec, StatusPatch, StratusCluster};
use crate::error::{OperatorError, Result};

/// Everything a handler sees during one pass.
pub struct StateContext<'a> {
    pub cluster: &'a StratusCluster,
    /// The cluster spec with defaults applied
    pub spec: &'a ClusterSpec,
    /// Drift hash of `spec`
    pub hash: &'a str,
    pub deps: &'a StateDeps,
    pub state: &'a mut MachineState,
}

impl<'a> StateContext<'a> {
    pub fn namespace(&self) -> String {
        self.cluster.namespace().unwrap_or_default()
    }

    pub fn name(&self) -> String {
        self.cluster.name_any()
    }

    pub fn generation(&self) -> Option<i64> {
        self.cluster.metadata.generation
    }

    pub fn is_deleting(&self) -> bool {
        self.cluster.metadata.deletion_timestamp.is_some()
    }

    pub fn payload(&self, purge: bool) -> Payload {
        Payload {
            topology: self.spec.topology,
            runtime: self.state.container_runtime.clone(),
            purge,
        }
    }

    /// Write a status patch, stamping `lastUpdated`.
    pub async fn write_status(&self, mut patch: StatusPatch) -> Result<()> {
        patch.last_updated = Some(Utc::now().to_rfc3339());
        self.deps
            .client
            .patch_status(&self.namespace(), &self.name(), &patch)
            .await
    }

    pub async fn persist_events(&self) -> Result<()> {
        self.write_status(StatusPatch {
            conditions: Some(self.state.events.to_conditions()),
            ..Default::default()
        })
        .await
    }

    async fn bounded<T>(&self, what: String, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.deps.settings.operation_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(OperatorError::Timeout(what)),
        }
    }

    /// Deploy one component, recording `Deploying` then `Created`.
    ///
    /// A failure leaves no `Created` event so the next pass retries just this
    /// component. After `create_retries` failures the error becomes terminal.
    pub async fn create(&mut self, component: &str) -> Result<()> {
        let unit = self.deps.registry.get(component).await?;

        self.state.events.record(&deploying(component));
        self.persist_events().await?;

        let payload = self.payload(false);
        let result = self
            .bounded(format!("deploying {}", component), unit.deploy(self.cluster, &payload))
            .await;

        match result {
            Ok(()) => {
                self.state.attempts.remove(component);
                self.state.events.remove(&deploying(component));
                self.state.events.record(&created(component));
                self.persist_events().await?;
                info!(cluster = %self.name(), component, "Component deployed");
                Ok(())
            }
            Err(err) => {
                let attempts = self.state.attempts.entry(component.to_string()).or_insert(0);
                *attempts += 1;
                let attempts = *attempts;
                warn!(cluster = %self.name(), component, attempts, error = %err, "Component deploy failed");
                if attempts >= self.deps.settings.create_retries {
                    Err(OperatorError::RetriesExhausted {
                        component: component.to_string(),
                        attempts,
                        message: err.to_string(),
                    })
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Walk `stages` in order. Returns true once every component is created and
    /// ready; false when a stage is still waiting on readiness.
    ///
    /// With `redeploy` set, components already created are deployed again
    /// once per update, tracked in `state.updated`.
    pub async fn deploy_stages(&mut self, stages: &[Vec<String>], redeploy: bool) -> Result<bool> {
        for stage in stages {
            for component in stage {
                let done = if redeploy {
                    self.state.updated.contains(component)
                } else {
                    self.state.events.contains(&created(component))
                };
                if done {
                    continue;
                }
                self.create(component).await?;
                if redeploy {
                    self.state.updated.insert(component.clone());
                }
            }

            for component in stage {
                let unit = self.deps.registry.get(component).await?;
                let ready = self
                    .bounded(format!("probing {}", component), unit.ready(self.cluster))
                    .await?;
                if !ready {
                    debug!(cluster = %self.name(), component = %component, "Waiting for component to become ready");
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Walk `stages` last to first, deleting every component of a stage and
    /// waiting until all of them are gone before touching the previous stage.
    pub async fn teardown_stages(&mut self, stages: &[Vec<String>], purge: bool) -> Result<bool> {
        let payload = self.payload(purge);
        for stage in stages.iter().rev() {
            for component in stage {
                if self.state.events.contains(&deleted(component))
                    || self.state.events.contains(&deleting(component))
                {
                    continue;
                }
                let unit = self.deps.registry.get(component).await?;
                self.bounded(format!("deleting {}", component), unit.delete(self.cluster, &payload))
                    .await?;
                self.state.events.record(&deleting(component));
                self.persist_events().await?;
                info!(cluster = %self.name(), component = %component, "Component deleting");
            }

            let mut pending = false;
            for component in stage {
                if self.state.events.contains(&deleted(component)) {
                    continue;
                }
                let unit = self.deps.registry.get(component).await?;
                let gone = self
                    .bounded(format!("probing {}", component), unit.deleted(self.cluster))
                    .await?;
                if gone {
                    self.forget_component(component);
                    self.state.events.record(&deleted(component));
                    self.persist_events().await?;
                } else {
                    pending = true;
                }
            }
            if pending {
                debug!(cluster = %self.name(), "Waiting for stage teardown");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Components with recorded events that no longer appear in `stages`,
    /// e.g. a third-party application dropped from the spec.
    pub fn orphaned_components(&self, stages: &[Vec<String>]) -> Vec<String> {
        let mut orphans: Vec<String> = Vec::new();
        for event in self.state.events.names() {
            let component = [EVENT_CREATED, EVENT_DEPLOYING, EVENT_DELETING]
                .iter()
                .find_map(|suffix| event.strip_suffix(suffix));
            let Some(component) = component else {
                continue;
            };
            let known = stages.iter().any(|stage| stage.iter().any(|c| c == component));
            let supported = THIRD_PARTY_CATALOG.iter().any(|entry| entry.name == component);
            if !known && supported && !orphans.iter().any(|o| o == component) {
                orphans.push(component.to_string());
            }
        }
        orphans
    }

    /// Delete orphaned components and drop their events.
    pub async fn prune(&mut self, stages: &[Vec<String>]) -> Result<()> {
        let orphans = self.orphaned_components(stages);
        if orphans.is_empty() {
            return Ok(());
        }
        let payload = self.payload(false);
        for component in &orphans {
            let unit = self.deps.registry.get(component).await?;
            self.bounded(format!("deleting {}", component), unit.delete(self.cluster, &payload))
                .await?;
            self.forget_component(component);
            info!(cluster = %self.name(), component = %component, "Removed component no longer in spec");
        }
        self.persist_events().await
    }

    fn forget_component(&mut self, component: &str) {
        for event in [deploying(component), created(component), deleting(component)] {
            self.state.events.remove(&event);
        }
    }

    /// Forget that the components of `stages` were deployed, so the next
    /// deploy phase applies each of them again.
    pub fn clear_deploy_events(&mut self, stages: &[Vec<String>]) -> bool {
        let mut cleared = false;
        for component in stages.iter().flatten() {
            cleared |= self.state.events.remove(&created(component));
            cleared |= self.state.events.remove(&deploying(component));
        }
        cleared
    }

    /// Drop teardown bookkeeping so a restart deploys everything again.
    pub fn clear_teardown_events(&mut self) -> bool {
        let deleted = self.state.events.remove_suffix(EVENT_DELETED);
        let deleting = self.state.events.remove_suffix(EVENT_DELETING);
        deleted || deleting
    }
}
