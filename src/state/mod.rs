//! Cluster lifecycle state machine.
//!
//! One [`StateMachine`] per cluster key holds the current phase and the set of
//! recorded lifecycle events. Each phase has a [`StateHandler`] with an entry
//! hook and a reconcile step; a step either waits, asks to be requeued, or
//! requests a transition. Transitions are persisted to the status
//! sub-resource before the in-memory phase changes, so a restarted operator
//! resumes in the persisted phase.
//!
//! A machine is never driven by two workers at once. The work queue hands a
//! key to one worker at a time, and [`MachineMap`] turns any violation of
//! that into an error instead of a silent race.

mod client;
mod context;
mod handlers;
mod machine;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::components::ComponentRegistry;
use crate::conditions::ClusterEvents;
use crate::crd::{ClusterPhase, ClusterStatus, StatusPatch};
use crate::error::Result;

pub use client::{has_finalizer, runtime_name, ClusterClient, KubeClusterClient};
pub use context::StateContext;
pub use handlers::HandlerTable;
pub use machine::{acquire, MachineMap, SharedMachine, StateMachine};

#[cfg(test)]
pub use client::MockClusterClient;

/// Timeouts and retry limits for phase handlers.
#[derive(Debug, Clone)]
pub struct MachineSettings {
    /// Upper bound for a single component deploy, delete or probe
    pub operation_timeout: Duration,
    /// Failed deploys of one component before the cluster goes to Error
    pub create_retries: u32,
    /// Requeue delay while waiting for components to become ready or go away
    pub poll_interval: Duration,
    /// Requeue delay for a settled Running cluster
    pub resync_interval: Duration,
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(120),
            create_retries: 5,
            poll_interval: Duration::from_secs(5),
            resync_interval: Duration::from_secs(300),
        }
    }
}

/// Collaborators shared by every machine.
pub struct StateDeps {
    pub client: Arc<dyn ClusterClient>,
    pub registry: Arc<ComponentRegistry>,
    pub settings: MachineSettings,
}

/// Result of one reconcile step.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Nothing to do until the cluster changes
    Wait,
    /// Check again after a delay
    RequeueAfter(Duration),
    /// Move to `next`, writing `status` together with the new phase
    Transition { next: ClusterPhase, status: StatusPatch },
    /// Teardown complete and finalizer removed; forget the machine
    Finished,
}

impl Step {
    pub fn to(next: ClusterPhase) -> Self {
        Step::Transition {
            next,
            status: StatusPatch::default(),
        }
    }
}

/// What the controller should do with the key after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Requeue(Duration),
    Wait,
    Finished,
}

/// Per-phase behaviour.
#[async_trait]
pub trait StateHandler: Send + Sync {
    fn phase(&self) -> ClusterPhase;

    /// Runs once when the phase is entered, and again for the recovered phase
    /// after a restart. Must be idempotent.
    async fn enter(&self, _ctx: &mut StateContext<'_>) -> Result<()> {
        Ok(())
    }

    async fn reconcile(&self, ctx: &mut StateContext<'_>) -> Result<Step>;
}

/// In-memory machine state; everything except `attempts`, `updated` and
/// `entered` is recovered from the persisted status.
#[derive(Debug, Clone, Default)]
pub struct MachineState {
    pub phase: ClusterPhase,
    pub events: ClusterEvents,
    pub observed_hash: Option<String>,
    pub observed_generation: Option<i64>,
    pub failed_generation: Option<i64>,
    pub container_runtime: Option<String>,
    /// Failed deploys per component in the current phase
    pub attempts: HashMap<String, u32>,
    /// Components redeployed during the current update
    pub updated: HashSet<String>,
    /// Hash the current update is rolling out
    pub updating_hash: Option<String>,
    /// Whether the entry hook of `phase` has completed
    pub entered: bool,
}

impl MachineState {
    pub fn from_status(status: Option<&ClusterStatus>) -> Self {
        let Some(status) = status else {
            return Self::default();
        };
        Self {
            phase: status.phase,
            events: ClusterEvents::from_conditions(&status.conditions),
            observed_hash: status.observed_hash.clone(),
            observed_generation: status.observed_generation,
            failed_generation: status.failed_generation,
            container_runtime: status.container_runtime.clone(),
            ..Default::default()
        }
    }

    /// Mirror a persisted patch in memory.
    fn absorb(&mut self, patch: &StatusPatch) {
        if let Some(phase) = patch.phase {
            self.phase = phase;
        }
        if let Some(hash) = &patch.observed_hash {
            self.observed_hash = Some(hash.clone());
        }
        if let Some(generation) = patch.observed_generation {
            self.observed_generation = Some(generation);
        }
        if let Some(generation) = patch.failed_generation {
            self.failed_generation = Some(generation);
        }
        if let Some(runtime) = &patch.container_runtime {
            self.container_runtime = Some(runtime.clone());
        }
    }
}
