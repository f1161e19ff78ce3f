//! StratusCluster Custom Resource Definition
//!
//! Declares the desired topology of a Stratus installation (database,
//! broker, workers, API, web front-end, auth and node agents, plus any
//! third-party applications it depends on) and reports its lifecycle phase.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::components::CORE_COMPONENTS;

/// StratusCluster is the Schema for the stratusclusters API
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "stratus.io",
    version = "v1alpha1",
    kind = "StratusCluster",
    namespaced,
    status = "ClusterStatus",
    shortname = "stc",
    printcolumn = r#"{"name":"Topology","type":"string","jsonPath":".spec.topology"}"#,
    printcolumn = r#"{"name":"Paused","type":"boolean","jsonPath":".spec.paused"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Single-node or multi-node layout
    #[serde(default)]
    pub topology: Topology,

    /// Tear the cluster down (keeping the resource) while true
    #[serde(default)]
    pub paused: bool,

    /// Per-component deployment templates keyed by component name
    #[serde(default)]
    pub components: BTreeMap<String, ComponentTemplate>,

    /// Third-party applications deployed before the core, in order
    #[serde(default)]
    pub third_parties: Vec<ThirdPartyApp>,

    /// Storage configuration
    #[serde(default)]
    pub storage: ClusterStorage,

    /// Ingress for the web front-end
    #[serde(default)]
    pub ingress: Option<IngressConfig>,
}

impl ClusterSpec {
    /// Fill in a template for every core component that lacks one.
    ///
    /// Returns true when the spec changed and needs to be written back.
    pub fn apply_defaults(&mut self) -> bool {
        let mut changed = false;
        for name in CORE_COMPONENTS {
            if !self.components.contains_key(*name) {
                self.components
                    .insert(name.to_string(), ComponentTemplate::default_for(name));
                changed = true;
            }
        }
        changed
    }

    /// Template for a component, falling back to the built-in default.
    pub fn template(&self, component: &str) -> ComponentTemplate {
        self.components
            .get(component)
            .cloned()
            .unwrap_or_else(|| ComponentTemplate::default_for(component))
    }

    pub fn third_party(&self, name: &str) -> Option<&ThirdPartyApp> {
        self.third_parties.iter().find(|app| app.name == name)
    }
}

/// Cluster layout
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum Topology {
    /// Everything on one node
    #[default]
    SingleNode,
    /// Agents on every node, replicated services
    MultiNode,
}

/// Deployment template for one sub-component
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentTemplate {
    /// Container image
    #[serde(default)]
    pub image: Option<String>,

    /// Image pull policy
    #[serde(default = "default_pull_policy")]
    pub image_pull_policy: String,

    /// Replica count for multi-node clusters
    #[serde(default)]
    pub replicas: Option<i32>,

    /// Additional environment variables
    #[serde(default)]
    pub env: Vec<EnvVar>,

    /// Resource requirements for the container
    #[serde(default)]
    pub resources: ResourceRequirements,
}

impl ComponentTemplate {
    pub fn default_for(component: &str) -> Self {
        Self {
            image: Some(format!("{}/{}:{}", DEFAULT_REGISTRY, component, DEFAULT_TAG)),
            image_pull_policy: default_pull_policy(),
            ..Default::default()
        }
    }

    pub fn image_for(&self, component: &str) -> String {
        self.image
            .clone()
            .unwrap_or_else(|| format!("{}/{}:{}", DEFAULT_REGISTRY, component, DEFAULT_TAG))
    }
}

/// A third-party application the cluster depends on
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ThirdPartyApp {
    /// Catalog name (e.g. "cert-manager")
    pub name: String,
    /// Image override
    #[serde(default)]
    pub image: Option<String>,
    /// Service port, if the application exposes one
    #[serde(default)]
    pub port: Option<i32>,
    /// Free-form configuration, passed to the application as environment
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

/// Resource requirements for containers
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    /// Resource limits
    #[serde(default)]
    pub limits: ResourceList,
    /// Resource requests
    #[serde(default)]
    pub requests: ResourceList,
}

/// Resource quantities
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
pub struct ResourceList {
    /// CPU limit/request (e.g., "500m", "2")
    #[serde(default)]
    pub cpu: Option<String>,
    /// Memory limit/request (e.g., "512Mi", "2Gi")
    #[serde(default)]
    pub memory: Option<String>,
}

/// Storage configuration for the cluster
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStorage {
    /// Storage class name for PVCs; must exist when set
    #[serde(default)]
    pub storage_class_name: Option<String>,
    /// Size of the persistent volume (e.g., "10Gi")
    #[serde(default = "default_storage_size")]
    pub size: String,
}

impl Default for ClusterStorage {
    fn default() -> Self {
        Self {
            storage_class_name: None,
            size: default_storage_size(),
        }
    }
}

/// Ingress configuration for the web front-end
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressConfig {
    /// Public host name
    pub host: String,
    /// Ingress class
    #[serde(default)]
    pub class_name: Option<String>,
}

/// Environment variable
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    /// Environment variable name
    pub name: String,
    /// Environment variable value
    #[serde(default)]
    pub value: Option<String>,
}

/// Status of the StratusCluster
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Current phase of the cluster
    #[serde(default)]
    pub phase: ClusterPhase,
    /// Generation last confirmed as applied (only moves in Running or Stopped)
    #[serde(default)]
    pub observed_generation: Option<i64>,
    /// Hash of the last successfully applied spec
    #[serde(default)]
    pub observed_hash: Option<String>,
    /// Lifecycle events recorded so far
    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,
    /// Machine-readable reason for the current phase
    #[serde(default)]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(default)]
    pub message: Option<String>,
    /// Generation whose spec drove the cluster into Error
    #[serde(default)]
    pub failed_generation: Option<i64>,
    /// Container runtime detected on the nodes
    #[serde(default)]
    pub container_runtime: Option<String>,
    /// Last update timestamp
    #[serde(default)]
    pub last_updated: Option<String>,
}

/// Phase of the cluster lifecycle
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq, Hash,
)]
pub enum ClusterPhase {
    /// First sight of the cluster; validating and defaulting
    #[default]
    Initializing,
    /// Installing required third-party applications
    DeployingThirdParties,
    /// Installing the core components stage by stage
    DeployingOrchest,
    /// Rolling out a changed spec
    Updating,
    /// Tearing components down, last stage first
    Stopping,
    /// Every component removed
    Stopped,
    /// Bringing a stopped cluster back
    Starting,
    /// Steady state
    Running,
    /// Validation or deployment failed; waits for a spec edit
    Error,
}

impl ClusterPhase {
    /// Whether `next` is a legal successor of this phase.
    pub fn can_transition_to(self, next: ClusterPhase) -> bool {
        use ClusterPhase::*;
        matches!(
            (self, next),
            (Initializing, DeployingThirdParties | Error | Stopping)
                | (DeployingThirdParties, DeployingOrchest | Error | Stopping)
                | (DeployingOrchest, Running | Error | Stopping)
                | (Updating, Running | Error | Stopping)
                | (Stopping, Stopped)
                | (Stopped, Starting)
                | (Starting, Running | Error | Stopping)
                | (Running, Updating | Stopping)
                | (Error, Initializing | Stopping)
        )
    }

    /// Phases in which `observedGeneration` may be written.
    pub fn is_settled(self) -> bool {
        matches!(self, ClusterPhase::Running | ClusterPhase::Stopped)
    }
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A recorded lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    /// Event name, e.g. "databaseCreated"
    pub event: String,
    /// First time the event was recorded
    #[serde(default)]
    pub last_transition_time: Option<String>,
    /// Last time the event was re-confirmed
    #[serde(default)]
    pub last_heartbeat_time: Option<String>,
}

/// JSON merge patch for the status sub-resource. Unset fields are left alone.
#[derive(Debug, Clone, Serialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<ClusterPhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<ClusterCondition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_generation: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_runtime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

impl StatusPatch {
    /// Record the spec as applied. Only valid together with a settled phase.
    pub fn settled(hash: impl Into<String>, generation: Option<i64>) -> Self {
        Self {
            observed_hash: Some(hash.into()),
            observed_generation: generation,
            ..Default::default()
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>, message: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self.message = Some(message.into());
        self
    }

    /// Blank out a reason left by an earlier phase.
    pub fn clear_reason(mut self) -> Self {
        self.reason = Some(String::new());
        self.message = Some(String::new());
        self
    }

    /// Check the patch against the phase the cluster will be in once applied.
    pub fn check(&self, effective_phase: ClusterPhase) -> crate::Result<()> {
        if self.observed_generation.is_some() && !effective_phase.is_settled() {
            return Err(crate::OperatorError::InvalidState(format!(
                "observedGeneration may not change in phase {}",
                effective_phase
            )));
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn apply_to(&self, status: &mut ClusterStatus) {
        if let Some(phase) = self.phase {
            status.phase = phase;
        }
        if let Some(generation) = self.observed_generation {
            status.observed_generation = Some(generation);
        }
        if let Some(hash) = &self.observed_hash {
            status.observed_hash = Some(hash.clone());
        }
        if let Some(conditions) = &self.conditions {
            status.conditions = conditions.clone();
        }
        if let Some(reason) = &self.reason {
            status.reason = Some(reason.clone());
        }
        if let Some(message) = &self.message {
            status.message = Some(message.clone());
        }
        if let Some(generation) = self.failed_generation {
            status.failed_generation = Some(generation);
        }
        if let Some(runtime) = &self.container_runtime {
            status.container_runtime = Some(runtime.clone());
        }
    }
}

const DEFAULT_REGISTRY: &str = "ghcr.io/stratus";
const DEFAULT_TAG: &str = "latest";

// Default value functions
fn default_pull_policy() -> String {
    "IfNotPresent".to_string()
}

fn default_storage_size() -> String {
    "10Gi".to_string()
}
