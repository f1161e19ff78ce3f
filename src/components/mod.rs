//! Deployable units of a Stratus cluster.
//!
//! Every core service and every supported third-party application is a
//! [`Component`] registered by name in the [`ComponentRegistry`]. The state
//! machine only ever talks to components through the registry; it knows the
//! stage order but nothing about the objects a component creates.

pub mod manifests;
pub mod workload;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::Client;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::crd::{ClusterSpec, StratusCluster, Topology};
use crate::error::{OperatorError, Result};

pub use workload::WorkloadComponent;

// ---------------------------------------------------------------------------
// Stage table
// ---------------------------------------------------------------------------

/// Core components in creation order.
pub const CORE_COMPONENTS: &[&str] = &[
    "resources", "database", "broker", "auth", "worker", "api", "web", "agent",
];

/// Core stages in creation order. A stage starts only after every component
/// of the previous stage is created and ready; teardown walks this backwards.
pub const CORE_STAGES: &[&[&str]] = &[
    &["resources"],
    &["database", "broker"],
    &["auth"],
    &["worker", "api"],
    &["web", "agent"],
];

/// A third-party application the operator knows how to install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogEntry {
    pub name: &'static str,
    pub image: &'static str,
    pub port: Option<i32>,
}

/// Supported third-party applications.
pub const THIRD_PARTY_CATALOG: &[CatalogEntry] = &[
    CatalogEntry {
        name: "ingress-nginx",
        image: "registry.k8s.io/ingress-nginx/controller:v1.11.2",
        port: Some(80),
    },
    CatalogEntry {
        name: "cert-manager",
        image: "quay.io/jetstack/cert-manager-controller:v1.15.3",
        port: None,
    },
    CatalogEntry {
        name: "metrics-server",
        image: "registry.k8s.io/metrics-server/metrics-server:v0.7.2",
        port: Some(443),
    },
    CatalogEntry {
        name: "local-path-provisioner",
        image: "docker.io/rancher/local-path-provisioner:v0.0.29",
        port: None,
    },
];

pub fn catalog_entry(name: &str) -> Option<&'static CatalogEntry> {
    THIRD_PARTY_CATALOG.iter().find(|entry| entry.name == name)
}

/// Third-party stages for a spec: one per application, in declared order.
pub fn third_party_stages(spec: &ClusterSpec) -> Vec<Vec<String>> {
    spec.third_parties
        .iter()
        .map(|app| vec![app.name.clone()])
        .collect()
}

pub fn core_stages() -> Vec<Vec<String>> {
    CORE_STAGES
        .iter()
        .map(|stage| stage.iter().map(|name| name.to_string()).collect())
        .collect()
}

/// Every stage of a cluster in creation order: third parties, then core.
pub fn all_stages(spec: &ClusterSpec) -> Vec<Vec<String>> {
    let mut stages = third_party_stages(spec);
    stages.extend(core_stages());
    stages
}

// ---------------------------------------------------------------------------
// Component contract
// ---------------------------------------------------------------------------

/// What a component needs besides the cluster object itself.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    pub topology: Topology,
    /// Container runtime detected at Init
    pub runtime: Option<String>,
    /// Delete persistent data too; set when the cluster itself is deleted
    pub purge: bool,
}

/// A deployable unit. All operations must be idempotent.
#[async_trait]
pub trait Component: Send + Sync {
    fn name(&self) -> &str;

    /// Create or update the component's objects.
    async fn deploy(&self, cluster: &StratusCluster, payload: &Payload) -> Result<()>;

    /// Remove the component's objects. Missing objects are not an error.
    async fn delete(&self, cluster: &StratusCluster, payload: &Payload) -> Result<()>;

    /// Whether the deployed objects are serving.
    async fn ready(&self, cluster: &StratusCluster) -> Result<bool>;

    /// Whether every deleted object is gone.
    async fn deleted(&self, cluster: &StratusCluster) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Name → component map, filled at start-up.
#[derive(Default)]
pub struct ComponentRegistry {
    components: RwLock<HashMap<String, Arc<dyn Component>>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a kube-backed component for every core service and
    /// every catalog application.
    pub async fn with_workloads(client: Client) -> Self {
        let registry = Self::new();
        for name in CORE_COMPONENTS {
            registry
                .register(Arc::new(WorkloadComponent::new(client.clone(), name)))
                .await;
        }
        for entry in THIRD_PARTY_CATALOG {
            registry
                .register(Arc::new(WorkloadComponent::new(client.clone(), entry.name)))
                .await;
        }
        info!(components = ?registry.names().await, "Component registry initialised");
        registry
    }

    /// Add a component, replacing any previous one with the same name.
    pub async fn register(&self, component: Arc<dyn Component>) {
        let name = component.name().to_string();
        debug!(component = %name, "Registering component");
        self.components.write().await.insert(name, component);
    }

    /// Look up a component. An unknown name is a programming error.
    pub async fn get(&self, name: &str) -> Result<Arc<dyn Component>> {
        self.components
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| OperatorError::UnknownComponent(name.to_string()))
    }

    /// Registered names, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.components.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}
