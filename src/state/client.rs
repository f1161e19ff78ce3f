//! Control-plane writes and lookups issued by the state machine.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::conditions::{CLUSTER_FINALIZER, RESTART_ANNOTATION};
use crate::crd::{ClusterSpec, StatusPatch, StratusCluster};
use crate::error::{KubeResultExt, Result};

/// Kubernetes operations the state machine depends on.
///
/// Abstracted so phase logic can be exercised against a mock.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Merge-patch the status sub-resource
    async fn patch_status(&self, namespace: &str, name: &str, patch: &StatusPatch) -> Result<()>;

    /// Write back a defaulted spec
    async fn patch_spec(&self, namespace: &str, name: &str, spec: &ClusterSpec) -> Result<()>;

    async fn add_finalizer(&self, cluster: &StratusCluster) -> Result<()>;

    async fn remove_finalizer(&self, cluster: &StratusCluster) -> Result<()>;

    async fn clear_restart_annotation(&self, namespace: &str, name: &str) -> Result<()>;

    async fn storage_class_exists(&self, name: &str) -> Result<bool>;

    /// Container runtime name reported by the nodes, e.g. "containerd"
    async fn detect_container_runtime(&self) -> Result<Option<String>>;
}

pub fn has_finalizer(cluster: &StratusCluster) -> bool {
    cluster.finalizers().iter().any(|f| f == CLUSTER_FINALIZER)
}

/// `containerd://1.7.2` → `containerd`
pub fn runtime_name(version: &str) -> Option<String> {
    let name = version.split("://").next()?.trim();
    (!name.is_empty()).then(|| name.to_string())
}

pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn clusters(&self, namespace: &str) -> Api<StratusCluster> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn patch_status(&self, namespace: &str, name: &str, patch: &StatusPatch) -> Result<()> {
        let body = json!({ "status": patch });
        self.clusters(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .with_op("patch status")?;
        Ok(())
    }

    async fn patch_spec(&self, namespace: &str, name: &str, spec: &ClusterSpec) -> Result<()> {
        let body = json!({ "spec": spec });
        self.clusters(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .with_op("patch spec")?;
        info!(cluster = %name, namespace = %namespace, "Wrote defaulted spec");
        Ok(())
    }

    async fn add_finalizer(&self, cluster: &StratusCluster) -> Result<()> {
        if has_finalizer(cluster) {
            return Ok(());
        }
        let mut finalizers = cluster.finalizers().to_vec();
        finalizers.push(CLUSTER_FINALIZER.to_string());
        // resourceVersion makes this fail with a conflict instead of
        // clobbering a concurrent finalizer edit
        let body = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": cluster.resource_version(),
            }
        });
        let namespace = cluster.namespace().unwrap_or_default();
        self.clusters(&namespace)
            .patch(&cluster.name_any(), &PatchParams::default(), &Patch::Merge(&body))
            .await
            .with_op("add finalizer")?;
        debug!(cluster = %cluster.name_any(), "Finalizer added");
        Ok(())
    }

    async fn remove_finalizer(&self, cluster: &StratusCluster) -> Result<()> {
        if !has_finalizer(cluster) {
            return Ok(());
        }
        let finalizers: Vec<String> = cluster
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != CLUSTER_FINALIZER)
            .cloned()
            .collect();
        let body = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": cluster.resource_version(),
            }
        });
        let namespace = cluster.namespace().unwrap_or_default();
        self.clusters(&namespace)
            .patch(&cluster.name_any(), &PatchParams::default(), &Patch::Merge(&body))
            .await
            .with_op("remove finalizer")?;
        info!(cluster = %cluster.name_any(), namespace = %namespace, "Finalizer removed");
        Ok(())
    }

    async fn clear_restart_annotation(&self, namespace: &str, name: &str) -> Result<()> {
        let body = json!({
            "metadata": {
                "annotations": { RESTART_ANNOTATION: null }
            }
        });
        self.clusters(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .with_op("clear restart annotation")?;
        Ok(())
    }

    async fn storage_class_exists(&self, name: &str) -> Result<bool> {
        let classes: Api<StorageClass> = Api::all(self.client.clone());
        Ok(classes
            .get_opt(name)
            .await
            .with_op("get storage class")?
            .is_some())
    }

    async fn detect_container_runtime(&self) -> Result<Option<String>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes
            .list(&ListParams::default().limit(10))
            .await
            .with_op("list nodes")?;
        Ok(list
            .items
            .iter()
            .filter_map(|node| node.status.as_ref()?.node_info.as_ref())
            .find_map(|info| runtime_name(&info.container_runtime_version)))
    }
}
