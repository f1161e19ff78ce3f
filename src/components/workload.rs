//! Component backed by plain Kubernetes objects.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use super::manifests::{self, Manifest};
use super::{Component, Payload};
use crate::conditions::{LABEL_SPEC_HASH, MANAGER_NAME};
use crate::crd::StratusCluster;
use crate::error::{KubeResultExt, OperatorError, Result};

pub struct WorkloadComponent {
    client: Client,
    name: String,
}

impl WorkloadComponent {
    pub fn new(client: Client, name: &str) -> Self {
        Self {
            client,
            name: name.to_string(),
        }
    }

    fn namespace(cluster: &StratusCluster) -> String {
        cluster.namespace().unwrap_or_else(|| "default".to_string())
    }

    fn manifests(&self, cluster: &StratusCluster, payload: &Payload) -> Result<Vec<Manifest>> {
        manifests::build(cluster, &self.name, payload)
    }

    /// Readiness and deletion checks only look children up by name.
    fn probe_payload(cluster: &StratusCluster) -> Payload {
        Payload {
            topology: cluster.spec.topology,
            runtime: None,
            purge: false,
        }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn apply(&self, namespace: &str, manifest: Manifest) -> Result<()> {
        match manifest {
            Manifest::Deployment(obj) => apply_child(self.api(namespace), obj).await,
            Manifest::DaemonSet(obj) => apply_child(self.api(namespace), obj).await,
            Manifest::Service(obj) => apply_child(self.api(namespace), obj).await,
            Manifest::Ingress(obj) => apply_child(self.api(namespace), obj).await,
            Manifest::PersistentVolumeClaim(obj) => apply_child(self.api(namespace), obj).await,
        }
    }

    async fn remove(&self, namespace: &str, manifest: &Manifest) -> Result<()> {
        let name = manifest.name();
        match manifest {
            Manifest::Deployment(_) => delete_child::<Deployment>(self.api(namespace), &name).await,
            Manifest::DaemonSet(_) => delete_child::<DaemonSet>(self.api(namespace), &name).await,
            Manifest::Service(_) => {
                delete_child::<k8s_openapi::api::core::v1::Service>(self.api(namespace), &name)
                    .await
            }
            Manifest::Ingress(_) => {
                delete_child::<k8s_openapi::api::networking::v1::Ingress>(
                    self.api(namespace),
                    &name,
                )
                .await
            }
            Manifest::PersistentVolumeClaim(_) => {
                delete_child::<k8s_openapi::api::core::v1::PersistentVolumeClaim>(
                    self.api(namespace),
                    &name,
                )
                .await
            }
        }
    }

    async fn exists(&self, namespace: &str, manifest: &Manifest) -> Result<bool> {
        let name = manifest.name();
        let found = match manifest {
            Manifest::Deployment(_) => exists::<Deployment>(self.api(namespace), &name).await?,
            Manifest::DaemonSet(_) => exists::<DaemonSet>(self.api(namespace), &name).await?,
            Manifest::Service(_) => {
                exists::<k8s_openapi::api::core::v1::Service>(self.api(namespace), &name).await?
            }
            Manifest::Ingress(_) => {
                exists::<k8s_openapi::api::networking::v1::Ingress>(self.api(namespace), &name)
                    .await?
            }
            Manifest::PersistentVolumeClaim(_) => {
                exists::<k8s_openapi::api::core::v1::PersistentVolumeClaim>(
                    self.api(namespace),
                    &name,
                )
                .await?
            }
        };
        Ok(found)
    }

    async fn workload_ready(&self, namespace: &str, manifest: &Manifest) -> Result<bool> {
        let name = manifest.name();
        match manifest {
            Manifest::Deployment(_) => {
                let api: Api<Deployment> = self.api(namespace);
                let Some(current) = api.get_opt(&name).await.with_op("get deployment")? else {
                    return Ok(false);
                };
                Ok(deployment_ready(&current))
            }
            Manifest::DaemonSet(_) => {
                let api: Api<DaemonSet> = self.api(namespace);
                let Some(current) = api.get_opt(&name).await.with_op("get daemonset")? else {
                    return Ok(false);
                };
                Ok(daemonset_ready(&current))
            }
            other => self.exists(namespace, other).await,
        }
    }
}

#[async_trait]
impl Component for WorkloadComponent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deploy(&self, cluster: &StratusCluster, payload: &Payload) -> Result<()> {
        let namespace = Self::namespace(cluster);
        for manifest in self.manifests(cluster, payload)? {
            let kind = manifest.kind();
            let name = manifest.name();
            self.apply(&namespace, manifest)
                .await
                .map_err(|e| OperatorError::Component {
                    component: self.name.clone(),
                    message: format!("{} {}/{}: {}", kind, namespace, name, e),
                })?;
        }
        Ok(())
    }

    async fn delete(&self, cluster: &StratusCluster, payload: &Payload) -> Result<()> {
        let namespace = Self::namespace(cluster);
        for manifest in self.manifests(cluster, payload)? {
            if manifest.is_persistent() && !payload.purge {
                debug!(component = %self.name, name = %manifest.name(), "Keeping persistent volume claim");
                continue;
            }
            self.remove(&namespace, &manifest).await?;
        }
        Ok(())
    }

    async fn ready(&self, cluster: &StratusCluster) -> Result<bool> {
        let namespace = Self::namespace(cluster);
        for manifest in self.manifests(cluster, &Self::probe_payload(cluster))? {
            if !self.workload_ready(&namespace, &manifest).await? {
                debug!(component = %self.name, kind = manifest.kind(), name = %manifest.name(), "Not ready yet");
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn deleted(&self, cluster: &StratusCluster) -> Result<bool> {
        let namespace = Self::namespace(cluster);
        for manifest in self.manifests(cluster, &Self::probe_payload(cluster))? {
            // claims that were kept are not expected to disappear
            if manifest.is_persistent() {
                continue;
            }
            if self.exists(&namespace, &manifest).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn spec_hash_label<K: Resource>(obj: &K) -> Option<&str> {
    obj.meta()
        .labels
        .as_ref()
        .and_then(|labels| labels.get(LABEL_SPEC_HASH))
        .map(String::as_str)
}

fn up_to_date<K: Resource>(existing: &K, desired: &K) -> bool {
    match (spec_hash_label(existing), spec_hash_label(desired)) {
        (Some(live), Some(wanted)) => live == wanted,
        _ => false,
    }
}

/// Create the object if missing; otherwise server-side apply it unless the
/// live object's hash label matches the desired one.
async fn apply_child<K>(api: Api<K>, obj: K) -> Result<()>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Debug,
    K::DynamicType: Default,
{
    let name = obj.name_any();
    let kind = K::kind(&K::DynamicType::default()).to_string();

    match api.get_opt(&name).await.with_op(format!("get {}", kind))? {
        None => match api.create(&PostParams::default(), &obj).await {
            Ok(_) => {
                info!(kind = %kind, name = %name, "Created child");
                Ok(())
            }
            Err(e) => {
                let err = OperatorError::from(e);
                if err.is_already_exists() {
                    debug!(kind = %kind, name = %name, "Child already exists");
                    Ok(())
                } else {
                    Err(err)
                }
            }
        },
        Some(existing) if up_to_date(&existing, &obj) => {
            debug!(kind = %kind, name = %name, "Child up to date");
            Ok(())
        }
        Some(_) => {
            api.patch(
                &name,
                &PatchParams::apply(MANAGER_NAME).force(),
                &Patch::Apply(&obj),
            )
            .await
            .with_op(format!("apply {}", kind))?;
            info!(kind = %kind, name = %name, "Updated child");
            Ok(())
        }
    }
}

async fn delete_child<K>(api: Api<K>, name: &str) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    K::DynamicType: Default,
{
    let kind = K::kind(&K::DynamicType::default()).to_string();
    match api.delete(name, &DeleteParams::background()).await {
        Ok(_) => {
            info!(kind = %kind, name = %name, "Deleting child");
            Ok(())
        }
        Err(e) => {
            let err = OperatorError::from(e);
            if err.is_not_found() {
                Ok(())
            } else {
                Err(err)
            }
        }
    }
}

async fn exists<K>(api: Api<K>, name: &str) -> Result<bool>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    K::DynamicType: Default,
{
    let kind = K::kind(&K::DynamicType::default()).to_string();
    Ok(api.get_opt(name).await.with_op(format!("get {}", kind))?.is_some())
}

/// Rolled out and every desired replica ready.
pub fn deployment_ready(deployment: &Deployment) -> bool {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let Some(status) = deployment.status.as_ref() else {
        return false;
    };
    let observed = status.observed_generation.unwrap_or_default()
        >= deployment.metadata.generation.unwrap_or_default();
    observed
        && status.updated_replicas.unwrap_or_default() >= desired
        && status.ready_replicas.unwrap_or_default() >= desired
}

/// Scheduled on every eligible node and ready there.
pub fn daemonset_ready(daemonset: &DaemonSet) -> bool {
    let Some(status) = daemonset.status.as_ref() else {
        return false;
    };
    let observed = status.observed_generation.unwrap_or_default()
        >= daemonset.metadata.generation.unwrap_or_default();
    observed
        && status.desired_number_scheduled > 0
        && status.number_ready >= status.desired_number_scheduled
        && status.updated_number_scheduled.unwrap_or_default() >= status.desired_number_scheduled
}
