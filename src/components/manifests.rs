//! Child object templates for cluster components.
//!
//! Every object carries a deterministic name (`<cluster>-<component>`), a
//! controller owner reference to the cluster, and a label with the hash of
//! the object itself, used to skip no-op updates.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, ResourceRequirements, Service,
    ServicePort, ServiceSpec, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};

use super::{catalog_entry, Payload};
use crate::conditions::{
    LABEL_COMPONENT, LABEL_INSTANCE, LABEL_MANAGED_BY, LABEL_NAME, LABEL_SPEC_HASH, MANAGER_NAME,
};
use crate::crd::{ComponentTemplate, StratusCluster, Topology};
use crate::error::{OperatorError, Result};
use crate::hash::compute_hash;

const DATA_MOUNT_PATH: &str = "/var/lib/stratus";

/// Workload controller used for a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Workload {
    None,
    Deployment,
    DaemonSet,
}

/// Shape of a core component.
#[derive(Debug, Clone, Copy)]
struct Layout {
    workload: Workload,
    port: Option<i32>,
    /// Scaled out on multi-node clusters
    replicated: bool,
    /// Mounts the shared data volume
    data_volume: bool,
}

fn core_layout(component: &str) -> Option<Layout> {
    let layout = |workload, port, replicated, data_volume| Layout {
        workload,
        port,
        replicated,
        data_volume,
    };
    Some(match component {
        "resources" => layout(Workload::None, None, false, false),
        "database" => layout(Workload::Deployment, Some(5432), false, true),
        "broker" => layout(Workload::Deployment, Some(5672), false, true),
        "auth" => layout(Workload::Deployment, Some(8443), false, false),
        "worker" => layout(Workload::Deployment, None, true, false),
        "api" => layout(Workload::Deployment, Some(8080), true, false),
        "web" => layout(Workload::Deployment, Some(80), true, false),
        "agent" => layout(Workload::DaemonSet, Some(9100), false, false),
        _ => return None,
    })
}

/// One child object of a component.
#[derive(Debug, Clone, PartialEq)]
pub enum Manifest {
    Deployment(Deployment),
    DaemonSet(DaemonSet),
    Service(Service),
    Ingress(Ingress),
    PersistentVolumeClaim(PersistentVolumeClaim),
}

impl Manifest {
    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Manifest::Deployment(obj) => obj.meta(),
            Manifest::DaemonSet(obj) => obj.meta(),
            Manifest::Service(obj) => obj.meta(),
            Manifest::Ingress(obj) => obj.meta(),
            Manifest::PersistentVolumeClaim(obj) => obj.meta(),
        }
    }

    pub fn name(&self) -> String {
        self.meta().name.clone().unwrap_or_default()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Manifest::Deployment(_) => "Deployment",
            Manifest::DaemonSet(_) => "DaemonSet",
            Manifest::Service(_) => "Service",
            Manifest::Ingress(_) => "Ingress",
            Manifest::PersistentVolumeClaim(_) => "PersistentVolumeClaim",
        }
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Manifest::Deployment(obj) => obj.meta_mut(),
            Manifest::DaemonSet(obj) => obj.meta_mut(),
            Manifest::Service(obj) => obj.meta_mut(),
            Manifest::Ingress(obj) => obj.meta_mut(),
            Manifest::PersistentVolumeClaim(obj) => obj.meta_mut(),
        }
    }

    /// Value of the spec-hash label.
    pub fn spec_hash(&self) -> Option<&str> {
        self.meta()
            .labels
            .as_ref()
            .and_then(|labels| labels.get(LABEL_SPEC_HASH))
            .map(String::as_str)
    }

    /// Label the object with the hash of its own desired state.
    fn stamped(mut self) -> Result<Self> {
        let hash = match &self {
            Manifest::Deployment(obj) => compute_hash(obj)?,
            Manifest::DaemonSet(obj) => compute_hash(obj)?,
            Manifest::Service(obj) => compute_hash(obj)?,
            Manifest::Ingress(obj) => compute_hash(obj)?,
            Manifest::PersistentVolumeClaim(obj) => compute_hash(obj)?,
        };
        self.meta_mut()
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(LABEL_SPEC_HASH.to_string(), hash);
        Ok(self)
    }

    /// Persistent data survives pause and restart.
    pub fn is_persistent(&self) -> bool {
        matches!(self, Manifest::PersistentVolumeClaim(_))
    }
}

/// Build every child object for `component`.
pub fn build(cluster: &StratusCluster, component: &str, payload: &Payload) -> Result<Vec<Manifest>> {
    let manifests = if let Some(layout) = core_layout(component) {
        build_core(cluster, component, layout, payload)
    } else if catalog_entry(component).is_some() {
        build_third_party(cluster, component)?
    } else {
        return Err(OperatorError::UnknownComponent(component.to_string()));
    };
    manifests.into_iter().map(Manifest::stamped).collect()
}

fn build_core(
    cluster: &StratusCluster,
    component: &str,
    layout: Layout,
    payload: &Payload,
) -> Vec<Manifest> {
    if component == "resources" {
        return vec![Manifest::PersistentVolumeClaim(build_pvc(cluster))];
    }

    let template = cluster.spec.template(component);
    let mut env = template_env(&template);
    if component == "agent" {
        if let Some(runtime) = &payload.runtime {
            env.push(env_var("CONTAINER_RUNTIME", runtime));
        }
    }
    let container = build_container(component, &template, layout.port, env, layout.data_volume);
    let replicas = replicas_for(&template, layout.replicated, payload.topology);
    let volume = layout.data_volume.then(|| data_volume(cluster));

    let mut manifests = Vec::new();
    match layout.workload {
        Workload::Deployment => manifests.push(Manifest::Deployment(build_deployment(
            cluster, component, replicas, container, volume,
        ))),
        Workload::DaemonSet => {
            manifests.push(Manifest::DaemonSet(build_daemonset(cluster, component, container)))
        }
        Workload::None => {}
    }
    if let Some(port) = layout.port {
        manifests.push(Manifest::Service(build_service(cluster, component, port)));
    }
    if component == "web" {
        if let Some(ingress) = build_ingress(cluster, layout.port.unwrap_or(80)) {
            manifests.push(Manifest::Ingress(ingress));
        }
    }
    manifests
}

fn build_third_party(cluster: &StratusCluster, component: &str) -> Result<Vec<Manifest>> {
    let entry = catalog_entry(component)
        .ok_or_else(|| OperatorError::UnknownComponent(component.to_string()))?;
    let app = cluster.spec.third_party(component);

    let image = app
        .and_then(|a| a.image.clone())
        .unwrap_or_else(|| entry.image.to_string());
    let port = app.and_then(|a| a.port).or(entry.port);
    let env: Vec<EnvVar> = app
        .map(|a| {
            a.config
                .iter()
                .map(|(k, v)| env_var(&k.to_uppercase().replace('-', "_"), v))
                .collect()
        })
        .unwrap_or_default();

    let template = ComponentTemplate {
        image: Some(image),
        ..ComponentTemplate::default_for(component)
    };
    let container = build_container(component, &template, port, env, false);

    let mut manifests = vec![Manifest::Deployment(build_deployment(
        cluster, component, 1, container, None,
    ))];
    if let Some(port) = port {
        manifests.push(Manifest::Service(build_service(cluster, component, port)));
    }
    Ok(manifests)
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

pub fn child_name(cluster: &StratusCluster, component: &str) -> String {
    format!("{}-{}", cluster.name_any(), component)
}

pub fn owner_reference(cluster: &StratusCluster) -> OwnerReference {
    OwnerReference {
        api_version: StratusCluster::api_version(&()).to_string(),
        kind: StratusCluster::kind(&()).to_string(),
        name: cluster.name_any(),
        uid: cluster.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

pub fn pod_selector(cluster: &StratusCluster, component: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_NAME.to_string(), "stratus".to_string());
    labels.insert(LABEL_INSTANCE.to_string(), cluster.name_any());
    labels.insert(LABEL_COMPONENT.to_string(), component.to_string());
    labels
}

pub fn common_labels(cluster: &StratusCluster, component: &str) -> BTreeMap<String, String> {
    let mut labels = pod_selector(cluster, component);
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGER_NAME.to_string());
    labels
}

fn object_meta(cluster: &StratusCluster, name: String, component: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: cluster.namespace(),
        labels: Some(common_labels(cluster, component)),
        owner_references: Some(vec![owner_reference(cluster)]),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Pods
// ---------------------------------------------------------------------------

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn template_env(template: &ComponentTemplate) -> Vec<EnvVar> {
    template
        .env
        .iter()
        .map(|env| EnvVar {
            name: env.name.clone(),
            value: env.value.clone(),
            ..Default::default()
        })
        .collect()
}

fn replicas_for(template: &ComponentTemplate, replicated: bool, topology: Topology) -> i32 {
    match (topology, replicated) {
        (Topology::MultiNode, true) => template.replicas.unwrap_or(2).max(1),
        _ => 1,
    }
}

fn build_resource_requirements(spec: &crate::crd::ResourceRequirements) -> ResourceRequirements {
    let mut limits = BTreeMap::new();
    let mut requests = BTreeMap::new();

    if let Some(cpu) = &spec.limits.cpu {
        limits.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &spec.limits.memory {
        limits.insert("memory".to_string(), Quantity(memory.clone()));
    }
    if let Some(cpu) = &spec.requests.cpu {
        requests.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &spec.requests.memory {
        requests.insert("memory".to_string(), Quantity(memory.clone()));
    }

    ResourceRequirements {
        limits: (!limits.is_empty()).then_some(limits),
        requests: (!requests.is_empty()).then_some(requests),
        ..Default::default()
    }
}

fn build_container(
    component: &str,
    template: &ComponentTemplate,
    port: Option<i32>,
    env: Vec<EnvVar>,
    mount_data: bool,
) -> Container {
    Container {
        name: component.to_string(),
        image: Some(template.image_for(component)),
        image_pull_policy: Some(template.image_pull_policy.clone()),
        ports: port.map(|port| {
            vec![ContainerPort {
                name: Some("main".to_string()),
                container_port: port,
                ..Default::default()
            }]
        }),
        env: (!env.is_empty()).then_some(env),
        resources: Some(build_resource_requirements(&template.resources)),
        volume_mounts: mount_data.then(|| {
            vec![VolumeMount {
                name: "data".to_string(),
                mount_path: format!("{}/{}", DATA_MOUNT_PATH, component),
                sub_path: Some(component.to_string()),
                ..Default::default()
            }]
        }),
        ..Default::default()
    }
}

fn data_volume(cluster: &StratusCluster) -> Volume {
    Volume {
        name: "data".to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: child_name(cluster, "data"),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn pod_template(
    cluster: &StratusCluster,
    component: &str,
    container: Container,
    volume: Option<Volume>,
) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(pod_selector(cluster, component)),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![container],
            volumes: volume.map(|v| vec![v]),
            ..Default::default()
        }),
    }
}

// ---------------------------------------------------------------------------
// Objects
// ---------------------------------------------------------------------------

fn build_deployment(
    cluster: &StratusCluster,
    component: &str,
    replicas: i32,
    container: Container,
    volume: Option<Volume>,
) -> Deployment {
    Deployment {
        metadata: object_meta(cluster, child_name(cluster, component), component),
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(pod_selector(cluster, component)),
                ..Default::default()
            },
            template: pod_template(cluster, component, container, volume),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_daemonset(
    cluster: &StratusCluster,
    component: &str,
    container: Container,
) -> DaemonSet {
    DaemonSet {
        metadata: object_meta(cluster, child_name(cluster, component), component),
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(pod_selector(cluster, component)),
                ..Default::default()
            },
            template: pod_template(cluster, component, container, None),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_service(cluster: &StratusCluster, component: &str, port: i32) -> Service {
    Service {
        metadata: object_meta(cluster, child_name(cluster, component), component),
        spec: Some(ServiceSpec {
            selector: Some(pod_selector(cluster, component)),
            ports: Some(vec![ServicePort {
                name: Some("main".to_string()),
                port,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_ingress(cluster: &StratusCluster, port: i32) -> Option<Ingress> {
    let config = cluster.spec.ingress.as_ref()?;
    Some(Ingress {
        metadata: object_meta(cluster, child_name(cluster, "web"), "web"),
        spec: Some(IngressSpec {
            ingress_class_name: config.class_name.clone(),
            rules: Some(vec![IngressRule {
                host: Some(config.host.clone()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".to_string()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: child_name(cluster, "web"),
                                port: Some(ServiceBackendPort {
                                    number: Some(port),
                                    ..Default::default()
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn build_pvc(cluster: &StratusCluster) -> PersistentVolumeClaim {
    let storage = &cluster.spec.storage;
    PersistentVolumeClaim {
        metadata: object_meta(cluster, child_name(cluster, "data"), "resources"),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: storage.storage_class_name.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some({
                    let mut reqs = BTreeMap::new();
                    reqs.insert("storage".to_string(), Quantity(storage.size.clone()));
                    reqs
                }),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}
