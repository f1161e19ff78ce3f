//! Cluster Controller
//!
//! Wires informers for `StratusCluster` and every child kind to a work queue,
//! and drives each queued cluster key through its state machine.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::components::ComponentRegistry;
use crate::conditions::{LABEL_MANAGED_BY, MANAGER_NAME};
use crate::config::OperatorConfig;
use crate::crd::StratusCluster;
use crate::error::Result;
use crate::runtime::{
    split_key, Controller, Informer, InformerSynced, RunnableInformer, SyncHandler, WorkQueue,
    Watcher,
};
use crate::state::{
    acquire, HandlerTable, KubeClusterClient, MachineMap, Outcome, StateDeps, StateMachine,
};

pub const CONTROLLER_NAME: &str = "stratus-cluster";

/// Sync handler for cluster keys.
pub struct ClusterReconciler {
    lister: Store<StratusCluster>,
    queue: WorkQueue,
    machines: MachineMap,
    handlers: Arc<HandlerTable>,
    deps: Arc<StateDeps>,
}

impl ClusterReconciler {
    pub fn new(lister: Store<StratusCluster>, queue: WorkQueue, deps: Arc<StateDeps>) -> Self {
        Self {
            lister,
            queue,
            machines: MachineMap::new(),
            handlers: Arc::new(HandlerTable::standard()),
            deps,
        }
    }

    pub fn machines(&self) -> &MachineMap {
        &self.machines
    }
}

#[async_trait]
impl SyncHandler for ClusterReconciler {
    async fn sync(&self, key: &str, token: &CancellationToken) -> Result<()> {
        let (namespace, name) = split_key(key)?;
        let obj_ref = match namespace {
            Some(ns) => ObjectRef::new(name).within(ns),
            None => ObjectRef::new(name),
        };

        let Some(cached) = self.lister.get(&obj_ref) else {
            if self.machines.remove(key) {
                info!(cluster = %key, "Cluster gone, state machine dropped");
            }
            return Ok(());
        };
        // deep copy out of the shared cache
        let cluster = StratusCluster::clone(&cached);

        let machine = self.machines.get_or_create(key, || {
            debug!(cluster = %key, "Creating state machine");
            StateMachine::new(key, Arc::clone(&self.handlers), cluster.status.as_ref())
        });
        let outcome = {
            let mut machine = acquire(key, &machine)?;
            machine.manage(&cluster, &self.deps, token).await?
        };

        match outcome {
            Outcome::Requeue(delay) => self.queue.add_after(key, delay),
            Outcome::Wait => {}
            Outcome::Finished => {
                self.machines.remove(key);
                info!(cluster = %key, "Cluster finalized");
            }
        }
        Ok(())
    }
}

/// The cluster controller with its informers, ready to run.
pub struct ClusterController {
    controller: Arc<Controller<StratusCluster>>,
    reconciler: Arc<ClusterReconciler>,
    informers: Vec<Box<dyn RunnableInformer>>,
    clusters_synced: InformerSynced,
}

impl ClusterController {
    /// Build informers, watchers and the reconciler.
    pub async fn new(client: Client, config: &OperatorConfig) -> Self {
        let namespace = config.namespace.as_deref();
        let queue = WorkQueue::new(CONTROLLER_NAME);

        let mut clusters: Informer<StratusCluster> =
            Informer::new(scoped_api(&client, namespace), watcher::Config::default());
        clusters.add_event_handler(Arc::new(Watcher::<StratusCluster, StratusCluster>::for_controller(
            queue.clone(),
        )));
        let lister = clusters.store();
        let clusters_synced = clusters.has_synced();

        let mut controller = Controller::new(CONTROLLER_NAME, lister.clone(), config.controller.clone())
            .with_queue(queue.clone());
        controller.add_informer_synced(clusters.has_synced());

        let children = [
            child_informer::<Deployment>(&client, namespace, &queue, &lister),
            child_informer::<DaemonSet>(&client, namespace, &queue, &lister),
            child_informer::<Service>(&client, namespace, &queue, &lister),
            child_informer::<Ingress>(&client, namespace, &queue, &lister),
            child_informer::<PersistentVolumeClaim>(&client, namespace, &queue, &lister),
        ];
        let mut informers: Vec<Box<dyn RunnableInformer>> = vec![Box::new(clusters)];
        for (informer, synced) in children {
            controller.add_informer_synced(synced);
            informers.push(informer);
        }

        let deps = Arc::new(StateDeps {
            client: Arc::new(KubeClusterClient::new(client.clone())),
            registry: Arc::new(ComponentRegistry::with_workloads(client).await),
            settings: config.machine.clone(),
        });

        Self {
            controller: Arc::new(controller),
            reconciler: Arc::new(ClusterReconciler::new(lister, queue, deps)),
            informers,
            clusters_synced,
        }
    }

    /// The cluster cache, for read-only consumers such as the status server.
    pub fn store(&self) -> Store<StratusCluster> {
        self.controller.lister().clone()
    }

    pub fn has_synced(&self) -> InformerSynced {
        Arc::clone(&self.clusters_synced)
    }

    /// Start the informers and run workers until `token` is cancelled.
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        info!(
            controller = CONTROLLER_NAME,
            informers = self.informers.len(),
            "Starting StratusCluster controller"
        );
        let handles: Vec<_> = self
            .informers
            .into_iter()
            .map(|informer| informer.spawn(token.clone()))
            .collect();

        let result = self.controller.run(self.reconciler, token.clone()).await;

        token.cancel();
        for handle in handles {
            let _ = handle.await;
        }
        result
    }
}

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Informer for one child kind, limited to objects this operator manages,
/// routing every change to the owning cluster's key.
fn child_informer<C>(
    client: &Client,
    namespace: Option<&str>,
    queue: &WorkQueue,
    parents: &Store<StratusCluster>,
) -> (Box<dyn RunnableInformer>, InformerSynced)
where
    C: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
{
    let selector = format!("{}={}", LABEL_MANAGED_BY, MANAGER_NAME);
    let mut informer: Informer<C> = Informer::new(
        scoped_api(client, namespace),
        watcher::Config::default().labels(&selector),
    );
    informer.add_event_handler(Arc::new(Watcher::<C, StratusCluster>::for_controlee(
        queue.clone(),
        parents.clone(),
    )));
    let synced = informer.has_synced();
    (Box::new(informer), synced)
}
