//! Event handlers that turn cache changes into work-queue keys.
//!
//! A controller watches its own kind ("for controller") and the kinds it
//! creates ("for controlee"). Changes to a child are routed to the parent
//! named by the child's controller owner reference.

use std::marker::PhantomData;
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::Resource;
use tracing::trace;

use super::controller::{key_of, resolve_controller_ref};
use super::informer::{DeletedObject, ResourceEventHandler};
use super::queue::WorkQueue;

enum Mode<P>
where
    P: Resource<DynamicType = ()> + Clone + 'static,
{
    Controller,
    Controlee { parents: Store<P> },
}

/// Routes events for `C` objects to keys of their `P` parent.
pub struct Watcher<C, P>
where
    P: Resource<DynamicType = ()> + Clone + 'static,
{
    queue: WorkQueue,
    mode: Mode<P>,
    _child: PhantomData<fn() -> C>,
}

impl<K> Watcher<K, K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    /// Enqueue the changed object itself.
    pub fn for_controller(queue: WorkQueue) -> Self {
        Self {
            queue,
            mode: Mode::Controller,
            _child: PhantomData,
        }
    }
}

impl<C, P> Watcher<C, P>
where
    C: Resource + Send + Sync + 'static,
    P: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    /// Enqueue the owner of the changed object, looked up in `parents`.
    pub fn for_controlee(queue: WorkQueue, parents: Store<P>) -> Self {
        Self {
            queue,
            mode: Mode::Controlee { parents },
            _child: PhantomData,
        }
    }

    fn enqueue_self(&self, obj: &C) {
        self.queue.add(&key_of(obj));
    }

    fn enqueue_owner(&self, obj: &C, parents: &Store<P>) {
        let Some(owner) = controller_of::<P>(obj.meta().owner_references.as_deref()) else {
            return;
        };
        self.enqueue_ref(obj, owner, parents);
    }

    fn enqueue_ref(&self, obj: &C, owner: &OwnerReference, parents: &Store<P>) {
        let namespace = obj.meta().namespace.clone().unwrap_or_default();
        let parent = resolve_controller_ref::<P, _>(&namespace, owner, |ns, name| {
            let key = if ns.is_empty() {
                ObjectRef::new(name)
            } else {
                ObjectRef::new(name).within(ns)
            };
            parents.get(&key)
        });
        match parent {
            Some(parent) => self.queue.add(&key_of(parent.as_ref())),
            None => trace!(
                owner = %owner.name,
                kind = %owner.kind,
                "owner not in cache, ignoring child event"
            ),
        }
    }

    fn changed(&self, obj: &C) {
        match &self.mode {
            Mode::Controller => self.enqueue_self(obj),
            Mode::Controlee { parents } => self.enqueue_owner(obj, parents),
        }
    }
}

/// The owner reference that controls `refs` for parent kind `P`: the one
/// flagged `controller`, else the first of the right kind.
pub fn controller_of<P>(refs: Option<&[OwnerReference]>) -> Option<&OwnerReference>
where
    P: Resource<DynamicType = ()>,
{
    let refs = refs?;
    let kind = P::kind(&());
    refs.iter()
        .find(|r| r.controller == Some(true) && r.kind == kind)
        .or_else(|| refs.iter().find(|r| r.kind == kind))
}

impl<C, P> ResourceEventHandler<C> for Watcher<C, P>
where
    C: Resource + Send + Sync + 'static,
    P: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn on_add(&self, obj: &Arc<C>) {
        // a child created already terminating is handled like a delete
        if let Mode::Controlee { .. } = self.mode {
            if obj.meta().deletion_timestamp.is_some() {
                self.on_delete(&DeletedObject::Final(Arc::clone(obj)));
                return;
            }
        }
        self.changed(obj);
    }

    fn on_update(&self, old: &Arc<C>, new: &Arc<C>) {
        let Mode::Controlee { parents } = &self.mode else {
            self.enqueue_self(new);
            return;
        };

        if old.meta().resource_version == new.meta().resource_version {
            return;
        }

        let old_ref = controller_of::<P>(old.meta().owner_references.as_deref());
        let new_ref = controller_of::<P>(new.meta().owner_references.as_deref());
        if let Some(old_ref) = old_ref {
            if new_ref.map(|r| &r.uid) != Some(&old_ref.uid) {
                self.enqueue_ref(old, old_ref, parents);
            }
        }
        if let Some(new_ref) = new_ref {
            self.enqueue_ref(new, new_ref, parents);
        }
    }

    fn on_delete(&self, obj: &DeletedObject<C>) {
        self.changed(obj.object());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use kube::runtime::reflector;
    use kube::runtime::watcher::Event;

    fn parent(name: &str, uid: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                uid: Some(uid.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn child(name: &str, rv: &str, owners: Vec<OwnerReference>) -> Arc<Deployment> {
        Arc::new(Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                resource_version: Some(rv.to_string()),
                owner_references: Some(owners),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    fn owner_ref(kind: &str, name: &str, uid: &str, controller: bool) -> OwnerReference {
        OwnerReference {
            api_version: "v1".to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            uid: uid.to_string(),
            controller: Some(controller),
            block_owner_deletion: None,
        }
    }

    fn setup(parents: Vec<ConfigMap>) -> (Watcher<Deployment, ConfigMap>, WorkQueue) {
        let (store, mut writer) = reflector::store();
        for p in parents {
            writer.apply_watcher_event(&Event::Apply(p));
        }
        let queue = WorkQueue::new("test");
        (Watcher::for_controlee(queue.clone(), store), queue)
    }

    async fn drain(queue: &WorkQueue) -> Vec<String> {
        let mut keys = Vec::new();
        while !queue.is_empty() {
            let key = queue.get().await.unwrap();
            queue.done(&key);
            keys.push(key);
        }
        keys
    }

    #[tokio::test]
    async fn test_controller_mode_enqueues_self() {
        let queue = WorkQueue::new("test");
        let watcher: Watcher<ConfigMap, ConfigMap> = Watcher::for_controller(queue.clone());
        let obj = Arc::new(parent("a", "u1"));
        watcher.on_add(&obj);
        watcher.on_update(&obj, &obj);
        watcher.on_delete(&DeletedObject::Tombstone(obj));
        assert_eq!(drain(&queue).await, vec!["ns/a"]);
    }

    #[tokio::test]
    async fn test_child_add_enqueues_owner() {
        let (watcher, queue) = setup(vec![parent("p", "u1")]);
        watcher.on_add(&child("c", "1", vec![owner_ref("ConfigMap", "p", "u1", true)]));
        assert_eq!(drain(&queue).await, vec!["ns/p"]);
    }

    #[tokio::test]
    async fn test_child_of_unknown_or_foreign_owner_is_ignored() {
        let (watcher, queue) = setup(vec![parent("p", "u1")]);
        watcher.on_add(&child("c", "1", vec![owner_ref("ConfigMap", "p", "stale", true)]));
        watcher.on_add(&child("d", "1", vec![owner_ref("ReplicaSet", "p", "u1", true)]));
        watcher.on_add(&child("e", "1", vec![]));
        assert!(drain(&queue).await.is_empty());
    }

    #[tokio::test]
    async fn test_update_with_same_resource_version_is_skipped() {
        let (watcher, queue) = setup(vec![parent("p", "u1")]);
        let c = child("c", "7", vec![owner_ref("ConfigMap", "p", "u1", true)]);
        watcher.on_update(&c, &c);
        assert!(drain(&queue).await.is_empty());
    }

    #[tokio::test]
    async fn test_owner_change_enqueues_both_parents() {
        let (watcher, queue) = setup(vec![parent("p", "u1"), parent("q", "u2")]);
        let old = child("c", "1", vec![owner_ref("ConfigMap", "p", "u1", true)]);
        let new = child("c", "2", vec![owner_ref("ConfigMap", "q", "u2", true)]);
        watcher.on_update(&old, &new);
        let mut keys = drain(&queue).await;
        keys.sort();
        assert_eq!(keys, vec!["ns/p", "ns/q"]);
    }

    #[tokio::test]
    async fn test_terminating_child_add_and_tombstone_enqueue_owner() {
        let (watcher, queue) = setup(vec![parent("p", "u1")]);
        let mut terminating = (*child("c", "1", vec![owner_ref("ConfigMap", "p", "u1", true)])).clone();
        terminating.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        watcher.on_add(&Arc::new(terminating));
        assert_eq!(drain(&queue).await, vec!["ns/p"]);

        let gone = child("c", "2", vec![owner_ref("ConfigMap", "p", "u1", true)]);
        watcher.on_delete(&DeletedObject::Tombstone(gone));
        assert_eq!(drain(&queue).await, vec!["ns/p"]);
    }

    #[test]
    fn test_controller_of_prefers_controller_flag() {
        let refs = vec![
            owner_ref("ConfigMap", "first", "u1", false),
            owner_ref("ConfigMap", "second", "u2", true),
        ];
        assert_eq!(controller_of::<ConfigMap>(Some(&refs)).unwrap().name, "second");
        let refs = vec![owner_ref("ConfigMap", "only", "u1", false)];
        assert_eq!(controller_of::<ConfigMap>(Some(&refs)).unwrap().name, "only");
        assert!(controller_of::<ConfigMap>(None).is_none());
    }
}
