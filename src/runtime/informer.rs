//! Informer: a local cache of one resource kind plus change notifications.
//!
//! A `kube::runtime::watcher` stream is applied to a reflector store. Before
//! each event reaches the store the previous cached copy is looked up so
//! handlers get add/update/delete with both old and new objects. When the
//! watch restarts and re-lists, objects that vanished while the watch was
//! down are reported as tombstones.

use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::reflector::{store::Writer, ObjectRef, Store};
use kube::runtime::watcher::{self, watcher, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Returns true once the informer's cache holds a complete listing.
pub type InformerSynced = Arc<dyn Fn() -> bool + Send + Sync>;

/// A delete notification.
#[derive(Debug, Clone)]
pub enum DeletedObject<K> {
    /// Observed delete event with the final state of the object
    Final(Arc<K>),
    /// The delete was missed; this is the last state the cache held
    Tombstone(Arc<K>),
}

impl<K> DeletedObject<K> {
    pub fn object(&self) -> &Arc<K> {
        match self {
            DeletedObject::Final(obj) | DeletedObject::Tombstone(obj) => obj,
        }
    }
}

/// Receives cache change notifications. Handlers run inline on the informer
/// task and must not block; they typically just enqueue keys.
pub trait ResourceEventHandler<K>: Send + Sync {
    fn on_add(&self, obj: &Arc<K>);
    fn on_update(&self, old: &Arc<K>, new: &Arc<K>);
    fn on_delete(&self, obj: &DeletedObject<K>);
}

/// Cache plus handler fan-out, independent of the API connection.
pub struct InformerState<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    writer: Writer<K>,
    store: Store<K>,
    handlers: Vec<Arc<dyn ResourceEventHandler<K>>>,
    synced: Arc<AtomicBool>,
    relisted: Option<HashSet<ObjectRef<K>>>,
}

impl<K> Default for InformerState<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    fn default() -> Self {
        let writer = Writer::default();
        let store = writer.as_reader();
        Self {
            writer,
            store,
            handlers: Vec::new(),
            synced: Arc::new(AtomicBool::new(false)),
            relisted: None,
        }
    }
}

impl<K> InformerState<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    pub fn store(&self) -> Store<K> {
        self.store.clone()
    }

    pub fn add_event_handler(&mut self, handler: Arc<dyn ResourceEventHandler<K>>) {
        self.handlers.push(handler);
    }

    pub fn has_synced(&self) -> InformerSynced {
        let synced = self.synced.clone();
        Arc::new(move || synced.load(Ordering::Acquire))
    }

    /// Apply one watcher event to the cache and notify handlers.
    pub fn handle(&mut self, event: Event<K>) {
        match &event {
            Event::Apply(obj) => {
                let key = ObjectRef::from_obj(obj);
                let old = self.store.get(&key);
                self.writer.apply_watcher_event(&event);
                let new = self.store.get(&key).unwrap_or_else(|| Arc::new(obj.clone()));
                self.notify_upsert(old, new);
            }
            Event::Delete(obj) => {
                self.writer.apply_watcher_event(&event);
                self.notify_delete(DeletedObject::Final(Arc::new(obj.clone())));
            }
            Event::Init => {
                self.relisted = Some(HashSet::new());
                self.writer.apply_watcher_event(&event);
            }
            Event::InitApply(obj) => {
                let key = ObjectRef::from_obj(obj);
                // the store keeps serving the previous listing until InitDone
                let old = self.store.get(&key);
                if let Some(seen) = self.relisted.as_mut() {
                    seen.insert(key);
                }
                self.writer.apply_watcher_event(&event);
                self.notify_upsert(old, Arc::new(obj.clone()));
            }
            Event::InitDone => {
                let seen = self.relisted.take().unwrap_or_default();
                let vanished: Vec<Arc<K>> = self
                    .store
                    .state()
                    .into_iter()
                    .filter(|obj| !seen.contains(&ObjectRef::from_obj(obj.as_ref())))
                    .collect();
                self.writer.apply_watcher_event(&event);
                for obj in vanished {
                    debug!(object = %ObjectRef::from_obj(obj.as_ref()), "missed delete, emitting tombstone");
                    self.notify_delete(DeletedObject::Tombstone(obj));
                }
                self.synced.store(true, Ordering::Release);
            }
        }
    }

    fn notify_upsert(&self, old: Option<Arc<K>>, new: Arc<K>) {
        for handler in &self.handlers {
            match &old {
                Some(old) => handler.on_update(old, &new),
                None => handler.on_add(&new),
            }
        }
    }

    fn notify_delete(&self, deleted: DeletedObject<K>) {
        for handler in &self.handlers {
            handler.on_delete(&deleted);
        }
    }
}

/// Watches one resource kind and keeps an [`InformerState`] current.
pub struct Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    api: Api<K>,
    config: watcher::Config,
    state: InformerState<K>,
}

impl<K> Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    pub fn new(api: Api<K>, config: watcher::Config) -> Self {
        Self {
            api,
            config,
            state: InformerState::default(),
        }
    }

    /// Read-only view of the cache (the lister).
    pub fn store(&self) -> Store<K> {
        self.state.store()
    }

    pub fn has_synced(&self) -> InformerSynced {
        self.state.has_synced()
    }

    pub fn add_event_handler(&mut self, handler: Arc<dyn ResourceEventHandler<K>>) {
        self.state.add_event_handler(handler);
    }

    /// Drive the watch until `token` is cancelled.
    pub async fn run(self, token: CancellationToken) {
        let Informer {
            api,
            config,
            mut state,
        } = self;
        let kind = K::kind(&()).to_string();
        info!(kind = %kind, "Starting informer");

        let stream = watcher(api, config).default_backoff();
        futures::pin_mut!(stream);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                next = stream.next() => match next {
                    Some(Ok(event)) => state.handle(event),
                    Some(Err(e)) => warn!(kind = %kind, error = %e, "Watch error"),
                    None => break,
                },
            }
        }
        info!(kind = %kind, "Informer stopped");
    }
}

/// Type-erased informer so informers of different kinds can be started together.
pub trait RunnableInformer: Send {
    fn spawn(self: Box<Self>, token: CancellationToken) -> JoinHandle<()>;
}

impl<K> RunnableInformer for Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    fn spawn(self: Box<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn((*self).run(token))
    }
}
