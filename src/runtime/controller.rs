//! Generic reconciliation controller.
//!
//! A [`Controller`] owns the work queue for one resource kind. Informer
//! event handlers (see [`super::watcher`]) turn cache changes into
//! `namespace/name` keys; `threadiness` workers pull keys and hand them to a
//! [`SyncHandler`]. Success forgets the key's back-off, failure re-queues it
//! rate limited until `max_retries` is reached.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::Resource;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::informer::InformerSynced;
use super::queue::WorkQueue;
use crate::error::{OperatorError, Result};

const CACHE_SYNC_POLL: Duration = Duration::from_millis(100);

/// Reconciles one key. Must be idempotent: it runs at least once per change
/// and may run when nothing changed.
#[async_trait]
pub trait SyncHandler: Send + Sync {
    async fn sync(&self, key: &str, token: &CancellationToken) -> Result<()>;
}

/// Worker pool and retry settings.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Number of concurrent workers
    pub threadiness: usize,
    /// Failures tolerated per key before it is dropped until its next event
    pub max_retries: u32,
    /// Re-enqueue every cached object this often
    pub resync_period: Option<Duration>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            threadiness: 1,
            max_retries: 15,
            resync_period: Some(Duration::from_secs(300)),
        }
    }
}

/// Canonical `namespace/name` key, or `name` for cluster-scoped objects.
pub fn key_of<R: Resource>(obj: &R) -> String {
    let meta = obj.meta();
    let name = meta.name.clone().unwrap_or_default();
    match meta.namespace.as_deref() {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
        _ => name,
    }
}

/// Split a key produced by [`key_of`] into namespace and name.
pub fn split_key(key: &str) -> Result<(Option<&str>, &str)> {
    match key.split('/').collect::<Vec<_>>().as_slice() {
        [name] if !name.is_empty() => Ok((None, name)),
        [ns, name] if !ns.is_empty() && !name.is_empty() => Ok((Some(ns), name)),
        _ => Err(OperatorError::InvalidState(format!(
            "unexpected key format: {:?}",
            key
        ))),
    }
}

/// Find the parent an owner reference points at, using `get(namespace, name)`.
///
/// Returns `None` when the kind differs, the parent is gone, or the UID does
/// not match (the name was recycled by a new object).
pub fn resolve_controller_ref<K, F>(
    namespace: &str,
    owner: &OwnerReference,
    get: F,
) -> Option<Arc<K>>
where
    K: Resource<DynamicType = ()>,
    F: Fn(&str, &str) -> Option<Arc<K>>,
{
    if owner.kind != K::kind(&()) {
        return None;
    }
    let parent = get(namespace, &owner.name)?;
    if parent.meta().uid.as_deref() != Some(owner.uid.as_str()) {
        debug!(
            owner = %owner.name,
            expected_uid = %owner.uid,
            "owner reference UID does not match cached parent"
        );
        return None;
    }
    Some(parent)
}

/// Log a failed sync. Every worker error passes through here.
pub fn handle_error(controller: &str, key: &str, requeues: u32, err: &OperatorError) {
    error!(
        controller = %controller,
        key = %key,
        requeues,
        error = %err,
        "Error syncing key"
    );
}

pub struct Controller<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    name: String,
    queue: WorkQueue,
    lister: Store<K>,
    config: ControllerConfig,
    synced: Vec<InformerSynced>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Controller<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, lister: Store<K>, config: ControllerConfig) -> Self {
        let name = name.into();
        Self {
            queue: WorkQueue::new(name.clone()),
            name,
            lister,
            config,
            synced: Vec::new(),
            _kind: PhantomData,
        }
    }

    pub fn with_queue(mut self, queue: WorkQueue) -> Self {
        self.queue = queue;
        self
    }

    /// Register a cache that must be synced before workers start.
    pub fn add_informer_synced(&mut self, synced: InformerSynced) {
        self.synced.push(synced);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn lister(&self) -> &Store<K> {
        &self.lister
    }

    pub fn enqueue(&self, obj: &K) {
        self.queue.add(&key_of(obj));
    }

    /// Enqueue after `delay`; used to poll for conditions no event will report.
    pub fn enqueue_after(&self, obj: &K, delay: Duration) {
        self.queue.add_after(&key_of(obj), delay);
    }

    pub fn enqueue_key(&self, key: &str) {
        self.queue.add(key);
    }

    /// Look up a cached object by namespace and name.
    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        let key = if namespace.is_empty() {
            ObjectRef::new(name)
        } else {
            ObjectRef::new(name).within(namespace)
        };
        self.lister.get(&key)
    }

    /// Resolve a child's owner reference against this controller's cache.
    pub fn resolve_controller_ref(&self, namespace: &str, owner: &OwnerReference) -> Option<Arc<K>> {
        resolve_controller_ref(namespace, owner, |ns, name| self.get(ns, name))
    }

    /// Wait for caches, run workers until `token` is cancelled, then drain.
    pub async fn run(
        self: Arc<Self>,
        handler: Arc<dyn SyncHandler>,
        token: CancellationToken,
    ) -> Result<()> {
        info!(controller = %self.name, "Starting controller");

        if !self.wait_for_cache_sync(&token).await {
            self.queue.shut_down();
            return Err(OperatorError::Configuration(format!(
                "{}: caches did not sync before shutdown",
                self.name
            )));
        }
        info!(controller = %self.name, threadiness = self.config.threadiness, "Caches synced, starting workers");

        let mut workers = Vec::with_capacity(self.config.threadiness);
        for worker_id in 0..self.config.threadiness.max(1) {
            let controller = Arc::clone(&self);
            let handler = Arc::clone(&handler);
            let token = token.clone();
            workers.push(tokio::spawn(async move {
                controller.run_worker(worker_id, handler, token).await;
            }));
        }

        if let Some(period) = self.config.resync_period {
            let controller = Arc::clone(&self);
            let token = token.clone();
            tokio::spawn(async move { controller.resync_loop(period, token).await });
        }

        token.cancelled().await;
        info!(controller = %self.name, "Shutting down controller");
        self.queue.shut_down();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(controller = %self.name, error = %e, "Worker task failed");
            }
        }
        Ok(())
    }

    async fn wait_for_cache_sync(&self, token: &CancellationToken) -> bool {
        loop {
            if self.synced.iter().all(|synced| synced()) {
                return true;
            }
            tokio::select! {
                _ = token.cancelled() => return false,
                _ = tokio::time::sleep(CACHE_SYNC_POLL) => {}
            }
        }
    }

    async fn run_worker(&self, worker_id: usize, handler: Arc<dyn SyncHandler>, token: CancellationToken) {
        debug!(controller = %self.name, worker_id, "Worker started");
        while let Some(key) = self.queue.get().await {
            self.process(&key, handler.as_ref(), &token).await;
        }
        debug!(controller = %self.name, worker_id, "Worker stopped");
    }

    /// Run one key through the handler and do the forget/requeue bookkeeping.
    pub async fn process(&self, key: &str, handler: &dyn SyncHandler, token: &CancellationToken) {
        match handler.sync(key, token).await {
            Ok(()) => self.queue.forget(key),
            Err(err) => {
                let requeues = self.queue.num_requeues(key);
                handle_error(&self.name, key, requeues, &err);
                if requeues < self.config.max_retries {
                    self.queue.add_rate_limited(key);
                } else {
                    warn!(controller = %self.name, key = %key, "Dropping key out of the queue after repeated failures");
                    self.queue.forget(key);
                }
            }
        }
        self.queue.done(key);
    }

    async fn resync_loop(&self, period: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {
                    let objects = self.lister.state();
                    debug!(controller = %self.name, count = objects.len(), "Resync");
                    for obj in objects {
                        self.enqueue(&obj);
                    }
                }
            }
        }
    }
}
