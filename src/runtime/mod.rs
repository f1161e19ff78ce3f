//! Reconciliation runtime: informer caches, a keyed work queue, and the
//! controller loop that drains it.

pub mod controller;
pub mod informer;
pub mod queue;
pub mod rate_limiter;
pub mod watcher;

pub use controller::{key_of, split_key, Controller, ControllerConfig, SyncHandler};
pub use informer::{DeletedObject, Informer, InformerSynced, ResourceEventHandler, RunnableInformer};
pub use queue::WorkQueue;
pub use watcher::Watcher;
