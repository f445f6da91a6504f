//! Cache notification bridge.
//!
//! Converts add/update/delete notifications into resource keys on the work
//! queue. Deletes are enqueued too: the reconciler discovers the deletion by
//! finding the key absent from the cache.

use std::sync::Arc;

use kube::Resource;
use tracing::{debug, trace, warn};
use workqueue::WorkQueue;

use crate::cache::EventHandler;
use crate::key::ResourceKey;

/// Enqueues the key of every changed object.
#[derive(Debug, Clone)]
pub struct EnqueueHandler {
    queue: Arc<WorkQueue<ResourceKey>>,
}

impl EnqueueHandler {
    /// Creates a handler feeding `queue`.
    pub fn new(queue: Arc<WorkQueue<ResourceKey>>) -> Self {
        Self { queue }
    }

    fn enqueue<K: Resource>(&self, obj: &K, event: &'static str) {
        match ResourceKey::from_object(obj) {
            Ok(key) => {
                debug!(queue = %self.queue.name(), %key, event, "enqueue");
                self.queue.add(key);
            }
            Err(e) => warn!(queue = %self.queue.name(), event, error = %e, "cannot enqueue object"),
        }
    }
}

impl<K> EventHandler<K> for EnqueueHandler
where
    K: Resource + Send + Sync,
{
    fn on_add(&self, obj: &K) {
        self.enqueue(obj, "add");
    }

    fn on_update(&self, old: &K, new: &K) {
        // Periodic resyncs report unchanged objects; nothing to reconcile
        let old_version = old.meta().resource_version.as_deref();
        if old_version.is_some() && old_version == new.meta().resource_version.as_deref() {
            trace!(queue = %self.queue.name(), resource_version = ?old_version, "skipping unchanged object");
            return;
        }
        self.enqueue(new, "update");
    }

    fn on_delete(&self, obj: &K) {
        self.enqueue(obj, "delete");
    }
}
