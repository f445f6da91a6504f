//! Local cache contract.
//!
//! The controller only needs three things from its cache: whether the initial
//! list has completed, a lookup by key, and change notifications.

use std::sync::Arc;

use tokio::sync::watch;

use crate::key::ResourceKey;

/// Receives cache change notifications.
///
/// Called synchronously on the watch-delivery task: implementations must not
/// block or perform I/O.
pub trait EventHandler<K>: Send + Sync {
    /// `obj` appeared in the cache.
    fn on_add(&self, obj: &K);
    /// `old` was replaced by `new`; both are equal on a resync.
    fn on_update(&self, old: &K, new: &K);
    /// `obj` left the cache; this is its last known state.
    fn on_delete(&self, obj: &K);
}

/// Eventually-consistent, read-only local mirror of cluster objects.
pub trait CacheMirror<K>: Send + Sync {
    /// Observe the synchronization flag; flips to `true` once after the initial list.
    fn watch_synced(&self) -> watch::Receiver<bool>;

    /// True once the initial list has been applied.
    fn has_synced(&self) -> bool {
        *self.watch_synced().borrow()
    }

    /// Current cached object for `key`, if it exists.
    fn get_by_key(&self, key: &ResourceKey) -> Option<Arc<K>>;

    /// Subscribes `handler` to add/update/delete notifications.
    ///
    /// Objects already cached are delivered to the new handler as adds.
    fn add_event_handler(&self, handler: Arc<dyn EventHandler<K>>);
}
