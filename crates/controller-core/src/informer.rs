//! Watch-fed local cache.
//!
//! `Informer` keeps an in-memory copy of every watched object, keyed by
//! [`ResourceKey`], and fans out add/update/delete notifications to registered
//! [`EventHandler`]s. It is driven by `kube_runtime::watcher`, which performs the
//! initial list and then streams changes, reconnecting on failure.
//!
//! The initial list (and any later relist) is buffered and swapped in as a whole
//! on `InitDone`, so handlers see a consistent diff against the previous contents.

use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::pin::pin;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures::{Stream, StreamExt};
use kube::{Api, Resource};
use kube_runtime::{WatchStreamExt, watcher};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheMirror, EventHandler};
use crate::key::ResourceKey;

type Store<K> = HashMap<ResourceKey, Arc<K>>;

enum Notification<K> {
    Add(Arc<K>),
    Update(Arc<K>, Arc<K>),
    Delete(Arc<K>),
}

/// Kube-backed [`CacheMirror`].
pub struct Informer<K> {
    name: String,
    store: RwLock<Store<K>>,
    // Objects received since the last `Init`, swapped in on `InitDone`
    relist: Mutex<Option<Store<K>>>,
    handlers: RwLock<Vec<Arc<dyn EventHandler<K>>>>,
    synced: watch::Sender<bool>,
}

impl<K> std::fmt::Debug for Informer<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Informer")
            .field("name", &self.name)
            .field("synced", &*self.synced.borrow())
            .finish_non_exhaustive()
    }
}

impl<K> Informer<K>
where
    K: Resource + Send + Sync + 'static,
{
    /// Creates an empty, unsynced cache.
    pub fn new(name: impl Into<String>) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            name: name.into(),
            store: RwLock::new(HashMap::new()),
            relist: Mutex::new(None),
            handlers: RwLock::new(Vec::new()),
            synced,
        }
    }

    /// Number of cached objects.
    pub fn len(&self) -> usize {
        self.store.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys of every cached object.
    pub fn keys(&self) -> Vec<ResourceKey> {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn key_for(&self, obj: &K) -> Option<ResourceKey> {
        match ResourceKey::from_object(obj) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(informer = %self.name, error = %e, "ignoring object without a usable key");
                None
            }
        }
    }

    /// Applies one watcher event to the cache and notifies handlers.
    pub fn apply(&self, event: watcher::Event<K>) {
        let notifications = match event {
            watcher::Event::Init => {
                debug!(informer = %self.name, "relist started");
                *self.relist.lock().unwrap_or_else(PoisonError::into_inner) = Some(HashMap::new());
                return;
            }
            watcher::Event::InitApply(obj) => {
                let Some(key) = self.key_for(&obj) else {
                    return;
                };
                let mut relist = self.relist.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(buffer) = relist.as_mut() {
                    buffer.insert(key, Arc::new(obj));
                    return;
                }
                drop(relist);
                // No relist in progress: treat as a plain apply
                self.upsert(key, obj)
            }
            watcher::Event::InitDone => self.finish_relist(),
            watcher::Event::Apply(obj) => {
                let Some(key) = self.key_for(&obj) else {
                    return;
                };
                self.upsert(key, obj)
            }
            watcher::Event::Delete(obj) => {
                let Some(key) = self.key_for(&obj) else {
                    return;
                };
                self.store
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&key);
                vec![Notification::Delete(Arc::new(obj))]
            }
        };

        self.dispatch(notifications);
    }

    fn upsert(&self, key: ResourceKey, obj: K) -> Vec<Notification<K>> {
        let new = Arc::new(obj);
        let old = self
            .store
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::clone(&new));
        match old {
            Some(old) => vec![Notification::Update(old, new)],
            None => vec![Notification::Add(new)],
        }
    }

    fn finish_relist(&self) -> Vec<Notification<K>> {
        let fresh = self
            .relist
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        // InitDone without a preceding Init carries no list to diff against
        let Some(fresh) = fresh else {
            self.mark_synced(self.len());
            return Vec::new();
        };

        let mut store = self.store.write().unwrap_or_else(PoisonError::into_inner);
        let old = std::mem::replace(&mut *store, fresh);

        let mut notifications: Vec<Notification<K>> = store
            .iter()
            .map(|(key, new)| match old.get(key) {
                Some(prev) => Notification::Update(Arc::clone(prev), Arc::clone(new)),
                None => Notification::Add(Arc::clone(new)),
            })
            .collect();
        notifications.extend(
            old.iter()
                .filter(|(key, _)| !store.contains_key(*key))
                .map(|(_, prev)| Notification::Delete(Arc::clone(prev))),
        );
        let count = store.len();
        drop(store);

        self.mark_synced(count);
        notifications
    }

    fn mark_synced(&self, objects: usize) {
        let first_sync = !*self.synced.borrow();
        if first_sync {
            info!(informer = %self.name, objects, "cache synced");
            self.synced.send_replace(true);
        } else {
            debug!(informer = %self.name, objects, "relist complete");
        }
    }

    /// Re-delivers every cached object as an update with identical old and new state.
    pub fn resync(&self) {
        let notifications: Vec<_> = self
            .store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|obj| Notification::Update(Arc::clone(obj), Arc::clone(obj)))
            .collect();
        debug!(informer = %self.name, objects = notifications.len(), "resync");
        self.dispatch(notifications);
    }

    fn dispatch(&self, notifications: Vec<Notification<K>>) {
        if notifications.is_empty() {
            return;
        }
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for notification in &notifications {
            for handler in &handlers {
                match notification {
                    Notification::Add(obj) => handler.on_add(obj),
                    Notification::Update(old, new) => handler.on_update(old, new),
                    Notification::Delete(obj) => handler.on_delete(obj),
                }
            }
        }
    }

    /// Watches `api` until `cancel` fires, keeping the cache current.
    ///
    /// Watch errors are logged and retried with backoff. With a `resync_period`,
    /// every cached object is re-delivered as an update on that interval once synced.
    pub async fn run(
        &self,
        api: Api<K>,
        config: watcher::Config,
        resync_period: Option<Duration>,
        cancel: CancellationToken,
    ) where
        K: Clone + DeserializeOwned + Debug,
    {
        info!(informer = %self.name, "starting informer");
        let stream = watcher(api, config).default_backoff();
        self.drive(stream, resync_period, cancel).await;
    }

    /// Applies `stream` to the cache until it ends or `cancel` fires.
    ///
    /// Errors are logged and skipped; the stream is expected to retry on its own.
    pub(crate) async fn drive<S, E>(
        &self,
        stream: S,
        resync_period: Option<Duration>,
        cancel: CancellationToken,
    ) where
        S: Stream<Item = Result<watcher::Event<K>, E>>,
        E: Display,
    {
        let mut stream = pin!(stream);
        let mut resync = resync_period
            .filter(|period| !period.is_zero())
            .map(|period| tokio::time::interval_at(Instant::now() + period, period));

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!(informer = %self.name, "stopping informer");
                    return;
                }
                event = stream.next() => match event {
                    Some(Ok(event)) => self.apply(event),
                    Some(Err(e)) => {
                        warn!(informer = %self.name, error = %e, "watch stream error, retrying");
                    }
                    None => {
                        warn!(informer = %self.name, "watch stream ended");
                        return;
                    }
                },
                () = tick(resync.as_mut()) => {
                    if self.has_synced() {
                        self.resync();
                    }
                }
            }
        }
    }
}

async fn tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl<K> CacheMirror<K> for Informer<K>
where
    K: Resource + Send + Sync + 'static,
{
    fn watch_synced(&self) -> watch::Receiver<bool> {
        self.synced.subscribe()
    }

    fn get_by_key(&self, key: &ResourceKey) -> Option<Arc<K>> {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn add_event_handler(&self, handler: Arc<dyn EventHandler<K>>) {
        // Holding the handler lock while replaying keeps a concurrent apply from
        // slipping between the snapshot and the registration
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let existing: Vec<Arc<K>> = self
            .store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for obj in &existing {
            handler.on_add(obj);
        }
        handlers.push(handler);
    }
}
