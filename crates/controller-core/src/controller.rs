//! Controller lifecycle.
//!
//! `Created → WaitingForSync → Running → Draining → Stopped`
//!
//! [`Controller::run`] registers the enqueue handler on the cache, waits for the
//! initial list, starts the workers and, once the cancellation token fires,
//! shuts the queue down and waits for every worker to drain out.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use kube::Resource;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use workqueue::{RateLimiter, WorkQueue, default_controller_rate_limiter};

use crate::cache::CacheMirror;
use crate::error::ControllerError;
use crate::handler::EnqueueHandler;
use crate::key::ResourceKey;
use crate::metrics::ControllerMetrics;
use crate::reconcile::Reconcile;
use crate::worker::Worker;

/// Lifecycle phase of a [`Controller`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Constructed, `run` not yet called
    Created,
    /// Waiting for the cache's initial list
    WaitingForSync,
    /// Workers are processing keys
    Running,
    /// Queue shut down, workers finishing queued keys
    Draining,
    /// All workers exited
    Stopped,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::WaitingForSync => "waiting-for-sync",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Static controller settings.
pub struct ControllerConfig {
    workers: usize,
    reconcile_timeout: Option<Duration>,
    rate_limiter: Box<dyn RateLimiter<ResourceKey>>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            reconcile_timeout: None,
            rate_limiter: Box::new(default_controller_rate_limiter()),
        }
    }
}

impl fmt::Debug for ControllerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerConfig")
            .field("workers", &self.workers)
            .field("reconcile_timeout", &self.reconcile_timeout)
            .finish_non_exhaustive()
    }
}

impl ControllerConfig {
    /// Number of concurrent workers. Values below one are raised to one.
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Upper bound for a single reconcile attempt. Overruns are retried with backoff.
    #[must_use]
    pub fn reconcile_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.reconcile_timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    /// Rate limiter used to requeue failed keys.
    #[must_use]
    pub fn rate_limiter(mut self, rate_limiter: impl RateLimiter<ResourceKey> + 'static) -> Self {
        self.rate_limiter = Box::new(rate_limiter);
        self
    }

    /// Configured number of workers.
    pub fn worker_count(&self) -> usize {
        self.workers
    }
}

/// Ties a cache, a work queue and a reconciler together.
pub struct Controller<K, C, R> {
    name: String,
    cache: Arc<C>,
    reconciler: Arc<R>,
    queue: Arc<WorkQueue<ResourceKey>>,
    metrics: Arc<ControllerMetrics>,
    workers: usize,
    reconcile_timeout: Option<Duration>,
    state: watch::Sender<ControllerState>,
    started: AtomicBool,
    _kind: PhantomData<fn() -> K>,
}

impl<K, C, R> fmt::Debug for Controller<K, C, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("name", &self.name)
            .field("workers", &self.workers)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl<K, C, R> Controller<K, C, R>
where
    K: Resource + Send + Sync + 'static,
    C: CacheMirror<K> + 'static,
    R: Reconcile + 'static,
{
    /// Creates a controller and its work queue.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        name: impl Into<String>,
        cache: Arc<C>,
        reconciler: Arc<R>,
        config: ControllerConfig,
        metrics: Arc<ControllerMetrics>,
    ) -> Self {
        let name = name.into();
        let queue = Arc::new(WorkQueue::new(name.clone(), config.rate_limiter));
        {
            let metrics = Arc::clone(&metrics);
            let label = name.clone();
            queue.set_depth_observer(move |depth| metrics.set_queue_depth(&label, depth));
        }
        let (state, _) = watch::channel(ControllerState::Created);
        Self {
            name,
            cache,
            reconciler,
            queue,
            metrics,
            workers: config.workers,
            reconcile_timeout: config.reconcile_timeout,
            state,
            started: AtomicBool::new(false),
            _kind: PhantomData,
        }
    }

    /// Name used in logs, metrics labels and the queue.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The controller's work queue.
    pub fn queue(&self) -> &Arc<WorkQueue<ResourceKey>> {
        &self.queue
    }

    /// Current lifecycle phase.
    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    /// Observe lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ControllerState> {
        self.state.subscribe()
    }

    /// Runs the controller until `cancel` fires and every worker has drained.
    ///
    /// Fails with [`ControllerError::CacheSyncFailed`] if cancelled before the
    /// cache completed its initial list; no worker is started in that case.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ControllerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ControllerError::AlreadyStarted(self.name.clone()));
        }

        // Register before waiting so nothing listed during sync is missed
        self.cache
            .add_event_handler(Arc::new(EnqueueHandler::new(Arc::clone(&self.queue))));

        self.set_state(ControllerState::WaitingForSync);
        info!(controller = %self.name, "waiting for cache to sync");

        let synced = tokio::select! {
            () = cancel.cancelled() => false,
            synced = wait_for_sync(self.cache.watch_synced()) => synced,
        };
        if !synced {
            error!(controller = %self.name, "cache did not sync before shutdown");
            self.queue.shut_down();
            self.set_state(ControllerState::Stopped);
            return Err(ControllerError::CacheSyncFailed(self.name.clone()));
        }

        info!(controller = %self.name, workers = self.workers, "cache synced, starting workers");
        self.set_state(ControllerState::Running);

        let mut workers = JoinSet::new();
        for id in 0..self.workers {
            workers.spawn(
                Worker {
                    id,
                    controller: self.name.clone(),
                    queue: Arc::clone(&self.queue),
                    reconciler: Arc::clone(&self.reconciler),
                    metrics: Arc::clone(&self.metrics),
                    timeout: self.reconcile_timeout,
                }
                .run(),
            );
        }

        cancel.cancelled().await;

        info!(controller = %self.name, "shutting down, draining work queue");
        self.set_state(ControllerState::Draining);
        self.queue.shut_down();

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!(controller = %self.name, error = %e, "worker task ended abnormally");
            }
        }

        self.set_state(ControllerState::Stopped);
        info!(controller = %self.name, "controller stopped");
        Ok(())
    }

    fn set_state(&self, state: ControllerState) {
        self.state.send_replace(state);
    }
}

/// Resolves `true` once the flag is set, or `false` if the cache went away first.
async fn wait_for_sync(mut synced: watch::Receiver<bool>) -> bool {
    loop {
        if *synced.borrow_and_update() {
            return true;
        }
        if synced.changed().await.is_err() {
            return *synced.borrow();
        }
    }
}
