//! Deduplicating, rate-limited work queue.
//!
//! Each key moves through an explicit state machine:
//!
//! ```text
//!   absent --add--> Queued --get--> Processing --done--> absent
//!                                       |  ^
//!                                      add |
//!                                       v  |
//!                                 ProcessingDirty --done--> Queued
//! ```
//!
//! Keys absent from the state map are neither queued nor processing.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::delay::{self, Delayed};
use crate::rate_limiter::RateLimiter;

/// State of a key known to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemState {
    /// Waiting in the FIFO for a worker
    Queued,
    /// Handed out by `get`, not yet `done`
    Processing,
    /// Added again while processing; requeued on `done`
    ProcessingDirty,
}

#[derive(Debug)]
struct State<T> {
    queue: VecDeque<T>,
    items: HashMap<T, ItemState>,
    shutting_down: bool,
}

enum Next<T> {
    Item(T),
    ShutDown,
    Empty,
}

type DepthObserver = Box<dyn Fn(usize) + Send + Sync>;

/// State shared between the queue handle and its waiting loop.
pub(crate) struct Shared<T> {
    state: Mutex<State<T>>,
    ready: Notify,
    shutdown: watch::Sender<bool>,
    depth_observer: OnceLock<DepthObserver>,
}

impl<T> Shared<T>
where
    T: Eq + Hash + Clone,
{
    fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                items: HashMap::new(),
                shutting_down: false,
            }),
            ready: Notify::new(),
            shutdown,
            depth_observer: OnceLock::new(),
        }
    }

    // Called with the state lock held so reported depths follow queue order
    fn report_depth(&self, depth: usize) {
        if let Some(observer) = self.depth_observer.get() {
            observer(depth);
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Adds `item` for immediate processing. Returns true if a new queue slot was taken.
    pub(crate) fn add(&self, item: T) -> bool {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.shutting_down {
            return false;
        }

        match state.items.entry(item) {
            Entry::Vacant(vacant) => {
                state.queue.push_back(vacant.key().clone());
                vacant.insert(ItemState::Queued);
                self.report_depth(state.queue.len());
            }
            Entry::Occupied(mut occupied) => {
                if *occupied.get() == ItemState::Processing {
                    occupied.insert(ItemState::ProcessingDirty);
                }
                return false;
            }
        }
        drop(guard);

        self.ready.notify_one();
        true
    }

    fn pop(&self) -> Next<T> {
        let mut guard = self.lock();
        let state = &mut *guard;
        match state.queue.pop_front() {
            Some(item) => {
                state.items.insert(item.clone(), ItemState::Processing);
                self.report_depth(state.queue.len());
                Next::Item(item)
            }
            None if state.shutting_down => Next::ShutDown,
            None => Next::Empty,
        }
    }
}

/// A deduplicating, rate-limited FIFO of keys.
///
/// Shared between the producer (event handlers) and any number of workers,
/// typically behind an `Arc`. Only [`WorkQueue::get`] ever waits.
pub struct WorkQueue<T> {
    name: String,
    shared: Arc<Shared<T>>,
    delayed: mpsc::UnboundedSender<Delayed<T>>,
    rate_limiter: Box<dyn RateLimiter<T>>,
}

impl<T> fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue").field("name", &self.name).finish_non_exhaustive()
    }
}

impl<T> WorkQueue<T>
where
    T: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
{
    /// Creates a named queue using `rate_limiter` for [`WorkQueue::add_rate_limited`].
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime; the delayed-add loop is
    /// spawned onto it.
    pub fn new(name: impl Into<String>, rate_limiter: impl RateLimiter<T> + 'static) -> Self {
        let shared = Arc::new(Shared::new());
        let (delayed, incoming) = mpsc::unbounded_channel();
        tokio::spawn(delay::waiting_loop(Arc::clone(&shared), incoming));

        Self {
            name: name.into(),
            shared,
            delayed,
            rate_limiter: Box::new(rate_limiter),
        }
    }

    /// Name used in logs and metrics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers `observer` to receive the ready-queue length whenever it changes.
    ///
    /// Reports the current length immediately. Only the first observer is kept;
    /// later calls return false. The observer runs under the queue lock and must
    /// not call back into the queue.
    pub fn set_depth_observer(&self, observer: impl Fn(usize) + Send + Sync + 'static) -> bool {
        if self.shared.depth_observer.set(Box::new(observer)).is_err() {
            return false;
        }
        let state = self.shared.lock();
        self.shared.report_depth(state.queue.len());
        true
    }

    /// Marks `item` as needing processing.
    ///
    /// Collapses with an existing queued entry. If the item is being processed it
    /// is handed out again once the current attempt calls [`WorkQueue::done`].
    /// Ignored once the queue is shutting down.
    pub fn add(&self, item: T) {
        if self.shared.add(item.clone()) {
            trace!(queue = %self.name, ?item, "queued");
        }
    }

    /// Waits for the next item and marks it as processing.
    ///
    /// Returns `None` once the queue is shutting down and empty; this is the
    /// signal for workers to exit.
    pub async fn get(&self) -> Option<T> {
        loop {
            // Register interest before checking so an add between the check and
            // the await is not missed
            let notified = self.shared.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.shared.pop() {
                Next::Item(item) => return Some(item),
                Next::ShutDown => return None,
                Next::Empty => notified.await,
            }
        }
    }

    /// Marks the processing attempt for `item` as finished.
    ///
    /// Must be paired with every item returned by [`WorkQueue::get`]. An item that
    /// was added during processing is queued again, even while draining.
    pub fn done(&self, item: &T) {
        let mut guard = self.shared.lock();
        let state = &mut *guard;
        match state.items.remove(item) {
            Some(ItemState::Processing) => {}
            Some(ItemState::ProcessingDirty) => {
                state.items.insert(item.clone(), ItemState::Queued);
                state.queue.push_back(item.clone());
                self.shared.report_depth(state.queue.len());
                drop(guard);
                trace!(queue = %self.name, ?item, "requeued dirty item");
                self.shared.ready.notify_one();
            }
            Some(ItemState::Queued) => {
                state.items.insert(item.clone(), ItemState::Queued);
                drop(guard);
                warn!(queue = %self.name, ?item, "done called for an item that is not processing");
            }
            None => {
                drop(guard);
                warn!(queue = %self.name, ?item, "done called for an unknown item");
            }
        }
    }

    /// Adds `item` once `delay` has elapsed, without blocking the caller.
    ///
    /// An item already waiting keeps the earlier of its two ready times.
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }

        let ready_at = Instant::now() + delay;
        if self.delayed.send(Delayed { item, ready_at }).is_err() {
            debug!(queue = %self.name, "waiting loop has stopped, dropping delayed add");
        }
    }

    /// Adds `item` after the delay chosen by the rate limiter and counts a retry.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.rate_limiter.when(&item);
        trace!(queue = %self.name, ?item, ?delay, "rate limited requeue");
        self.add_after(item, delay);
    }

    /// Resets the retry counter for `item`. Queue membership is unaffected.
    pub fn forget(&self, item: &T) {
        self.rate_limiter.forget(item);
    }

    /// Consecutive rate-limited requeues of `item` since it was last forgotten.
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.rate_limiter.num_requeues(item)
    }

    /// Number of items ready to be handed out.
    pub fn len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// True when no item is ready to be handed out.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops accepting new items and releases every waiting [`WorkQueue::get`].
    ///
    /// Items already queued are still handed out; `get` returns `None` once they
    /// are drained. Pending delayed adds are dropped.
    pub fn shut_down(&self) {
        {
            let mut state = self.shared.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
        }
        debug!(queue = %self.name, "shutting down");
        self.shared.shutdown.send_replace(true);
        self.shared.ready.notify_waiters();
    }

    /// True once [`WorkQueue::shut_down`] has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.shared.lock().shutting_down
    }
}
