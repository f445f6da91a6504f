//! Delayed adds.
//!
//! A single task per queue holds items until their ready time, in a min-heap
//! keyed by ready time, then hands them to the queue as ordinary adds.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::queue::Shared;

/// A request to add `item` at `ready_at`.
#[derive(Debug)]
pub(crate) struct Delayed<T> {
    pub(crate) item: T,
    pub(crate) ready_at: Instant,
}

#[derive(Debug)]
struct Waiting<T> {
    ready_at: Instant,
    // Insertion order breaks ties between equal ready times
    seq: u64,
    item: T,
}

impl<T> PartialEq for Waiting<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl<T> Eq for Waiting<T> {}

impl<T> PartialOrd for Waiting<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Waiting<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ready_at
            .cmp(&other.ready_at)
            .then(self.seq.cmp(&other.seq))
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Runs until the queue shuts down or its handle is dropped.
pub(crate) async fn waiting_loop<T>(shared: Arc<Shared<T>>, mut incoming: mpsc::UnboundedReceiver<Delayed<T>>)
where
    T: Eq + Hash + Clone,
{
    let mut shutdown = shared.subscribe_shutdown();
    let mut heap: BinaryHeap<Reverse<Waiting<T>>> = BinaryHeap::new();
    // Earliest ready time per item; heap entries that disagree are stale
    let mut waiting: HashMap<T, Instant> = HashMap::new();
    let mut seq: u64 = 0;

    loop {
        if *shutdown.borrow() {
            return;
        }

        let now = Instant::now();
        while heap.peek().is_some_and(|Reverse(entry)| entry.ready_at <= now) {
            let Some(Reverse(entry)) = heap.pop() else {
                break;
            };
            if waiting.get(&entry.item) == Some(&entry.ready_at) {
                waiting.remove(&entry.item);
                shared.add(entry.item);
            }
        }

        let next_ready = heap.peek().map(|Reverse(entry)| entry.ready_at);

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            received = incoming.recv() => {
                let Some(Delayed { item, ready_at }) = received else {
                    return;
                };
                if waiting.get(&item).is_some_and(|existing| *existing <= ready_at) {
                    continue;
                }
                waiting.insert(item.clone(), ready_at);
                seq += 1;
                heap.push(Reverse(Waiting { ready_at, seq, item }));
            }
            () = sleep_until(next_ready) => {}
        }
    }
}
