//! Behavioural tests for the work queue.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use workqueue::{ItemBackoffRateLimiter, WorkQueue};

fn queue() -> WorkQueue<String> {
    WorkQueue::new(
        "test",
        ItemBackoffRateLimiter::exponential(Duration::from_millis(5), Duration::from_secs(1000)),
    )
}

fn key(s: &str) -> String {
    s.to_string()
}

#[tokio::test]
async fn test_add_deduplicates_queued_items() {
    let q = queue();
    q.add(key("ns/obj1"));
    q.add(key("ns/obj1"));
    assert_eq!(q.len(), 1);

    assert_eq!(q.get().await, Some(key("ns/obj1")));
    assert!(q.is_empty());
    q.done(&key("ns/obj1"));
    assert!(q.is_empty(), "a deduplicated item must be handed out exactly once");
}

#[tokio::test]
async fn test_items_are_handed_out_in_first_add_order() {
    let q = queue();
    q.add(key("a"));
    q.add(key("b"));
    q.add(key("a"));
    q.add(key("c"));

    assert_eq!(q.get().await, Some(key("a")));
    assert_eq!(q.get().await, Some(key("b")));
    assert_eq!(q.get().await, Some(key("c")));
}

#[tokio::test]
async fn test_add_while_processing_is_not_lost() {
    let q = queue();
    q.add(key("ns/obj1"));
    let item = q.get().await.unwrap();

    // Update arrives mid-reconcile
    q.add(key("ns/obj1"));
    q.add(key("ns/obj1"));
    assert!(q.is_empty());

    q.done(&item);
    assert_eq!(q.len(), 1, "dirty item collapses to a single requeue");
    assert_eq!(q.get().await, Some(key("ns/obj1")));
}

#[tokio::test]
async fn test_get_waits_for_add() {
    let q = Arc::new(queue());
    let waiter = tokio::spawn({
        let q = Arc::clone(&q);
        async move { q.get().await }
    });

    tokio::task::yield_now().await;
    q.add(key("late"));

    let got = tokio::time::timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
    assert_eq!(got, Some(key("late")));
}

#[tokio::test]
async fn test_shut_down_releases_all_waiting_getters() {
    let q = Arc::new(queue());
    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.get().await })
        })
        .collect();

    tokio::task::yield_now().await;
    q.shut_down();

    for waiter in waiters {
        let got = tokio::time::timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
        assert_eq!(got, None);
    }
}

#[tokio::test]
async fn test_shut_down_drains_queued_items_first() {
    let q = queue();
    q.add(key("a"));
    q.add(key("b"));
    q.shut_down();

    assert!(q.is_shutting_down());
    assert_eq!(q.get().await, Some(key("a")));
    assert_eq!(q.get().await, Some(key("b")));
    assert_eq!(q.get().await, None);
    assert_eq!(q.get().await, None);
}

#[tokio::test]
async fn test_add_after_shut_down_is_ignored() {
    let q = queue();
    q.shut_down();
    q.add(key("a"));
    q.add_rate_limited(key("b"));

    assert!(q.is_empty());
    assert_eq!(q.get().await, None);
}

#[tokio::test]
async fn test_dirty_item_is_requeued_while_draining() {
    let q = queue();
    q.add(key("a"));
    let item = q.get().await.unwrap();
    q.add(key("a"));
    q.shut_down();

    q.done(&item);
    assert_eq!(q.get().await, Some(key("a")));
    q.done(&key("a"));
    assert_eq!(q.get().await, None);
}

#[tokio::test(start_paused = true)]
async fn test_add_rate_limited_waits_for_backoff() {
    let q = queue();
    let start = Instant::now();

    q.add_rate_limited(key("a"));
    assert!(q.is_empty(), "rate limited add must not be immediately visible");
    assert_eq!(q.num_requeues(&key("a")), 1);

    assert_eq!(q.get().await, Some(key("a")));
    assert!(start.elapsed() >= Duration::from_millis(5));
}

#[tokio::test(start_paused = true)]
async fn test_backoff_grows_until_forget() {
    let q = queue();
    let mut delays = Vec::new();

    for _ in 0..3 {
        let start = Instant::now();
        q.add_rate_limited(key("a"));
        let item = q.get().await.unwrap();
        delays.push(start.elapsed());
        q.done(&item);
    }
    assert!(delays[0] >= Duration::from_millis(5));
    assert!(delays[1] >= Duration::from_millis(10));
    assert!(delays[2] >= Duration::from_millis(20));
    assert!(delays.windows(2).all(|w| w[0] <= w[1]));

    q.forget(&key("a"));
    assert_eq!(q.num_requeues(&key("a")), 0);

    let start = Instant::now();
    q.add_rate_limited(key("a"));
    q.get().await.unwrap();
    let after_forget = start.elapsed();
    assert!(after_forget >= Duration::from_millis(5));
    assert!(after_forget < Duration::from_millis(10));
}

#[tokio::test(start_paused = true)]
async fn test_add_after_keeps_earliest_ready_time() {
    let q = queue();
    let start = Instant::now();

    q.add_after(key("a"), Duration::from_secs(10));
    q.add_after(key("a"), Duration::from_secs(1));

    assert_eq!(q.get().await, Some(key("a")));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(1) && elapsed < Duration::from_secs(10));
    q.done(&key("a"));

    // The superseded 10s entry must not produce a second delivery
    let again = tokio::time::timeout(Duration::from_secs(20), q.get()).await;
    assert!(again.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_delayed_and_ready_items_interleave_by_expiry() {
    let q = queue();
    q.add_after(key("slow"), Duration::from_secs(2));
    q.add_after(key("fast"), Duration::from_secs(1));

    assert_eq!(q.get().await, Some(key("fast")));
    assert_eq!(q.get().await, Some(key("slow")));
}

#[tokio::test(start_paused = true)]
async fn test_shut_down_drops_pending_delayed_adds() {
    let q = queue();
    q.add_after(key("a"), Duration::from_secs(1));
    q.shut_down();

    assert_eq!(q.get().await, None);
}

#[tokio::test]
async fn test_zero_delay_is_immediate() {
    let q = queue();
    q.add_after(key("a"), Duration::ZERO);
    assert_eq!(q.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_never_processes_a_key_concurrently() {
    let q: Arc<WorkQueue<u32>> = Arc::new(WorkQueue::new(
        "concurrency",
        ItemBackoffRateLimiter::exponential(Duration::from_millis(1), Duration::from_millis(10)),
    ));
    let in_flight: Arc<Mutex<HashSet<u32>>> = Arc::new(Mutex::new(HashSet::new()));
    let violations = Arc::new(Mutex::new(0u32));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let q = Arc::clone(&q);
            let in_flight = Arc::clone(&in_flight);
            let violations = Arc::clone(&violations);
            tokio::spawn(async move {
                while let Some(item) = q.get().await {
                    if !in_flight.lock().unwrap().insert(item) {
                        *violations.lock().unwrap() += 1;
                    }
                    tokio::task::yield_now().await;
                    in_flight.lock().unwrap().remove(&item);
                    q.done(&item);
                }
            })
        })
        .collect();

    for round in 0..500u32 {
        q.add(round % 10);
        if round % 50 == 0 {
            tokio::task::yield_now().await;
        }
    }
    q.shut_down();

    for worker in workers {
        tokio::time::timeout(Duration::from_secs(10), worker).await.unwrap().unwrap();
    }
    assert_eq!(*violations.lock().unwrap(), 0);
    assert!(q.is_empty());
}
