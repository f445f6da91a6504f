//! Work Queue
//!
//! A deduplicating, rate-limited FIFO of opaque keys for controller workers.
//!
//! Guarantees:
//! - a key is queued at most once, no matter how often it is added
//! - a key is never handed to two workers at the same time
//! - a key added while it is being processed is handed out again after `done`
//!
//! # Example
//!
//! ```no_run
//! use workqueue::{WorkQueue, default_controller_rate_limiter};
//!
//! # async fn example() {
//! let queue = WorkQueue::new("hellotype", default_controller_rate_limiter());
//! queue.add("ns/obj1".to_string());
//!
//! while let Some(key) = queue.get().await {
//!     // ... reconcile ...
//!     queue.forget(&key);
//!     queue.done(&key);
//! }
//! # }
//! ```

#![warn(missing_docs)]

mod delay;
pub mod queue;
pub mod rate_limiter;

pub use queue::WorkQueue;
pub use rate_limiter::{
    Backoff, BucketRateLimiter, ItemBackoffRateLimiter, MaxOfRateLimiter, RateLimiter,
    default_controller_rate_limiter,
};
