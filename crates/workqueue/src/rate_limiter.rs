//! # Rate Limiters
//!
//! Decide how long a failed item waits before it is handed out again.
//!
//! Per-item limiters count consecutive failures and grow the delay with each one,
//! either exponentially (base, 2·base, 4·base, ...) or along the Fibonacci sequence
//! (base, base, 2·base, 3·base, 5·base, ...). Both are capped at a maximum delay.
//! The bucket limiter bounds the overall retry rate across all items.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Computes retry delays for queue items.
pub trait RateLimiter<T>: Send + Sync {
    /// Delay before `item` may be processed again. Counts as a failure.
    fn when(&self, item: &T) -> Duration;

    /// Stop tracking `item`, resetting its failure count.
    fn forget(&self, item: &T);

    /// Number of failures recorded for `item` since it was last forgotten.
    fn num_requeues(&self, item: &T) -> u32;
}

impl<T, R> RateLimiter<T> for Box<R>
where
    R: RateLimiter<T> + ?Sized,
{
    fn when(&self, item: &T) -> Duration {
        (**self).when(item)
    }

    fn forget(&self, item: &T) {
        (**self).forget(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        (**self).num_requeues(item)
    }
}

fn lock<S>(mutex: &Mutex<S>) -> MutexGuard<'_, S> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Growth curve of per-item backoff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Backoff {
    /// base · 2^failures
    #[default]
    Exponential,
    /// base · fib(failures), with fib(0) = fib(1) = 1
    Fibonacci,
}

impl Backoff {
    /// Calculate the delay for a given number of previous failures (stateless).
    ///
    /// # Arguments
    ///
    /// * `failures` - Number of consecutive failures before this one (0-indexed)
    /// * `base` - Delay for the first failure
    /// * `max` - Ceiling for the delay
    #[must_use]
    pub fn delay_for(self, failures: u32, base: Duration, max: Duration) -> Duration {
        let delay = match self {
            Backoff::Exponential => 2u32
                .checked_pow(failures)
                .and_then(|factor| base.checked_mul(factor)),
            Backoff::Fibonacci => Self::fibonacci(failures, base, max),
        };
        delay.map_or(max, |d| d.min(max))
    }

    fn fibonacci(failures: u32, base: Duration, max: Duration) -> Option<Duration> {
        // First two values are both base
        let mut prev: u32 = 1;
        let mut current: u32 = 1;

        for _ in 2..=failures {
            let next = prev.checked_add(current)?;
            prev = current;
            current = next;

            // Once past the ceiling the sequence can stop early
            if base.checked_mul(current)? >= max {
                break;
            }
        }

        base.checked_mul(current)
    }
}

/// Per-item failure counting limiter.
///
/// Every call to [`RateLimiter::when`] records a failure for the item and returns
/// the next delay along the configured [`Backoff`] curve.
#[derive(Debug)]
pub struct ItemBackoffRateLimiter<T> {
    backoff: Backoff,
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<T, u32>>,
}

impl<T> ItemBackoffRateLimiter<T> {
    /// Create a limiter with the given curve, base delay, and ceiling.
    #[must_use]
    pub fn new(backoff: Backoff, base: Duration, max: Duration) -> Self {
        Self {
            backoff,
            base,
            max: max.max(base),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Exponential backoff from `base` up to `max`.
    #[must_use]
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self::new(Backoff::Exponential, base, max)
    }

    /// Fibonacci backoff from `base` up to `max`.
    #[must_use]
    pub fn fibonacci(base: Duration, max: Duration) -> Self {
        Self::new(Backoff::Fibonacci, base, max)
    }
}

impl<T> RateLimiter<T> for ItemBackoffRateLimiter<T>
where
    T: Eq + Hash + Clone + Send + Sync,
{
    fn when(&self, item: &T) -> Duration {
        let mut failures = lock(&self.failures);
        let count = failures.entry(item.clone()).or_insert(0);
        let previous = *count;
        *count = count.saturating_add(1);
        self.backoff.delay_for(previous, self.base, self.max)
    }

    fn forget(&self, item: &T) {
        lock(&self.failures).remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        lock(&self.failures).get(item).copied().unwrap_or(0)
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Token bucket bounding the aggregate retry rate.
///
/// Holds up to `burst` tokens, refilled at `qps` per second. Each retry takes one
/// token; when the bucket is empty the returned delay is the time until the
/// reserved token becomes available.
#[derive(Debug)]
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    /// Create a bucket allowing `qps` retries per second with bursts of `burst`.
    #[must_use]
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }
}

impl<T> RateLimiter<T> for BucketRateLimiter {
    fn when(&self, _item: &T) -> Duration {
        // A non-positive rate means unlimited
        if self.qps <= 0.0 || !self.qps.is_finite() {
            return Duration::ZERO;
        }

        let mut bucket = lock(&self.bucket);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last = now;
        bucket.tokens -= 1.0;

        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.qps)
        }
    }

    fn forget(&self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> u32 {
        0
    }
}

/// Combines limiters, answering with the longest delay of any of them.
pub struct MaxOfRateLimiter<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> std::fmt::Debug for MaxOfRateLimiter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaxOfRateLimiter")
            .field("limiters", &self.limiters.len())
            .finish()
    }
}

impl<T> MaxOfRateLimiter<T> {
    /// Combine the given limiters.
    #[must_use]
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self {
        Self { limiters }
    }
}

impl<T> RateLimiter<T> for MaxOfRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        // Every limiter must see the failure, so no short-circuiting here
        self.limiters
            .iter()
            .map(|limiter| limiter.when(item))
            .fold(Duration::ZERO, Duration::max)
    }

    fn forget(&self, item: &T) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// Default limiter for controllers.
///
/// Per-item exponential backoff from 5ms to 1000s, combined with an overall
/// bucket of 10 retries per second and bursts of 100.
#[must_use]
pub fn default_controller_rate_limiter<T>() -> MaxOfRateLimiter<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemBackoffRateLimiter::exponential(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        )),
        Box::new(BucketRateLimiter::new(10.0, 100)),
    ])
}
