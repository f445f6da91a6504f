//! Environment configuration.

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use controller_core::{ControllerConfig, ResourceKey};
use workqueue::{Backoff, BucketRateLimiter, ItemBackoffRateLimiter, MaxOfRateLimiter, RateLimiter};

use crate::error::ControllerError;

/// Settings read from `WATCH_NAMESPACE`, `WORKER_COUNT` and friends.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub namespace: Option<String>,
    pub workers: usize,
    pub resync_period: Option<Duration>,
    pub backoff: Backoff,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub queue_qps: f64,
    pub queue_burst: u32,
    pub reconcile_timeout: Option<Duration>,
    pub probe_addr: SocketAddr,
}

impl Settings {
    /// Reads settings from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Reads settings through `lookup`, applying defaults for missing variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let namespace = lookup("WATCH_NAMESPACE").filter(|ns| !ns.trim().is_empty());

        let workers: usize = parse(&lookup, "WORKER_COUNT", 2)?;
        if workers == 0 {
            return Err(ControllerError::InvalidConfig(
                "WORKER_COUNT must be at least 1".to_string(),
            ));
        }

        let backoff = match lookup("BACKOFF_STRATEGY").as_deref() {
            None | Some("exponential") => Backoff::Exponential,
            Some("fibonacci") => Backoff::Fibonacci,
            Some(other) => {
                return Err(ControllerError::InvalidConfig(format!(
                    "BACKOFF_STRATEGY must be \"exponential\" or \"fibonacci\", got {other:?}"
                )));
            }
        };

        let backoff_base = Duration::from_millis(parse(&lookup, "BACKOFF_BASE_MS", 5)?);
        let backoff_max = Duration::from_secs(parse(&lookup, "BACKOFF_MAX_SECS", 1000)?);
        if backoff_base > backoff_max {
            return Err(ControllerError::InvalidConfig(
                "BACKOFF_BASE_MS exceeds BACKOFF_MAX_SECS".to_string(),
            ));
        }

        let queue_qps: f64 = parse(&lookup, "QUEUE_QPS", 10.0)?;
        if !queue_qps.is_finite() || queue_qps <= 0.0 {
            return Err(ControllerError::InvalidConfig(
                "QUEUE_QPS must be a positive number".to_string(),
            ));
        }
        let queue_burst: u32 = parse(&lookup, "QUEUE_BURST", 100)?;

        Ok(Self {
            namespace,
            workers,
            resync_period: seconds(parse(&lookup, "RESYNC_PERIOD_SECS", 600)?),
            backoff,
            backoff_base,
            backoff_max,
            queue_qps,
            queue_burst: queue_burst.max(1),
            reconcile_timeout: seconds(parse(&lookup, "RECONCILE_TIMEOUT_SECS", 60)?),
            probe_addr: parse(&lookup, "PROBE_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
        })
    }

    /// Rate limiter for failed keys: per-key backoff bounded by an overall token bucket.
    pub fn rate_limiter(&self) -> MaxOfRateLimiter<ResourceKey> {
        let limiters: Vec<Box<dyn RateLimiter<ResourceKey>>> = vec![
            Box::new(ItemBackoffRateLimiter::new(
                self.backoff,
                self.backoff_base,
                self.backoff_max,
            )),
            Box::new(BucketRateLimiter::new(self.queue_qps, self.queue_burst)),
        ];
        MaxOfRateLimiter::new(limiters)
    }

    /// Controller settings with the configured workers, timeout and rate limiter.
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig::default()
            .workers(self.workers)
            .reconcile_timeout(self.reconcile_timeout)
            .rate_limiter(self.rate_limiter())
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T, ControllerError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e| {
            ControllerError::InvalidConfig(format!("{name}={raw:?} is invalid: {e}"))
        }),
    }
}

// Zero disables
fn seconds(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
