//! The pluggable reconcile step.
//!
//! A reconciler receives only a [`ResourceKey`] and must look the object up in
//! the cache itself. It has to be idempotent, treat a missing object as a valid
//! terminal state, and finish in bounded time.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::key::ResourceKey;

/// Outcome of a failed reconcile attempt.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Transient failure, retried with backoff
    #[error("reconcile failed: {0:#}")]
    Retry(anyhow::Error),

    /// Will not succeed by retrying; the key is dropped until the next change
    #[error("reconcile failed permanently: {0:#}")]
    Permanent(anyhow::Error),

    /// The reconciler panicked; retried with backoff
    #[error("reconciler panicked: {0}")]
    Panicked(String),

    /// The attempt exceeded the configured timeout; retried with backoff
    #[error("reconcile timed out after {0:?}")]
    TimedOut(Duration),
}

impl ReconcileError {
    /// Transient failure, the key is requeued with backoff.
    pub fn retry(err: impl Into<anyhow::Error>) -> Self {
        Self::Retry(err.into())
    }

    /// Terminal failure, the key is dropped until the object changes again.
    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        Self::Permanent(err.into())
    }

    /// Whether the key should be requeued with backoff.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent(_))
    }

    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Retry(_) => "error",
            Self::Permanent(_) => "permanent",
            Self::Panicked(_) => "panic",
            Self::TimedOut(_) => "timeout",
        }
    }
}

/// Drives one object toward its desired state.
#[async_trait]
pub trait Reconcile: Send + Sync {
    /// Reconciles the object named by `key`, which may no longer exist.
    async fn reconcile(&self, key: &ResourceKey) -> Result<(), ReconcileError>;
}

/// [`Reconcile`] implemented by an async closure.
#[derive(Debug, Clone)]
pub struct ReconcileFn<F>(F);

/// Wraps `f` so it can be used as a reconciler.
pub fn reconcile_fn<F, Fut>(f: F) -> ReconcileFn<F>
where
    F: Fn(ResourceKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ReconcileError>> + Send + 'static,
{
    ReconcileFn(f)
}

#[async_trait]
impl<F, Fut> Reconcile for ReconcileFn<F>
where
    F: Fn(ResourceKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ReconcileError>> + Send + 'static,
{
    async fn reconcile(&self, key: &ResourceKey) -> Result<(), ReconcileError> {
        (self.0)(key.clone()).await
    }
}
