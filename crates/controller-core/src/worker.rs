//! Worker loop: take a key, reconcile it, report the outcome to the queue.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use workqueue::WorkQueue;

use crate::key::ResourceKey;
use crate::metrics::ControllerMetrics;
use crate::reconcile::{Reconcile, ReconcileError};

pub(crate) struct Worker<R: ?Sized> {
    pub(crate) id: usize,
    pub(crate) controller: String,
    pub(crate) queue: Arc<WorkQueue<ResourceKey>>,
    pub(crate) reconciler: Arc<R>,
    pub(crate) metrics: Arc<ControllerMetrics>,
    pub(crate) timeout: Option<Duration>,
}

impl<R> Worker<R>
where
    R: Reconcile + ?Sized + 'static,
{
    /// Processes keys until the queue is shut down and drained.
    pub(crate) async fn run(self) {
        debug!(controller = %self.controller, worker = self.id, "worker started");
        while let Some(key) = self.queue.get().await {
            self.process(&key).await;
            self.queue.done(&key);
        }
        debug!(controller = %self.controller, worker = self.id, "worker stopped");
    }

    async fn process(&self, key: &ResourceKey) {
        self.metrics.reconcile_started(&self.controller);
        let started = Instant::now();
        let result = self.invoke(key).await;
        let elapsed = started.elapsed();

        match result {
            Ok(()) => {
                self.queue.forget(key);
                self.metrics
                    .reconcile_finished(&self.controller, "success", elapsed);
                debug!(controller = %self.controller, %key, ?elapsed, "reconciled");
            }
            Err(err) if err.is_retryable() => {
                self.metrics
                    .reconcile_finished(&self.controller, err.reason(), elapsed);
                let retries = self.queue.num_requeues(key);
                warn!(
                    controller = %self.controller,
                    %key,
                    retries,
                    error = %err,
                    "reconcile failed, requeueing with backoff"
                );
                self.queue.add_rate_limited(key.clone());
                self.metrics.requeued(&self.controller);
            }
            Err(err) => {
                self.queue.forget(key);
                self.metrics
                    .reconcile_finished(&self.controller, err.reason(), elapsed);
                error!(
                    controller = %self.controller,
                    %key,
                    error = %err,
                    "reconcile failed permanently, dropping key until next change"
                );
            }
        }
    }

    /// Runs one reconcile attempt, converting panics and timeouts into errors.
    async fn invoke(&self, key: &ResourceKey) -> Result<(), ReconcileError> {
        let attempt = AssertUnwindSafe(self.reconciler.reconcile(key)).catch_unwind();

        let outcome = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, attempt).await {
                Ok(outcome) => outcome,
                Err(_) => return Err(ReconcileError::TimedOut(limit)),
            },
            None => attempt.await,
        };

        outcome.unwrap_or_else(|payload| Err(ReconcileError::Panicked(panic_message(payload.as_ref()))))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
