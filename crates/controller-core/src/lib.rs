//! Controller Core
//!
//! The generic reconciliation loop shared by the sample controllers:
//!
//! - [`informer`]: watch-fed local cache of custom resources ([`CacheMirror`])
//! - [`handler`]: turns cache notifications into [`ResourceKey`]s on the work queue
//! - `worker`: pulls keys off the queue and runs the pluggable [`Reconcile`] function
//! - [`controller`]: startup and shutdown ordering around a single cancellation token
//! - [`server`]: `/healthz`, `/readyz` and `/metrics` for the process
//!
//! Data flow: cluster events → informer → handler → work queue → workers →
//! reconcile → work queue (on failure) or forget (on success).

#![warn(missing_docs)]

pub mod cache;
pub mod controller;
pub mod error;
pub mod handler;
pub mod informer;
pub mod key;
pub mod metrics;
pub mod reconcile;
pub mod server;
mod worker;

pub use cache::{CacheMirror, EventHandler};
pub use controller::{Controller, ControllerConfig, ControllerState};
pub use error::{ControllerError, KeyError};
pub use handler::EnqueueHandler;
pub use informer::Informer;
pub use key::ResourceKey;
pub use metrics::ControllerMetrics;
pub use reconcile::{Reconcile, ReconcileError, ReconcileFn, reconcile_fn};
pub use server::ProbeState;
pub use tokio_util::sync::CancellationToken;
