//! HelloType Controller
//!
//! Watches `HelloType` resources and acknowledges each one in its status.
//!
//! The informer, probe server and controller share one cancellation token that
//! SIGINT/SIGTERM fire. A failing probe server fires it too. The process exits
//! non-zero if the cache never synced or the probe server failed.

mod config;
mod error;
mod reconciler;

use std::sync::Arc;

use controller_core::server::{self, ProbeState};
use controller_core::{CancellationToken, Controller, ControllerMetrics, Informer};
use crds::HelloType;
use kube::{Api, Client};
use kube_runtime::watcher;
use prometheus::Registry;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Settings;
use crate::error::ControllerError;
use crate::reconciler::{HelloTypeReconciler, KubeStatusClient};

const CONTROLLER_NAME: &str = "hellotype";

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // kube's rustls-tls feature needs an explicit process-wide crypto provider
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        info!("rustls crypto provider already installed");
    }

    info!("Starting HelloType Controller");

    let settings = Settings::from_env()?;
    info!("Configuration:");
    info!("  Namespace: {}", settings.namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Workers: {}", settings.workers);
    info!("  Resync period: {:?}", settings.resync_period);
    info!(
        "  Backoff: {:?} {:?}..{:?}, {} qps / {} burst",
        settings.backoff, settings.backoff_base, settings.backoff_max, settings.queue_qps, settings.queue_burst
    );
    info!("  Reconcile timeout: {:?}", settings.reconcile_timeout);
    info!("  Probe address: {}", settings.probe_addr);

    let client = Client::try_default().await?;
    let api: Api<HelloType> = match settings.namespace.as_deref() {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    };

    let registry = Registry::new();
    let metrics = Arc::new(ControllerMetrics::register(&registry)?);

    let informer = Arc::new(Informer::<HelloType>::new(CONTROLLER_NAME));
    let reconciler = Arc::new(HelloTypeReconciler::new(
        Arc::clone(&informer),
        KubeStatusClient::new(client),
    ));
    let controller = Controller::new(
        CONTROLLER_NAME,
        Arc::clone(&informer),
        reconciler,
        settings.controller_config(),
        metrics,
    );

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone())?;

    let informer_task = {
        let informer = Arc::clone(&informer);
        let cancel = cancel.clone();
        let resync = settings.resync_period;
        tokio::spawn(async move {
            informer
                .run(api, watcher::Config::default(), resync, cancel)
                .await;
        })
    };

    let probe = server::router(ProbeState {
        registry,
        controller_state: controller.subscribe_state(),
    });
    let probe_task = tokio::spawn(server::serve(settings.probe_addr, probe, cancel.clone()));

    let result = controller.run(cancel.clone()).await;

    // Whatever ended the controller, take the rest of the process down with it
    cancel.cancel();
    if let Err(e) = informer_task.await {
        error!("Informer task failed: {}", e);
    }
    let served = match probe_task.await {
        Ok(served) => served,
        Err(e) => {
            error!("Probe server task failed: {}", e);
            Ok(())
        }
    };

    if let Err(e) = &result {
        error!("HelloType Controller failed: {}", e);
    }
    result?;
    served?;

    info!("HelloType Controller stopped");
    Ok(())
}

/// Cancels `cancel` on SIGINT or SIGTERM.
#[cfg(unix)]
fn spawn_signal_handler(cancel: CancellationToken) -> Result<(), ControllerError> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
            _ = sigterm.recv() => info!("Received SIGTERM (pod termination), initiating graceful shutdown"),
        }
        cancel.cancel();
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_signal_handler(cancel: CancellationToken) -> Result<(), ControllerError> {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, initiating graceful shutdown");
                cancel.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });
    Ok(())
}
