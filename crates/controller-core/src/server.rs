//! Health, readiness and metrics endpoints.

use std::net::SocketAddr;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::controller::ControllerState;
use crate::error::ControllerError;

/// Shared state for the probe handlers.
#[derive(Debug, Clone)]
pub struct ProbeState {
    /// Registry rendered by `/metrics`
    pub registry: Registry,
    /// Lifecycle state consulted by `/readyz`
    pub controller_state: watch::Receiver<ControllerState>,
}

/// Builds the `/healthz`, `/readyz` and `/metrics` router.
pub fn router(state: ProbeState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves `router` on `addr` until `cancel` fires.
///
/// A bind or serve failure is logged and cancels `cancel`, so everything sharing
/// the token shuts down with the server instead of running without health checks.
pub async fn serve(
    addr: SocketAddr,
    router: Router,
    cancel: CancellationToken,
) -> Result<(), ControllerError> {
    let result = listen(addr, router, cancel.clone()).await;
    if let Err(e) = &result {
        error!(%addr, error = %e, "server failed, shutting down");
        cancel.cancel();
    }
    result
}

async fn listen(addr: SocketAddr, router: Router, cancel: CancellationToken) -> Result<(), ControllerError> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "probe server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<ProbeState>) -> impl IntoResponse {
    let current = *state.controller_state.borrow();
    if current == ControllerState::Running {
        (StatusCode::OK, current.to_string())
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, current.to_string())
    }
}

async fn metrics(State(state): State<ProbeState>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&state.registry.gather()) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, encoder.format_type().to_string())],
            body,
        ),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain".to_string())],
                e.to_string(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::metrics::ControllerMetrics;

    fn endpoints(state: ControllerState) -> (Router, Registry) {
        let registry = Registry::new();
        let (_tx, rx) = watch::channel(state);
        let app = router(ProbeState {
            registry: registry.clone(),
            controller_state: rx,
        });
        (app, registry)
    }

    async fn get_path(app: Router, path: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(path).body(Body::empty()).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    #[tokio::test]
    async fn test_healthz_always_ok() {
        let (app, _) = endpoints(ControllerState::WaitingForSync);
        let (status, body) = get_path(app, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn test_readyz_follows_controller_state() {
        let (app, _) = endpoints(ControllerState::Running);
        assert_eq!(get_path(app, "/readyz").await.0, StatusCode::OK);

        let (app, _) = endpoints(ControllerState::WaitingForSync);
        let (status, body) = get_path(app, "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "waiting-for-sync");

        let (app, _) = endpoints(ControllerState::Draining);
        assert_eq!(get_path(app, "/readyz").await.0, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_metrics_renders_registry() {
        let (app, registry) = endpoints(ControllerState::Running);
        let metrics = ControllerMetrics::register(&registry).unwrap();
        metrics.requeued("hellotype");

        let (status, body) = get_path(app, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("controller_requeues_total{controller=\"hellotype\"} 1"));
    }

    #[tokio::test]
    async fn test_bind_failure_cancels_shared_token() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        let (app, _) = endpoints(ControllerState::Running);
        let cancel = CancellationToken::new();

        let err = serve(addr, app, cancel.clone()).await.unwrap_err();

        assert!(matches!(err, ControllerError::Server(_)), "{err}");
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_serve_stops_on_cancel() {
        let (app, _) = endpoints(ControllerState::Running);
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(([127, 0, 0, 1], 0).into(), app, cancel.clone()));

        cancel.cancel();
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), server)
            .await
            .expect("server did not stop")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let (app, _) = endpoints(ControllerState::Running);
        assert_eq!(get_path(app, "/nope").await.0, StatusCode::NOT_FOUND);
    }
}
