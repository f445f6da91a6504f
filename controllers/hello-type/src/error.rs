//! Controller-specific error types.

use kube::Error as KubeError;
use thiserror::Error;

/// Errors that stop the HelloType controller process.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Controller runtime error (cache sync, probe server)
    #[error(transparent)]
    Core(#[from] controller_core::ControllerError),

    /// Metrics registration failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Signal handler setup failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
