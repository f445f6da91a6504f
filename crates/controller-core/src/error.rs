//! Controller core error types.

use thiserror::Error;

/// Errors deriving a [`crate::ResourceKey`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    /// Object metadata carries no name
    #[error("object has no name")]
    MissingName,

    /// String is not of the form `<namespace>/<name>` or `<name>`
    #[error("invalid resource key: {0:?}")]
    Invalid(String),
}

/// Errors that end a controller run.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Cancelled before the cache finished its initial list
    #[error("timed out waiting for caches to sync for controller {0}")]
    CacheSyncFailed(String),

    /// `run` called more than once
    #[error("controller {0} has already been started")]
    AlreadyStarted(String),

    /// Probe server failed to bind or serve
    #[error("probe server error: {0}")]
    Server(#[from] std::io::Error),
}
