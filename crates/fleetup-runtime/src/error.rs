//! Error types for container runtime operations.

use thiserror::Error;

/// Result type alias for container runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors returned by a [`ContainerRuntime`](crate::ContainerRuntime).
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to connect to container runtime: {0}")]
    Connect(String),

    #[error("runtime request failed: {0}")]
    Request(String),

    #[error("runtime API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("failed to decode runtime response: {0}")]
    Decode(String),

    #[error("image pull failed for {image}: {message}")]
    Pull { image: String, message: String },
}
