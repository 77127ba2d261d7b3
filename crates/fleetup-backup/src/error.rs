//! Error types for the backup store.

use thiserror::Error;

use fleetup_runtime::RuntimeError;

/// Result type alias for backup store operations.
pub type BackupResult<T> = Result<T, BackupError>;

/// Errors that can occur while creating, reading, or restoring backups.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup io error at {path}: {message}")]
    Io { path: String, message: String },

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error in {path}: {message}")]
    Deserialize { path: String, message: String },

    #[error("retention must be between 1 and 10, got {0}")]
    InvalidRetention(usize),

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}
