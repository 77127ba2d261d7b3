//! Error types for version source lookups.

use thiserror::Error;

/// Result type alias for version source operations.
pub type SourceResult<T> = Result<T, SourceError>;

/// Errors raised while reading release data.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("version source unreachable: {0}")]
    Transport(String),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("malformed release data: {0}")]
    Decode(String),

    #[error("invalid source configuration: {0}")]
    Config(String),
}
