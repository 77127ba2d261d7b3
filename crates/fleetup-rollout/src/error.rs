//! Error types for the update cycle.

use thiserror::Error;

use fleetup_backup::BackupError;
use fleetup_health::HealthError;
use fleetup_runtime::RuntimeError;
use fleetup_source::SourceError;

/// Result type alias for update cycle steps.
pub type CycleResult<T> = Result<T, UpdateError>;

/// Errors raised by a step of the update cycle.
///
/// The orchestrator never returns these to its caller directly; they end
/// up as the `error` of an [`UpdateResult`](fleetup_core::UpdateResult).
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("version source: {0}")]
    Source(#[from] SourceError),

    #[error("container runtime: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("backup: {0}")]
    Backup(#[from] BackupError),

    #[error("health validation: {0}")]
    Health(#[from] HealthError),

    #[error("invalid release version '{0}'")]
    InvalidVersion(String),

    #[error("no managed container is running")]
    NoManagedContainer,
}
