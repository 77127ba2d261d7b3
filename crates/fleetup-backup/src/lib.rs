//! fleetup-backup — durable snapshots of container configuration.
//!
//! A backup is taken immediately before the first destructive step of an
//! update and is what makes the swap safe to retry.
//!
//! # Layout
//!
//! ```text
//! <backup dir>/
//!   backup-<timestamp ms>/
//!     config.json    full ContainerSpec
//!     env.json       environment variables only
//!     metadata.json  BackupRecord (written last)
//! ```
//!
//! A directory without `metadata.json` is an interrupted backup and is
//! ignored by listing. Records are immutable once written and are only
//! deleted by [`BackupStore::cleanup_old`].

pub mod error;
pub mod store;

pub use error::{BackupError, BackupResult};
pub use store::BackupStore;
