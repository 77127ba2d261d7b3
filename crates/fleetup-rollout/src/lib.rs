//! fleetup staged rollout — cohort assignment and the update state machine.
//!
//! This crate decides whether this node should take a published release
//! and, if so, sequences the container swap with health-gated promotion
//! and rollback on failure.
//!
//! # Components
//!
//! - **`cohort`** — Deterministic percentile bucketing and time-gated bands
//! - **`orchestrator`** — One check-and-update cycle (pull, backup, swap, validate, commit/rollback)

pub mod cohort;
pub mod error;
pub mod orchestrator;

pub use cohort::{CohortAssigner, percentile_bucket};
pub use error::{CycleResult, UpdateError};
pub use orchestrator::{OrchestratorSettings, RecoveryOutcome, UpdateOrchestrator};
