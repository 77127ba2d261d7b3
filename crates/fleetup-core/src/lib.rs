//! fleetup-core — shared types and configuration for the fleetup agent.

pub mod config;
pub mod error;
pub mod types;

pub use config::{UpdaterConfig, parse_duration};
pub use error::{ConfigError, ConfigResult};
pub use types::*;
