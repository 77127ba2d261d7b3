//! fleetupd — the fleetup node updater daemon.
//!
//! - **`agent`** — wires the subsystems together and runs the update schedule
//! - **`telemetry`** — fire-and-forget delivery of cycle results

pub mod agent;
pub mod telemetry;
