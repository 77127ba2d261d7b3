//! fleetup-health — health validation for freshly started containers.
//!
//! Two gates run one after the other before a new container is promoted:
//!
//! ```text
//! wait_for_healthy(max_attempts, interval)
//!   probe → healthy? done : sleep(interval) → probe …   (fail-slow)
//! validate_stability(checks, interval)
//!   probe → unhealthy? fail : sleep(interval) → probe … (fail-fast)
//! ```
//!
//! Retries use a fixed interval, not exponential backoff. An unhealthy
//! node is a normal `Ok(false)` outcome; only malformed calls are errors.

pub mod checker;
pub mod validator;

pub use checker::{HealthError, HealthTarget, HttpProbe, ProbeOutcome, ProbeResult, http_probe};
pub use validator::{HealthProbe, HealthValidator, ScriptedProbe};
