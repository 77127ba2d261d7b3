//! Health validation gates run against a newly started container.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::checker::{HealthError, ProbeOutcome, ProbeResult};

/// Passing probes slower than this are logged but still count as passing.
pub const SLOW_PROBE_THRESHOLD: Duration = Duration::from_secs(2);

/// Source of single health observations.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> ProbeOutcome;
}

/// Runs the retry gate and the stability window over a [`HealthProbe`].
#[derive(Clone)]
pub struct HealthValidator {
    probe: Arc<dyn HealthProbe>,
    slow_threshold: Duration,
}

impl HealthValidator {
    pub fn new(probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            probe,
            slow_threshold: SLOW_PROBE_THRESHOLD,
        }
    }

    pub fn with_slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = threshold;
        self
    }

    /// Probe up to `max_attempts` times with a fixed `interval` between
    /// attempts. Returns `Ok(true)` on the first healthy probe.
    pub async fn wait_for_healthy(
        &self,
        max_attempts: u32,
        interval: Duration,
    ) -> Result<bool, HealthError> {
        if max_attempts == 0 {
            return Err(HealthError::InvalidArgument(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        for attempt in 1..=max_attempts {
            let outcome = self.probe.probe().await;
            if outcome.is_healthy() {
                info!(attempt, max_attempts, latency_ms = outcome.latency.as_millis() as u64, "health check passed");
                return Ok(true);
            }
            debug!(attempt, max_attempts, result = ?outcome.result, "health check not passing yet");
            if attempt < max_attempts {
                tokio::time::sleep(interval).await;
            }
        }

        warn!(max_attempts, "health check failed after all attempts");
        Ok(false)
    }

    /// Require `checks` consecutive healthy probes, `interval` apart.
    /// Returns `Ok(false)` as soon as one probe fails.
    pub async fn validate_stability(
        &self,
        checks: u32,
        interval: Duration,
    ) -> Result<bool, HealthError> {
        if checks == 0 {
            return Err(HealthError::InvalidArgument(
                "checks must be at least 1".to_string(),
            ));
        }

        for check in 1..=checks {
            let outcome = self.probe.probe().await;
            if !outcome.is_healthy() {
                warn!(check, checks, result = ?outcome.result, "stability check failed");
                return Ok(false);
            }
            if outcome.latency > self.slow_threshold {
                warn!(
                    check,
                    latency_ms = outcome.latency.as_millis() as u64,
                    threshold_ms = self.slow_threshold.as_millis() as u64,
                    "slow health response during stability window"
                );
            }
            if check < checks {
                tokio::time::sleep(interval).await;
            }
        }

        info!(checks, "stability window passed");
        Ok(true)
    }
}

/// Probe that replays a fixed script of outcomes.
///
/// Once the script is exhausted the `fallback` result is returned forever.
/// Useful wherever a real endpoint is not available.
#[derive(Debug)]
pub struct ScriptedProbe {
    script: Mutex<VecDeque<ProbeOutcome>>,
    fallback: ProbeResult,
    calls: Mutex<u32>,
    delay: Duration,
}

impl ScriptedProbe {
    pub fn new(results: impl IntoIterator<Item = ProbeResult>, fallback: ProbeResult) -> Self {
        let script = results
            .into_iter()
            .map(|result| ProbeOutcome {
                result,
                latency: Duration::from_millis(1),
            })
            .collect();
        Self {
            script: Mutex::new(script),
            fallback,
            calls: Mutex::new(0),
            delay: Duration::ZERO,
        }
    }

    pub fn always(result: ProbeResult) -> Self {
        Self::new([], result)
    }

    /// Outcomes with explicit latencies.
    pub fn with_outcomes(outcomes: impl IntoIterator<Item = ProbeOutcome>, fallback: ProbeResult) -> Self {
        Self {
            script: Mutex::new(outcomes.into_iter().collect()),
            fallback,
            calls: Mutex::new(0),
            delay: Duration::ZERO,
        }
    }

    /// Sleep this long inside every probe.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> u32 {
        *self.calls.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self) -> ProbeOutcome {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        *self.calls.lock().unwrap_or_else(|p| p.into_inner()) += 1;
        self.script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
            .unwrap_or(ProbeOutcome {
                result: self.fallback,
                latency: Duration::from_millis(1),
            })
    }
}
