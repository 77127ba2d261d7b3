//! Telemetry reporter.
//!
//! Posts each cycle's [`UpdateResult`] as JSON to a configured endpoint.
//! Delivery runs on its own task and never feeds back into the update
//! schedule; failures are only logged.

use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use fleetup_core::{NodeIdentity, NodeTier, UpdateResult};

const REPORT_TIMEOUT: Duration = Duration::from_secs(10);

/// Body sent to the telemetry endpoint.
#[derive(Debug, Serialize)]
pub struct TelemetryReport<'a> {
    pub node_id: &'a str,
    pub tier: NodeTier,
    #[serde(flatten)]
    pub result: &'a UpdateResult,
}

#[derive(Debug, Clone)]
pub struct TelemetryReporter {
    client: reqwest::Client,
    url: String,
    node_id: String,
    tier: NodeTier,
}

impl TelemetryReporter {
    pub fn new(url: &str, identity: &NodeIdentity) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REPORT_TIMEOUT)
            .user_agent("fleetupd/0.1")
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            node_id: identity.node_id().to_string(),
            tier: identity.tier(),
        })
    }

    /// Deliver one result and wait for the response.
    pub async fn send(&self, result: &UpdateResult) -> reqwest::Result<()> {
        let report = TelemetryReport {
            node_id: &self.node_id,
            tier: self.tier,
            result,
        };
        self.client
            .post(&self.url)
            .json(&report)
            .send()
            .await?
            .error_for_status()?;
        debug!(url = %self.url, status = %result.status, "telemetry delivered");
        Ok(())
    }

    /// Deliver in the background. The handle may be dropped.
    pub fn report(&self, result: UpdateResult) -> JoinHandle<()> {
        let reporter = self.clone();
        tokio::spawn(async move {
            if let Err(e) = reporter.send(&result).await {
                warn!(url = %reporter.url, error = %e, "telemetry delivery failed");
            }
        })
    }
}
