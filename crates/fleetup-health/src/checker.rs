//! Single HTTP health probe.
//!
//! A probe is one bounded-timeout `GET` against the node's health
//! endpoint; any 2xx response counts as healthy.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::validator::HealthProbe;

/// Errors for malformed health validation calls.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HealthError {
    #[error("invalid health url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The health endpoint returned 2xx.
    Healthy,
    /// The health endpoint returned non-2xx.
    Unhealthy,
    /// The probe could not be executed (connection error or timeout).
    Failed,
}

/// A probe result with the time it took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub result: ProbeResult,
    pub latency: Duration,
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        self.result == ProbeResult::Healthy
    }
}

/// Parsed `http://host:port/path` health endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTarget {
    /// `host:port` to connect to.
    pub address: String,
    /// Path and query to request.
    pub path: String,
}

impl HealthTarget {
    pub fn parse(url: &str) -> Result<Self, HealthError> {
        let invalid = |reason: &str| HealthError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let uri: http::Uri = url.parse().map_err(|e: http::uri::InvalidUri| invalid(&e.to_string()))?;
        match uri.scheme_str() {
            Some("http") => {}
            Some(other) => return Err(invalid(&format!("unsupported scheme '{other}'"))),
            None => return Err(invalid("missing scheme")),
        }
        let host = uri.host().ok_or_else(|| invalid("missing host"))?;
        let port = uri.port_u16().unwrap_or(80);
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "/".to_string());

        Ok(Self {
            address: format!("{host}:{port}"),
            path,
        })
    }
}

/// Probes a fixed HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    target: HealthTarget,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, HealthError> {
        Ok(Self {
            target: HealthTarget::parse(url)?,
            timeout,
        })
    }

    pub fn target(&self) -> &HealthTarget {
        &self.target
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self) -> ProbeOutcome {
        let started = Instant::now();
        let result = http_probe(&self.target.address, &self.target.path, self.timeout).await;
        ProbeOutcome {
            result,
            latency: started.elapsed(),
        }
    }
}

/// Perform an HTTP health probe against an endpoint.
///
/// Returns `Healthy` if the response is 2xx, `Unhealthy` for non-2xx,
/// or `Failed` if the connection fails or times out.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "health probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "health probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(path)
            .header("host", address)
            .header("user-agent", "fleetup-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %uri, "health probe request invalid");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) => {
                if resp.status().is_success() {
                    ProbeResult::Healthy
                } else {
                    debug!(status = %resp.status(), %uri, "health probe non-2xx");
                    ProbeResult::Unhealthy
                }
            }
            Err(e) => {
                debug!(error = %e, %uri, "health probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    match result {
        Ok(probe) => probe,
        Err(_) => {
            debug!(%uri, "health probe timed out");
            ProbeResult::Failed
        }
    }
}
