//! JSON-RPC version source.
//!
//! Reads the current release by issuing `eth_call` against the version
//! authority contract. Each lookup is a fresh read; nothing is cached
//! between polls because rollout parameters may change at any time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use fleetup_core::{NodeTier, ReleaseInfo};

use crate::VersionSource;
use crate::abi;
use crate::error::{SourceError, SourceResult};

/// Version source backed by an Ethereum-style JSON-RPC endpoint.
#[derive(Debug)]
pub struct RpcVersionSource {
    client: reqwest::Client,
    rpc_url: String,
    contract: String,
    next_id: AtomicU64,
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

impl RpcVersionSource {
    pub fn new(rpc_url: &str, contract: &str, timeout: Duration) -> SourceResult<Self> {
        if !is_address(contract) {
            return Err(SourceError::Config(format!(
                "contract address '{contract}' is not a 20-byte hex address"
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("fleetup/0.1")
            .build()
            .map_err(|e| SourceError::Config(e.to_string()))?;
        Ok(Self {
            client,
            rpc_url: rpc_url.to_string(),
            contract: contract.to_string(),
            next_id: AtomicU64::new(1),
        })
    }

    async fn call(&self, method: &str, params: Value) -> SourceResult<Value> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let response = self
            .client
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Transport(format!("{method}: http {status}")));
        }

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| SourceError::Decode(format!("{method}: {e}")))?;

        if let Some(err) = body.error {
            return Err(SourceError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        body.result
            .ok_or_else(|| SourceError::Decode(format!("{method}: response has no result")))
    }
}

#[async_trait]
impl VersionSource for RpcVersionSource {
    async fn current_release(&self, tier: NodeTier) -> SourceResult<Option<ReleaseInfo>> {
        let data = abi::encode_u8_call(abi::GET_CURRENT_VERSION, tier.index());
        let result = self
            .call(
                "eth_call",
                json!([{ "to": self.contract, "data": data }, "latest"]),
            )
            .await?;

        let hex = result
            .as_str()
            .ok_or_else(|| SourceError::Decode("eth_call result is not a string".to_string()))?;
        let release = abi::decode_release(&abi::decode_hex(hex)?)?;

        match &release {
            Some(r) => debug!(%tier, version = %r.version, tag = %r.artifact_tag, "release found"),
            None => debug!(%tier, "no active release"),
        }
        Ok(release)
    }

    async fn test_connection(&self) -> bool {
        match self.call("eth_chainId", json!([])).await {
            Ok(chain_id) => {
                debug!(%chain_id, url = %self.rpc_url, "version source reachable");
                true
            }
            Err(e) => {
                warn!(error = %e, url = %self.rpc_url, "version source unreachable");
                false
            }
        }
    }
}

fn is_address(s: &str) -> bool {
    s.strip_prefix("0x")
        .is_some_and(|h| h.len() == 40 && h.chars().all(|c| c.is_ascii_hexdigit()))
}
