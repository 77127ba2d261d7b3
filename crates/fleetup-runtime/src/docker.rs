//! Docker Engine API binding.
//!
//! Speaks HTTP/1.1 to the daemon's unix socket with a fresh hyper
//! connection per request. Only the handful of endpoints the update
//! engine needs are wrapped.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use fleetup_core::{ContainerInfo, ContainerSpec, LABEL_VERSION, PortBinding, RestartPolicy};

use crate::error::{RuntimeError, RuntimeResult};
use crate::{ContainerRuntime, derive_name, image_repository, merged_labels};

const API_PREFIX: &str = "/v1.41";

/// Container runtime backed by a local Docker daemon.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    socket: PathBuf,
    managed_label: String,
}

impl DockerRuntime {
    pub fn new(socket: impl Into<PathBuf>, managed_label: &str) -> Self {
        Self {
            socket: socket.into(),
            managed_label: managed_label.to_string(),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Check that the daemon answers `/_ping`.
    pub async fn ping(&self) -> RuntimeResult<()> {
        let (status, body) = self.request(Method::GET, "/_ping", None).await?;
        expect_success(status, &body)
    }

    /// Issue one API request and collect the full response body.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> RuntimeResult<(StatusCode, Bytes)> {
        let uri = format!("{API_PREFIX}{path}");

        let stream = tokio::net::UnixStream::connect(&self.socket)
            .await
            .map_err(|e| RuntimeError::Connect(format!("{}: {e}", self.socket.display())))?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| RuntimeError::Connect(e.to_string()))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "docker connection closed with error");
            }
        });

        let payload = match body {
            Some(value) => Bytes::from(
                serde_json::to_vec(&value).map_err(|e| RuntimeError::Request(e.to_string()))?,
            ),
            None => Bytes::new(),
        };

        let req = Request::builder()
            .method(method.clone())
            .uri(&uri)
            .header("host", "docker")
            .header("content-type", "application/json")
            .header("user-agent", "fleetup/0.1")
            .body(Full::new(payload))
            .map_err(|e| RuntimeError::Request(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| RuntimeError::Request(format!("{method} {uri}: {e}")))?;
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| RuntimeError::Request(e.to_string()))?
            .to_bytes();

        debug!(%method, %uri, %status, "docker api call");
        Ok((status, body))
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> RuntimeResult<T> {
        let (status, body) = self.request(Method::GET, path, None).await?;
        if status == StatusCode::NOT_FOUND {
            return Err(RuntimeError::NotFound(path.to_string()));
        }
        expect_success(status, &body)?;
        serde_json::from_slice(&body).map_err(|e| RuntimeError::Decode(e.to_string()))
    }

    async fn list_managed(&self) -> RuntimeResult<Vec<ListedContainer>> {
        let filters = serde_json::json!({
            "label": [format!("{}=true", self.managed_label)],
            "status": ["running"],
        });
        let path = format!("/containers/json?filters={}", encode_component(&filters.to_string()));
        self.get_json(&path).await
    }

    async fn name_in_use(&self, name: &str) -> RuntimeResult<bool> {
        let (status, _) = self
            .request(Method::GET, &format!("/containers/{}/json", encode_component(name)), None)
            .await?;
        Ok(status.is_success())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull(&self, image: &str) -> RuntimeResult<()> {
        info!(%image, "pulling image");
        let path = format!("/images/create?fromImage={}", encode_component(image));
        let (status, body) = self.request(Method::POST, &path, None).await?;
        if !status.is_success() {
            return Err(RuntimeError::Pull {
                image: image.to_string(),
                message: api_message(&body),
            });
        }
        // Pull progress is streamed as JSON lines; failures arrive as an
        // `error` line under a 200 status.
        for line in body.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
            if let Ok(progress) = serde_json::from_slice::<PullProgress>(line) {
                if let Some(message) = progress.error {
                    return Err(RuntimeError::Pull {
                        image: image.to_string(),
                        message,
                    });
                }
            }
        }
        Ok(())
    }

    async fn find_managed(&self) -> RuntimeResult<Option<ContainerInfo>> {
        let mut managed = self.list_managed().await?;
        if managed.len() > 1 {
            warn!(
                count = managed.len(),
                label = %self.managed_label,
                "multiple managed containers running"
            );
        }
        managed.sort_by_key(|c| std::cmp::Reverse(c.created));
        Ok(managed.into_iter().next().map(ListedContainer::into_info))
    }

    async fn inspect(&self, id: &str) -> RuntimeResult<ContainerSpec> {
        let inspected: InspectResponse = self.get_json(&format!("/containers/{id}/json")).await?;
        Ok(inspected.into_spec())
    }

    async fn stop(&self, id: &str, timeout: Duration) -> RuntimeResult<()> {
        let path = format!("/containers/{id}/stop?t={}", timeout.as_secs());
        let (status, body) = self.request(Method::POST, &path, None).await?;
        // 304: already stopped.
        if status == StatusCode::NOT_MODIFIED {
            return Ok(());
        }
        if status == StatusCode::NOT_FOUND {
            return Err(RuntimeError::NotFound(format!("container {id}")));
        }
        expect_success(status, &body)
    }

    async fn start_from(
        &self,
        image: &str,
        template: &ContainerSpec,
        labels: &BTreeMap<String, String>,
    ) -> RuntimeResult<ContainerInfo> {
        let labels = merged_labels(template, labels);
        let mut name = derive_name(&labels, template.base_name());
        if self.name_in_use(&name).await? {
            name = format!("{name}-{}", epoch_millis());
        }

        let exposed: BTreeMap<&String, serde_json::Value> = template
            .port_bindings
            .keys()
            .map(|port| (port, serde_json::json!({})))
            .collect();
        let port_bindings: BTreeMap<&String, Vec<WirePortBinding>> = template
            .port_bindings
            .iter()
            .map(|(port, bindings)| {
                (port, bindings.iter().map(WirePortBinding::from).collect())
            })
            .collect();

        let create = serde_json::json!({
            "Image": image,
            "Env": template.env,
            "Labels": labels,
            "ExposedPorts": exposed,
            "HostConfig": {
                "PortBindings": port_bindings,
                "Binds": template.binds,
                "RestartPolicy": WireRestartPolicy::from(&template.restart_policy),
                "NetworkMode": template.network_mode,
            },
        });

        let path = format!("/containers/create?name={}", encode_component(&name));
        let (status, body) = self.request(Method::POST, &path, Some(create)).await?;
        expect_success(status, &body)?;
        let created: CreateResponse =
            serde_json::from_slice(&body).map_err(|e| RuntimeError::Decode(e.to_string()))?;

        let (status, body) = self
            .request(Method::POST, &format!("/containers/{}/start", created.id), None)
            .await?;
        if status != StatusCode::NOT_MODIFIED {
            expect_success(status, &body)?;
        }

        info!(id = %created.id, %name, %image, "container started");
        Ok(ContainerInfo {
            id: created.id,
            name,
            image: image.to_string(),
            version: labels.get(LABEL_VERSION).cloned(),
            running: true,
        })
    }

    async fn remove(&self, id: &str, force: bool) -> RuntimeResult<()> {
        let path = format!("/containers/{id}?force={force}");
        let (status, body) = self.request(Method::DELETE, &path, None).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        expect_success(status, &body)
    }

    async fn image_exists(&self, image: &str) -> RuntimeResult<bool> {
        let (status, body) = self
            .request(Method::GET, &format!("/images/{image}/json"), None)
            .await?;
        match status {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            s => Err(RuntimeError::Api {
                status: s.as_u16(),
                message: api_message(&body),
            }),
        }
    }

    async fn prune_except(&self, keep: &[String]) -> RuntimeResult<usize> {
        let repos: HashSet<&str> = keep.iter().map(|k| image_repository(k)).collect();
        let images: Vec<ListedImage> = self.get_json("/images/json").await?;

        let mut removed = 0;
        for image in images {
            for tag in image.repo_tags.unwrap_or_default() {
                if keep.contains(&tag) || !repos.contains(image_repository(&tag)) {
                    continue;
                }
                let (status, body) = self
                    .request(Method::DELETE, &format!("/images/{tag}"), None)
                    .await?;
                if status.is_success() {
                    debug!(%tag, "pruned superseded image");
                    removed += 1;
                } else {
                    // Typically 409: still referenced by a stopped container.
                    warn!(%tag, %status, message = %api_message(&body), "failed to prune image");
                }
            }
        }
        Ok(removed)
    }
}

// ── Wire types ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PullProgress {
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListedContainer {
    id: String,
    #[serde(default)]
    names: Vec<String>,
    image: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    state: String,
    #[serde(default)]
    created: i64,
}

impl ListedContainer {
    fn into_info(self) -> ContainerInfo {
        ContainerInfo {
            name: self
                .names
                .first()
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            version: self.labels.get(LABEL_VERSION).cloned(),
            running: self.state == "running",
            id: self.id,
            image: self.image,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListedImage {
    repo_tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectResponse {
    name: String,
    config: InspectConfig,
    host_config: InspectHostConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    image: String,
    env: Option<Vec<String>>,
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectHostConfig {
    port_bindings: Option<BTreeMap<String, Option<Vec<WirePortBinding>>>>,
    binds: Option<Vec<String>>,
    restart_policy: Option<WireRestartPolicy>,
    network_mode: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WirePortBinding {
    #[serde(default)]
    host_ip: String,
    #[serde(default)]
    host_port: String,
}

impl From<&PortBinding> for WirePortBinding {
    fn from(b: &PortBinding) -> Self {
        Self {
            host_ip: b.host_ip.clone(),
            host_port: b.host_port.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireRestartPolicy {
    #[serde(default)]
    name: String,
    #[serde(default)]
    maximum_retry_count: u32,
}

impl From<&RestartPolicy> for WireRestartPolicy {
    fn from(p: &RestartPolicy) -> Self {
        Self {
            name: p.name.clone(),
            maximum_retry_count: p.maximum_retry_count,
        }
    }
}

impl InspectResponse {
    fn into_spec(self) -> ContainerSpec {
        let port_bindings = self
            .host_config
            .port_bindings
            .unwrap_or_default()
            .into_iter()
            .map(|(port, bindings)| {
                let bindings = bindings
                    .unwrap_or_default()
                    .into_iter()
                    .map(|b| PortBinding {
                        host_ip: b.host_ip,
                        host_port: b.host_port,
                    })
                    .collect();
                (port, bindings)
            })
            .collect();

        ContainerSpec {
            name: self.name.trim_start_matches('/').to_string(),
            image: self.config.image,
            env: self.config.env.unwrap_or_default(),
            labels: self.config.labels.unwrap_or_default(),
            port_bindings,
            binds: self.host_config.binds.unwrap_or_default(),
            restart_policy: self
                .host_config
                .restart_policy
                .map(|p| RestartPolicy {
                    name: p.name,
                    maximum_retry_count: p.maximum_retry_count,
                })
                .unwrap_or_default(),
            network_mode: self.host_config.network_mode,
        }
    }
}

// ── Helpers ────────────────────────────────────────────────────────

fn expect_success(status: StatusCode, body: &[u8]) -> RuntimeResult<()> {
    if status.is_success() {
        Ok(())
    } else {
        Err(RuntimeError::Api {
            status: status.as_u16(),
            message: api_message(body),
        })
    }
}

/// Extract `{"message": ...}` from an error body, or the raw text.
fn api_message(body: &[u8]) -> String {
    #[derive(Deserialize)]
    struct ApiError {
        message: String,
    }
    serde_json::from_slice::<ApiError>(body)
        .map(|e| e.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string())
}

/// Percent-encode a query component.
fn encode_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

fn epoch_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}
