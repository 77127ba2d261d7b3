//! fleetup-runtime — the container runtime seam.
//!
//! The update engine only sequences calls against a runtime; it never
//! manipulates containers itself. [`ContainerRuntime`] is that contract.
//!
//! # Implementations
//!
//! - **`docker`** — Docker Engine API over the local unix socket
//! - **`memory`** — in-process runtime with failure injection, for tests
//!
//! Every call returns a [`RuntimeError`] carrying the reason instead of a
//! bare boolean; callers treat any error as "abort this step".

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use fleetup_core::{ContainerInfo, ContainerSpec, LABEL_NAME, LABEL_RESTORED_FROM, LABEL_VERSION};

pub mod docker;
pub mod error;
pub mod memory;

pub use docker::DockerRuntime;
pub use error::{RuntimeError, RuntimeResult};
pub use memory::{FailPoint, InMemoryRuntime};

/// Operations the update engine needs from a container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pull an image so it is present locally.
    async fn pull(&self, image: &str) -> RuntimeResult<()>;

    /// Find the running managed container.
    ///
    /// Zero containers is `Ok(None)`. More than one is tolerated with a
    /// warning and the most recently created one is returned.
    async fn find_managed(&self) -> RuntimeResult<Option<ContainerInfo>>;

    /// Read a container's full runtime configuration.
    async fn inspect(&self, id: &str) -> RuntimeResult<ContainerSpec>;

    /// Stop a container, waiting up to `timeout` for a graceful exit.
    async fn stop(&self, id: &str, timeout: Duration) -> RuntimeResult<()>;

    /// Create and start a container running `image` with the env, ports,
    /// volumes, restart policy and labels of `template`. `labels` are
    /// applied on top of the template's labels.
    async fn start_from(
        &self,
        image: &str,
        template: &ContainerSpec,
        labels: &BTreeMap<String, String>,
    ) -> RuntimeResult<ContainerInfo>;

    /// Remove a container. A container that no longer exists is not an error.
    async fn remove(&self, id: &str, force: bool) -> RuntimeResult<()>;

    async fn image_exists(&self, image: &str) -> RuntimeResult<bool>;

    /// Remove superseded images of the same repositories as `keep`.
    /// Returns the number of images removed.
    async fn prune_except(&self, keep: &[String]) -> RuntimeResult<usize>;
}

/// Labels for a container started from `template` with `overrides`.
pub fn merged_labels(
    template: &ContainerSpec,
    overrides: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let base = template.base_name().to_string();
    let mut labels = template.labels.clone();
    labels.remove(LABEL_RESTORED_FROM);
    labels.insert(LABEL_NAME.to_string(), base);
    labels.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    labels
}

/// Container name for a new generation: `<base>-<version>` or
/// `<base>-restored-<timestamp>` for restorations.
pub fn derive_name(labels: &BTreeMap<String, String>, fallback: &str) -> String {
    let base = labels.get(LABEL_NAME).map(String::as_str).unwrap_or(fallback);
    let suffix = match (labels.get(LABEL_RESTORED_FROM), labels.get(LABEL_VERSION)) {
        (Some(ts), _) => format!("restored-{ts}"),
        (None, Some(version)) => version.clone(),
        (None, None) => "next".to_string(),
    };
    sanitize_name(&format!("{base}-{suffix}"))
}

/// Repository part of an image reference (`registry:5000/app:1.0` → `registry:5000/app`).
pub fn image_repository(image: &str) -> &str {
    let image = image.split('@').next().unwrap_or(image);
    match image.rfind(':') {
        Some(idx) if !image[idx..].contains('/') => &image[..idx],
        _ => image,
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}
