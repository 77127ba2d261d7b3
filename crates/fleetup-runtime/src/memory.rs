//! In-memory container runtime.
//!
//! Keeps containers and images in a map and records every call so tests
//! can assert on the order of side effects. Individual operations can be
//! made to fail with [`InMemoryRuntime::fail_on`].

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use fleetup_core::{ContainerInfo, ContainerSpec, LABEL_MANAGED, LABEL_VERSION};

use crate::error::{RuntimeError, RuntimeResult};
use crate::{ContainerRuntime, derive_name, image_repository, merged_labels};

/// Operations that can be forced to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Pull,
    FindManaged,
    Inspect,
    Stop,
    Start,
    Remove,
    Prune,
}

#[derive(Debug, Clone)]
struct MemContainer {
    id: String,
    spec: ContainerSpec,
    running: bool,
    seq: u64,
}

impl MemContainer {
    fn info(&self) -> ContainerInfo {
        ContainerInfo {
            id: self.id.clone(),
            name: self.spec.name.clone(),
            image: self.spec.image.clone(),
            version: self.spec.labels.get(LABEL_VERSION).cloned(),
            running: self.running,
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    containers: BTreeMap<String, MemContainer>,
    images: BTreeSet<String>,
    failures: HashSet<FailPoint>,
    calls: Vec<String>,
    next_seq: u64,
}

/// Container runtime that lives entirely in process memory.
#[derive(Debug)]
pub struct InMemoryRuntime {
    managed_label: String,
    state: Mutex<MemoryState>,
}

impl Default for InMemoryRuntime {
    fn default() -> Self {
        Self::new(LABEL_MANAGED)
    }
}

impl InMemoryRuntime {
    pub fn new(managed_label: &str) -> Self {
        Self {
            managed_label: managed_label.to_string(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a running container and its image. Returns the container id.
    pub fn seed_container(&self, spec: ContainerSpec) -> String {
        let mut state = self.lock();
        state.images.insert(spec.image.clone());
        insert_container(&mut state, spec, true)
    }

    pub fn seed_image(&self, image: &str) {
        self.lock().images.insert(image.to_string());
    }

    /// Make every subsequent call of `point` fail until cleared.
    pub fn fail_on(&self, point: FailPoint) {
        self.lock().failures.insert(point);
    }

    pub fn clear_failure(&self, point: FailPoint) {
        self.lock().failures.remove(&point);
    }

    /// Calls made so far, e.g. `"stop:c1"`, in order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn containers(&self) -> Vec<ContainerInfo> {
        let state = self.lock();
        let mut all: Vec<&MemContainer> = state.containers.values().collect();
        all.sort_by_key(|c| c.seq);
        all.into_iter().map(MemContainer::info).collect()
    }

    pub fn running(&self) -> Vec<ContainerInfo> {
        self.containers().into_iter().filter(|c| c.running).collect()
    }

    pub fn spec_of(&self, id: &str) -> Option<ContainerSpec> {
        self.lock().containers.get(id).map(|c| c.spec.clone())
    }

    pub fn images(&self) -> Vec<String> {
        self.lock().images.iter().cloned().collect()
    }

    fn enter(&self, point: FailPoint, call: String) -> RuntimeResult<MutexGuard<'_, MemoryState>> {
        let mut state = self.lock();
        state.calls.push(call.clone());
        if state.failures.contains(&point) {
            debug!(%call, "injected runtime failure");
            return Err(RuntimeError::Request(format!("injected failure: {call}")));
        }
        Ok(state)
    }

    fn is_managed(&self, spec: &ContainerSpec) -> bool {
        spec.labels.get(&self.managed_label).map(String::as_str) == Some("true")
    }
}

fn insert_container(state: &mut MemoryState, spec: ContainerSpec, running: bool) -> String {
    state.next_seq += 1;
    let seq = state.next_seq;
    let id = format!("c{seq}");
    state.containers.insert(
        id.clone(),
        MemContainer {
            id: id.clone(),
            spec,
            running,
            seq,
        },
    );
    id
}

#[async_trait]
impl ContainerRuntime for InMemoryRuntime {
    async fn pull(&self, image: &str) -> RuntimeResult<()> {
        let mut state = self.enter(FailPoint::Pull, format!("pull:{image}"))?;
        state.images.insert(image.to_string());
        Ok(())
    }

    async fn find_managed(&self) -> RuntimeResult<Option<ContainerInfo>> {
        let state = self.enter(FailPoint::FindManaged, "find_managed".to_string())?;
        let mut managed: Vec<&MemContainer> = state
            .containers
            .values()
            .filter(|c| c.running && self.is_managed(&c.spec))
            .collect();
        managed.sort_by_key(|c| std::cmp::Reverse(c.seq));
        if managed.len() > 1 {
            warn!(count = managed.len(), "multiple managed containers running");
        }
        Ok(managed.first().map(|c| c.info()))
    }

    async fn inspect(&self, id: &str) -> RuntimeResult<ContainerSpec> {
        let state = self.enter(FailPoint::Inspect, format!("inspect:{id}"))?;
        state
            .containers
            .get(id)
            .map(|c| c.spec.clone())
            .ok_or_else(|| RuntimeError::NotFound(format!("container {id}")))
    }

    async fn stop(&self, id: &str, _timeout: Duration) -> RuntimeResult<()> {
        let mut state = self.enter(FailPoint::Stop, format!("stop:{id}"))?;
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(format!("container {id}")))?;
        container.running = false;
        Ok(())
    }

    async fn start_from(
        &self,
        image: &str,
        template: &ContainerSpec,
        labels: &BTreeMap<String, String>,
    ) -> RuntimeResult<ContainerInfo> {
        let mut state = self.enter(FailPoint::Start, format!("start:{image}"))?;
        if !state.images.contains(image) {
            return Err(RuntimeError::NotFound(format!("image {image}")));
        }

        let labels = merged_labels(template, labels);
        let mut name = derive_name(&labels, template.base_name());
        if state.containers.values().any(|c| c.spec.name == name) {
            name = format!("{name}-{}", state.next_seq + 1);
        }

        let spec = ContainerSpec {
            name,
            image: image.to_string(),
            labels,
            ..template.clone()
        };
        let id = insert_container(&mut state, spec, true);
        Ok(state.containers[&id].info())
    }

    async fn remove(&self, id: &str, force: bool) -> RuntimeResult<()> {
        let mut state = self.enter(FailPoint::Remove, format!("remove:{id}"))?;
        match state.containers.get(id) {
            Some(c) if c.running && !force => Err(RuntimeError::Api {
                status: 409,
                message: format!("container {id} is running"),
            }),
            Some(_) => {
                state.containers.remove(id);
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn image_exists(&self, image: &str) -> RuntimeResult<bool> {
        let state = self.lock();
        Ok(state.images.contains(image))
    }

    async fn prune_except(&self, keep: &[String]) -> RuntimeResult<usize> {
        let mut state = self.enter(FailPoint::Prune, "prune".to_string())?;
        let repos: HashSet<&str> = keep.iter().map(|k| image_repository(k)).collect();
        let in_use: HashSet<String> = state
            .containers
            .values()
            .map(|c| c.spec.image.clone())
            .collect();
        let doomed: Vec<String> = state
            .images
            .iter()
            .filter(|img| repos.contains(image_repository(img)))
            .filter(|img| !keep.contains(img) && !in_use.contains(*img))
            .cloned()
            .collect();
        for img in &doomed {
            state.images.remove(img);
        }
        Ok(doomed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetup_core::{LABEL_NAME, RestartPolicy};

    fn spec(version: &str) -> ContainerSpec {
        ContainerSpec {
            name: "node".to_string(),
            image: format!("registry.example.com/node:{version}"),
            env: vec!["RPC=1".to_string()],
            labels: BTreeMap::from([
                (LABEL_MANAGED.to_string(), "true".to_string()),
                (LABEL_VERSION.to_string(), version.to_string()),
            ]),
            port_bindings: BTreeMap::new(),
            binds: vec!["/data:/data".to_string()],
            restart_policy: RestartPolicy::default(),
            network_mode: None,
        }
    }

    #[tokio::test]
    async fn find_managed_ignores_stopped_and_unlabelled() {
        let rt = InMemoryRuntime::default();
        let mut unmanaged = spec("0.1.0");
        unmanaged.labels.clear();
        rt.seed_container(unmanaged);
        assert!(rt.find_managed().await.unwrap().is_none());

        let id = rt.seed_container(spec("1.0.0"));
        let found = rt.find_managed().await.unwrap().unwrap();
        assert_eq!(found.id, id);

        rt.stop(&id, Duration::from_secs(1)).await.unwrap();
        assert!(rt.find_managed().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn find_managed_prefers_newest_of_many() {
        let rt = InMemoryRuntime::default();
        rt.seed_container(spec("1.0.0"));
        let newer = rt.seed_container(spec("1.1.0"));
        assert_eq!(rt.find_managed().await.unwrap().unwrap().id, newer);
    }

    #[tokio::test]
    async fn start_from_copies_template() {
        let rt = InMemoryRuntime::default();
        let old = rt.seed_container(spec("1.0.0"));
        let template = rt.inspect(&old).await.unwrap();

        rt.pull("registry.example.com/node:1.1.0").await.unwrap();
        let overrides = BTreeMap::from([(LABEL_VERSION.to_string(), "1.1.0".to_string())]);
        let new = rt
            .start_from("registry.example.com/node:1.1.0", &template, &overrides)
            .await
            .unwrap();

        let new_spec = rt.spec_of(&new.id).unwrap();
        assert_eq!(new_spec.env, template.env);
        assert_eq!(new_spec.binds, template.binds);
        assert_eq!(new_spec.labels[LABEL_NAME], "node");
        assert_eq!(new.version.as_deref(), Some("1.1.0"));
        assert_eq!(new.name, "node-1.1.0");
    }

    #[tokio::test]
    async fn start_from_requires_local_image() {
        let rt = InMemoryRuntime::default();
        let err = rt
            .start_from("missing:1", &spec("1.0.0"), &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::NotFound(_)));
    }

    #[tokio::test]
    async fn injected_failures_are_recorded() {
        let rt = InMemoryRuntime::default();
        rt.fail_on(FailPoint::Pull);
        assert!(rt.pull("x:1").await.is_err());
        rt.clear_failure(FailPoint::Pull);
        rt.pull("x:1").await.unwrap();
        assert_eq!(rt.calls(), vec!["pull:x:1", "pull:x:1"]);
    }

    #[tokio::test]
    async fn remove_running_requires_force() {
        let rt = InMemoryRuntime::default();
        let id = rt.seed_container(spec("1.0.0"));
        assert!(rt.remove(&id, false).await.is_err());
        rt.remove(&id, true).await.unwrap();
        assert!(rt.containers().is_empty());
        // Removing again is a no-op.
        rt.remove(&id, true).await.unwrap();
    }

    #[tokio::test]
    async fn prune_keeps_active_and_foreign_images() {
        let rt = InMemoryRuntime::default();
        rt.seed_image("registry.example.com/node:0.9.0");
        rt.seed_image("registry.example.com/node:1.0.0");
        rt.seed_image("registry.example.com/node:1.1.0");
        rt.seed_image("postgres:16");

        let removed = rt
            .prune_except(&["registry.example.com/node:1.1.0".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(
            rt.images(),
            vec!["postgres:16", "registry.example.com/node:1.1.0"]
        );
    }
}
