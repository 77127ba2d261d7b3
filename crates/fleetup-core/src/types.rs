//! Shared types used across fleetup crates.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Label marking a container as managed by the agent.
pub const LABEL_MANAGED: &str = "fleetup.managed";
/// Label carrying the release version a container runs.
pub const LABEL_VERSION: &str = "fleetup.version";
/// Label carrying the stable base name used to derive container names.
pub const LABEL_NAME: &str = "fleetup.name";
/// Label set on containers recreated from a backup.
pub const LABEL_RESTORED_FROM: &str = "fleetup.restored-from";

// ── Node identity ──────────────────────────────────────────────────

/// Node class. Each tier follows its own release train.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeTier {
    Validator,
    Guardian,
    Oracle,
}

impl NodeTier {
    /// On-chain tier index passed to the version authority.
    pub fn index(self) -> u8 {
        match self {
            NodeTier::Validator => 0,
            NodeTier::Guardian => 1,
            NodeTier::Oracle => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeTier::Validator => "validator",
            NodeTier::Guardian => "guardian",
            NodeTier::Oracle => "oracle",
        }
    }
}

impl fmt::Display for NodeTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeTier {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "validator" => Ok(NodeTier::Validator),
            "guardian" => Ok(NodeTier::Guardian),
            "oracle" => Ok(NodeTier::Oracle),
            other => Err(ConfigError::invalid("tier", format!("unknown tier '{other}'"))),
        }
    }
}

/// Immutable per-deployment identity of this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    node_id: String,
    tier: NodeTier,
}

impl NodeIdentity {
    pub const MIN_ID_LEN: usize = 8;
    pub const MAX_ID_LEN: usize = 64;

    /// Build an identity, rejecting node ids outside 8–64 characters.
    pub fn new(node_id: impl Into<String>, tier: NodeTier) -> ConfigResult<Self> {
        let node_id = node_id.into();
        let len = node_id.chars().count();
        if !(Self::MIN_ID_LEN..=Self::MAX_ID_LEN).contains(&len) {
            return Err(ConfigError::invalid(
                "node_id",
                format!(
                    "must be {}-{} characters, got {len}",
                    Self::MIN_ID_LEN,
                    Self::MAX_ID_LEN
                ),
            ));
        }
        Ok(Self { node_id, tier })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn tier(&self) -> NodeTier {
        self.tier
    }
}

// ── Releases ───────────────────────────────────────────────────────

/// Staged-rollout policy published alongside a release.
///
/// `canary_percent + 4 * cohort_percent` may be less than 100; nodes whose
/// bucket falls beyond the last band never receive the release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutPolicy {
    pub canary_percent: u8,
    pub cohort_percent: u8,
    pub inter_cohort_delay_secs: u64,
}

/// A release as published by the version authority for one tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub version: String,
    /// Deployable image reference.
    pub artifact_tag: String,
    /// Unix timestamp (seconds) of publication.
    pub published_at: u64,
    pub active: bool,
    pub rollout: RolloutPolicy,
}

/// Parse a release version, tolerating a leading `v`.
pub fn parse_version(s: &str) -> Option<semver::Version> {
    let s = s.trim();
    let s = s.strip_prefix('v').unwrap_or(s);
    semver::Version::parse(s).ok()
}

/// Eligibility of this node for a release, derived per cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "cohort", content = "index")]
pub enum CohortDecision {
    /// Eligible immediately on publication.
    Canary,
    /// Staged cohort 1–4 whose time gate has elapsed.
    Cohort(u8),
    NotEligible,
}

impl CohortDecision {
    pub fn is_eligible(self) -> bool {
        !matches!(self, CohortDecision::NotEligible)
    }
}

impl fmt::Display for CohortDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CohortDecision::Canary => f.write_str("canary"),
            CohortDecision::Cohort(i) => write!(f, "cohort{i}"),
            CohortDecision::NotEligible => f.write_str("not-eligible"),
        }
    }
}

// ── Containers ─────────────────────────────────────────────────────

/// A host port binding for one container port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    #[serde(default)]
    pub host_ip: String,
    pub host_port: String,
}

/// Container restart policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicy {
    pub name: String,
    #[serde(default)]
    pub maximum_retry_count: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            name: "unless-stopped".to_string(),
            maximum_retry_count: 0,
        }
    }
}

/// Runtime configuration of a container, enough to recreate it.
///
/// This is a configuration snapshot, not a filesystem snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Container port (`8080/tcp`) → host bindings.
    #[serde(default)]
    pub port_bindings: BTreeMap<String, Vec<PortBinding>>,
    /// Volume binds in `host:container[:mode]` form.
    #[serde(default)]
    pub binds: Vec<String>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default)]
    pub network_mode: Option<String>,
}

impl ContainerSpec {
    /// Base name shared by every generation of this container.
    pub fn base_name(&self) -> &str {
        self.labels
            .get(LABEL_NAME)
            .map(String::as_str)
            .unwrap_or_else(|| self.name.trim_start_matches('/'))
    }

    pub fn version(&self) -> Option<&str> {
        self.labels.get(LABEL_VERSION).map(String::as_str)
    }
}

/// Reference to a live container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub version: Option<String>,
    pub running: bool,
}

// ── Backups ────────────────────────────────────────────────────────

/// Metadata for one pre-update configuration snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Unix timestamp (milliseconds) the backup was taken; also its key.
    pub timestamp: u64,
    pub source_version: String,
    pub source_artifact_tag: String,
    pub container_id: String,
    pub storage_path: String,
}

// ── Update cycle ───────────────────────────────────────────────────

/// Status of the update state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    Idle,
    Checking,
    Downloading,
    Updating,
    Validating,
    Success,
    RolledBack,
    Failed,
}

impl UpdateStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UpdateStatus::Success | UpdateStatus::RolledBack | UpdateStatus::Failed
        )
    }
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UpdateStatus::Idle => "idle",
            UpdateStatus::Checking => "checking",
            UpdateStatus::Downloading => "downloading",
            UpdateStatus::Updating => "updating",
            UpdateStatus::Validating => "validating",
            UpdateStatus::Success => "success",
            UpdateStatus::RolledBack => "rolled_back",
            UpdateStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Outcome of one check-and-update cycle, handed to telemetry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateResult {
    /// `Idle` when nothing was applied.
    pub status: UpdateStatus,
    pub from_version: String,
    /// Release seen this cycle, applied or not.
    pub to_version: Option<String>,
    pub cohort: Option<CohortDecision>,
    /// Human-readable explanation of the terminal state.
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupRecord>,
    pub duration_ms: u64,
}

impl UpdateResult {
    /// Whether the cycle changed the running container.
    pub fn applied(&self) -> bool {
        self.status == UpdateStatus::Success
    }
}
