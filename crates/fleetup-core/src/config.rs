//! fleetup.toml configuration.
//!
//! Configuration is layered: built-in defaults, then an optional TOML
//! file, then `FLEETUP_*` environment variables. Durations are strings
//! such as `"30s"`, `"500ms"`, `"10m"` or `"1h"`; a bare number is seconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::types::{NodeIdentity, NodeTier};

/// Smallest and largest accepted backup retention.
pub const RETENTION_RANGE: std::ops::RangeInclusive<usize> = 1..=10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    pub node_id: Option<String>,
    pub tier: NodeTier,
    /// Overrides the version read from the running container's label.
    pub current_version: Option<String>,
    pub auto_update: bool,
    pub check_interval: String,
    /// Upper bound on time spent validating a new container.
    pub rollback_timeout: String,
    pub source: SourceConfig,
    pub runtime: RuntimeConfig,
    pub health: HealthConfig,
    pub backup: BackupConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub rpc_url: Option<String>,
    /// Address of the version authority contract.
    pub contract: Option<String>,
    pub timeout: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub docker_socket: PathBuf,
    pub container_label: String,
    pub stop_timeout: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub url: String,
    pub timeout: String,
    pub retries: u32,
    pub retry_interval: String,
    pub stability_checks: u32,
    pub stability_interval: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub dir: PathBuf,
    pub retention: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub url: Option<String>,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            tier: NodeTier::Validator,
            current_version: None,
            auto_update: true,
            check_interval: "1h".to_string(),
            rollback_timeout: "10m".to_string(),
            source: SourceConfig::default(),
            runtime: RuntimeConfig::default(),
            health: HealthConfig::default(),
            backup: BackupConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            rpc_url: None,
            contract: None,
            timeout: "10s".to_string(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_socket: PathBuf::from("/var/run/docker.sock"),
            container_label: crate::types::LABEL_MANAGED.to_string(),
            stop_timeout: "30s".to_string(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080/health".to_string(),
            timeout: "5s".to_string(),
            retries: 30,
            retry_interval: "10s".to_string(),
            stability_checks: 6,
            stability_interval: "10s".to_string(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/lib/fleetup/backups"),
            retention: 3,
        }
    }
}

impl UpdaterConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Defaults, then the file (if any), then the process environment.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overlay `FLEETUP_*` variables resolved through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("FLEETUP_NODE_ID") {
            self.node_id = Some(v);
        }
        if let Some(v) = get("FLEETUP_NODE_TIER") {
            self.tier = v.parse()?;
        }
        if let Some(v) = get("FLEETUP_CURRENT_VERSION") {
            self.current_version = Some(v);
        }
        if let Some(v) = get("FLEETUP_AUTO_UPDATE") {
            self.auto_update = parse_bool("auto_update", &v)?;
        }
        if let Some(v) = get("FLEETUP_CHECK_INTERVAL") {
            self.check_interval = v;
        }
        if let Some(v) = get("FLEETUP_ROLLBACK_TIMEOUT") {
            self.rollback_timeout = v;
        }
        if let Some(v) = get("FLEETUP_RPC_URL") {
            self.source.rpc_url = Some(v);
        }
        if let Some(v) = get("FLEETUP_VERSION_CONTRACT") {
            self.source.contract = Some(v);
        }
        if let Some(v) = get("FLEETUP_RPC_TIMEOUT") {
            self.source.timeout = v;
        }
        if let Some(v) = get("FLEETUP_DOCKER_SOCKET") {
            self.runtime.docker_socket = PathBuf::from(v);
        }
        if let Some(v) = get("FLEETUP_CONTAINER_LABEL") {
            self.runtime.container_label = v;
        }
        if let Some(v) = get("FLEETUP_STOP_TIMEOUT") {
            self.runtime.stop_timeout = v;
        }
        if let Some(v) = get("FLEETUP_HEALTH_URL") {
            self.health.url = v;
        }
        if let Some(v) = get("FLEETUP_HEALTH_TIMEOUT") {
            self.health.timeout = v;
        }
        if let Some(v) = get("FLEETUP_HEALTH_RETRIES") {
            self.health.retries = parse_number("health.retries", &v)?;
        }
        if let Some(v) = get("FLEETUP_HEALTH_RETRY_INTERVAL") {
            self.health.retry_interval = v;
        }
        if let Some(v) = get("FLEETUP_STABILITY_CHECKS") {
            self.health.stability_checks = parse_number("health.stability_checks", &v)?;
        }
        if let Some(v) = get("FLEETUP_STABILITY_INTERVAL") {
            self.health.stability_interval = v;
        }
        if let Some(v) = get("FLEETUP_BACKUP_DIR") {
            self.backup.dir = PathBuf::from(v);
        }
        if let Some(v) = get("FLEETUP_BACKUP_RETENTION") {
            self.backup.retention = parse_number("backup.retention", &v)?;
        }
        if let Some(v) = get("FLEETUP_TELEMETRY_URL") {
            self.telemetry.url = Some(v);
        }
        Ok(())
    }

    /// Whether enough is configured to talk to the version authority.
    pub fn is_configured(&self) -> bool {
        self.node_id.is_some() && self.source.rpc_url.is_some() && self.source.contract.is_some()
    }

    /// Check every value that would otherwise fail mid-cycle.
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(id) = &self.node_id {
            NodeIdentity::new(id.clone(), self.tier)?;
        }
        if !RETENTION_RANGE.contains(&self.backup.retention) {
            return Err(ConfigError::invalid(
                "backup.retention",
                format!(
                    "must be between {} and {}, got {}",
                    RETENTION_RANGE.start(),
                    RETENTION_RANGE.end(),
                    self.backup.retention
                ),
            ));
        }
        if self.health.retries == 0 {
            return Err(ConfigError::invalid("health.retries", "must be at least 1"));
        }
        if self.health.stability_checks == 0 {
            return Err(ConfigError::invalid(
                "health.stability_checks",
                "must be at least 1",
            ));
        }
        if self.runtime.container_label.is_empty() {
            return Err(ConfigError::invalid("runtime.container_label", "must not be empty"));
        }
        if self.check_interval()?.is_zero() {
            return Err(ConfigError::invalid("check_interval", "must be greater than zero"));
        }
        if self.rollback_timeout()?.is_zero() {
            return Err(ConfigError::invalid("rollback_timeout", "must be greater than zero"));
        }
        self.source_timeout()?;
        self.stop_timeout()?;
        self.health_timeout()?;
        self.health_retry_interval()?;
        self.stability_interval()?;
        Ok(())
    }

    /// Identity of this node; fails when `node_id` is unset or invalid.
    pub fn identity(&self) -> ConfigResult<NodeIdentity> {
        let id = self
            .node_id
            .clone()
            .ok_or_else(|| ConfigError::invalid("node_id", "not set"))?;
        NodeIdentity::new(id, self.tier)
    }

    pub fn check_interval(&self) -> ConfigResult<Duration> {
        duration_field("check_interval", &self.check_interval)
    }

    pub fn rollback_timeout(&self) -> ConfigResult<Duration> {
        duration_field("rollback_timeout", &self.rollback_timeout)
    }

    pub fn source_timeout(&self) -> ConfigResult<Duration> {
        duration_field("source.timeout", &self.source.timeout)
    }

    pub fn stop_timeout(&self) -> ConfigResult<Duration> {
        duration_field("runtime.stop_timeout", &self.runtime.stop_timeout)
    }

    pub fn health_timeout(&self) -> ConfigResult<Duration> {
        duration_field("health.timeout", &self.health.timeout)
    }

    pub fn health_retry_interval(&self) -> ConfigResult<Duration> {
        duration_field("health.retry_interval", &self.health.retry_interval)
    }

    pub fn stability_interval(&self) -> ConfigResult<Duration> {
        duration_field("health.stability_interval", &self.health.stability_interval)
    }
}

fn duration_field(key: &'static str, value: &str) -> ConfigResult<Duration> {
    parse_duration(value)
        .ok_or_else(|| ConfigError::invalid(key, format!("unparsable duration '{value}'")))
}

fn parse_bool(key: &'static str, value: &str) -> ConfigResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::invalid(key, format!("expected a boolean, got '{other}'"))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, value: &str) -> ConfigResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid(key, format!("expected a number, got '{value}'")))
}

/// Parse a duration string like "5s", "500ms", "2m", "1h".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        let m = mins.parse::<u64>().ok()?;
        m.checked_mul(60).map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        let h = hours.parse::<u64>().ok()?;
        h.checked_mul(3600).map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
