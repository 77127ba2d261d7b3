//! Update orchestrator — drives one check-and-update cycle.
//!
//! The cycle moves through `Checking → Downloading → Updating → Validating`
//! and ends in `Success`, `RolledBack` or `Failed`. Side effects are
//! strictly ordered: the backup is written before the old container is
//! stopped, and the old container is only removed once validation passed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use fleetup_backup::BackupStore;
use fleetup_core::{
    BackupRecord, CohortDecision, ConfigResult, ContainerInfo, LABEL_VERSION, NodeIdentity,
    ReleaseInfo, UpdateResult, UpdateStatus, UpdaterConfig, parse_version,
};
use fleetup_health::HealthValidator;
use fleetup_runtime::ContainerRuntime;
use fleetup_source::VersionSource;

use crate::cohort::CohortAssigner;
use crate::error::{CycleResult, UpdateError};

/// Version reported before anything is known about the running container.
pub const UNKNOWN_VERSION: &str = "unknown";

/// Timing and policy knobs for the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub auto_update: bool,
    pub stop_timeout: Duration,
    pub health_retries: u32,
    pub health_retry_interval: Duration,
    pub stability_checks: u32,
    pub stability_interval: Duration,
    /// Hard deadline over the whole validation phase.
    pub rollback_timeout: Duration,
    pub retention: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            auto_update: true,
            stop_timeout: Duration::from_secs(30),
            health_retries: 30,
            health_retry_interval: Duration::from_secs(10),
            stability_checks: 6,
            stability_interval: Duration::from_secs(10),
            rollback_timeout: Duration::from_secs(600),
            retention: 3,
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &UpdaterConfig) -> ConfigResult<Self> {
        Ok(Self {
            auto_update: config.auto_update,
            stop_timeout: config.stop_timeout()?,
            health_retries: config.health.retries,
            health_retry_interval: config.health_retry_interval()?,
            stability_checks: config.health.stability_checks,
            stability_interval: config.stability_interval()?,
            rollback_timeout: config.rollback_timeout()?,
            retention: config.backup.retention,
        })
    }
}

/// What startup recovery found and did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The managed container passed its health check.
    Healthy { version: String },
    /// A backup was restored.
    Restored { version: String, backup: u64 },
    /// The container is unhealthy and no backup holds its version, so it
    /// was left running.
    Unhealthy { version: String },
    /// No managed container and no backup.
    Unrecoverable { reason: String },
}

/// Mutable record of one cycle, turned into an [`UpdateResult`] at the end.
#[derive(Debug)]
struct UpdateAttempt {
    status: UpdateStatus,
    from_version: String,
    to_version: Option<String>,
    cohort: Option<CohortDecision>,
    backup: Option<BackupRecord>,
    reason: String,
    error: Option<String>,
    started: Instant,
}

impl UpdateAttempt {
    fn new(from_version: &str) -> Self {
        Self {
            status: UpdateStatus::Checking,
            from_version: from_version.to_string(),
            to_version: None,
            cohort: None,
            backup: None,
            reason: String::new(),
            error: None,
            started: Instant::now(),
        }
    }

    fn end(&mut self, status: UpdateStatus, reason: impl Into<String>) {
        self.status = status;
        self.reason = reason.into();
    }

    fn fail(&mut self, reason: &str, err: &UpdateError) {
        self.end(UpdateStatus::Failed, reason);
        self.error = Some(err.to_string());
    }

    fn into_result(self) -> UpdateResult {
        UpdateResult {
            status: self.status,
            from_version: self.from_version,
            to_version: self.to_version,
            cohort: self.cohort,
            reason: self.reason,
            error: self.error,
            backup: self.backup,
            duration_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}

/// Why the destructive phase stopped short of a commit.
#[derive(Debug)]
struct Abort {
    reason: &'static str,
    error: Option<UpdateError>,
    new_container: Option<ContainerInfo>,
}

impl Abort {
    fn error(reason: &'static str, err: impl Into<UpdateError>) -> Self {
        Self {
            reason,
            error: Some(err.into()),
            new_container: None,
        }
    }

    fn with_container(mut self, container: &ContainerInfo) -> Self {
        self.new_container = Some(container.clone());
        self
    }
}

enum Validation {
    Passed,
    Unhealthy,
    Unstable,
}

type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Owns the current-version pointer and runs update cycles against it.
///
/// `check_and_update` takes `&mut self`, so two cycles can never overlap
/// on the same orchestrator.
pub struct UpdateOrchestrator {
    identity: NodeIdentity,
    assigner: CohortAssigner,
    settings: OrchestratorSettings,
    source: Arc<dyn VersionSource>,
    runtime: Arc<dyn ContainerRuntime>,
    backups: BackupStore,
    health: HealthValidator,
    current_version: String,
    status: watch::Sender<UpdateStatus>,
    clock: Clock,
}

impl UpdateOrchestrator {
    pub fn new(
        identity: NodeIdentity,
        settings: OrchestratorSettings,
        source: Arc<dyn VersionSource>,
        runtime: Arc<dyn ContainerRuntime>,
        backups: BackupStore,
        health: HealthValidator,
    ) -> Self {
        let (status, _) = watch::channel(UpdateStatus::Idle);
        Self {
            assigner: CohortAssigner::for_identity(&identity),
            identity,
            settings,
            source,
            runtime,
            backups,
            health,
            current_version: UNKNOWN_VERSION.to_string(),
            status,
            clock: Arc::new(unix_now),
        }
    }

    /// Start from a known running version instead of reading the label.
    pub fn with_current_version(mut self, version: impl Into<String>) -> Self {
        self.current_version = version.into();
        self
    }

    /// Replace the wall clock (Unix seconds) used for cohort gates.
    pub fn with_clock(mut self, clock: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn current_version(&self) -> &str {
        &self.current_version
    }

    pub fn status(&self) -> UpdateStatus {
        *self.status.borrow()
    }

    /// Snapshot receiver for the in-flight status.
    pub fn subscribe(&self) -> watch::Receiver<UpdateStatus> {
        self.status.subscribe()
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    fn set_status(&self, attempt: &mut UpdateAttempt, status: UpdateStatus) {
        attempt.status = status;
        self.status.send_replace(status);
        debug!(%status, "update status");
    }

    /// Run one check-and-maybe-update cycle.
    ///
    /// Never returns an error: every failure is reported through the
    /// result's status, reason and error.
    pub async fn check_and_update(&mut self) -> UpdateResult {
        let mut attempt = UpdateAttempt::new(&self.current_version);
        self.set_status(&mut attempt, UpdateStatus::Checking);

        if let Some(release) = self.check(&mut attempt).await {
            self.apply(&mut attempt, &release).await;
        }

        let result = attempt.into_result();
        match result.status {
            UpdateStatus::Success => info!(
                from = %result.from_version,
                to = ?result.to_version,
                duration_ms = result.duration_ms,
                "update applied"
            ),
            UpdateStatus::RolledBack => warn!(
                from = %result.from_version,
                to = ?result.to_version,
                reason = %result.reason,
                error = ?result.error,
                "update rolled back"
            ),
            UpdateStatus::Failed => error!(
                from = %result.from_version,
                to = ?result.to_version,
                reason = %result.reason,
                error = ?result.error,
                "update failed"
            ),
            _ => debug!(reason = %result.reason, "no update applied"),
        }
        self.status.send_replace(UpdateStatus::Idle);
        result
    }

    /// Steps 1-2: look up the release and decide eligibility. Returns the
    /// release only when it should be applied now.
    async fn check(&self, attempt: &mut UpdateAttempt) -> Option<ReleaseInfo> {
        let tier = self.identity.tier();
        let release = match self.source.current_release(tier).await {
            Ok(Some(release)) => release,
            Ok(None) => {
                attempt.end(UpdateStatus::Idle, format!("no active release for tier {tier}"));
                return None;
            }
            Err(e) => {
                attempt.fail("version check failed", &e.into());
                return None;
            }
        };
        attempt.to_version = Some(release.version.clone());

        let Some(target) = parse_version(&release.version) else {
            attempt.fail(
                "version check failed",
                &UpdateError::InvalidVersion(release.version.clone()),
            );
            return None;
        };
        if parse_version(&self.current_version).as_ref() == Some(&target) {
            attempt.end(
                UpdateStatus::Idle,
                format!("already running {}", self.current_version),
            );
            return None;
        }

        let now = (self.clock)();
        let decision = self
            .assigner
            .decide(&release.rollout, release.published_at, now);
        attempt.cohort = Some(decision);
        info!(
            version = %release.version,
            current = %self.current_version,
            bucket = self.assigner.bucket(),
            %decision,
            "release available"
        );

        if !decision.is_eligible() {
            let reason = match self
                .assigner
                .time_until_eligible(&release.rollout, release.published_at, now)
            {
                Some(secs) => format!("not eligible yet, cohort opens in {secs}s"),
                None => "not eligible for this release".to_string(),
            };
            attempt.end(UpdateStatus::Idle, reason);
            return None;
        }
        if !self.settings.auto_update {
            attempt.end(UpdateStatus::Idle, "auto-update disabled");
            return None;
        }
        Some(release)
    }

    /// Steps 3-10: pull, back up, swap, validate, then commit or roll back.
    async fn apply(&mut self, attempt: &mut UpdateAttempt, release: &ReleaseInfo) {
        self.set_status(attempt, UpdateStatus::Downloading);
        if let Err(e) = self.runtime.pull(&release.artifact_tag).await {
            attempt.fail("artifact pull failed", &e.into());
            return;
        }

        let current = match self.runtime.find_managed().await {
            Ok(Some(c)) => c,
            Ok(None) => {
                attempt.fail("no managed container", &UpdateError::NoManagedContainer);
                return;
            }
            Err(e) => {
                attempt.fail("no managed container", &e.into());
                return;
            }
        };

        let running_tag = current.image.clone();
        let running_version = current
            .version
            .clone()
            .unwrap_or_else(|| self.current_version.clone());
        let record = match self
            .backups
            .create_backup(
                self.runtime.as_ref(),
                &current.id,
                &running_version,
                &running_tag,
            )
            .await
        {
            Ok(record) => record,
            Err(e) => {
                attempt.fail("backup failed", &e.into());
                return;
            }
        };
        attempt.backup = Some(record.clone());

        match self.swap_and_validate(attempt, release, &current, &record).await {
            Ok(new) => self.commit(attempt, release, &current, &new).await,
            Err(abort) => self.roll_back(attempt, &record, abort).await,
        }
    }

    async fn swap_and_validate(
        &self,
        attempt: &mut UpdateAttempt,
        release: &ReleaseInfo,
        current: &ContainerInfo,
        record: &BackupRecord,
    ) -> Result<ContainerInfo, Abort> {
        self.set_status(attempt, UpdateStatus::Updating);
        let template = self
            .backups
            .load_spec(record)
            .map_err(|e| Abort::error("update failed", e))?;
        self.runtime
            .stop(&current.id, self.settings.stop_timeout)
            .await
            .map_err(|e| Abort::error("update failed", e))?;

        let labels = BTreeMap::from([(LABEL_VERSION.to_string(), release.version.clone())]);
        let new = self
            .runtime
            .start_from(&release.artifact_tag, &template, &labels)
            .await
            .map_err(|e| Abort::error("update failed", e))?;
        info!(id = %new.id, name = %new.name, version = %release.version, "new container started");

        self.set_status(attempt, UpdateStatus::Validating);
        let validation = tokio::time::timeout(self.settings.rollback_timeout, self.validate()).await;
        match validation {
            Ok(Ok(Validation::Passed)) => Ok(new),
            Ok(Ok(Validation::Unhealthy)) => Err(Abort {
                reason: "health check failed",
                error: None,
                new_container: Some(new),
            }),
            Ok(Ok(Validation::Unstable)) => Err(Abort {
                reason: "stability check failed",
                error: None,
                new_container: Some(new),
            }),
            Ok(Err(e)) => Err(Abort::error("health check failed", e).with_container(&new)),
            Err(_) => {
                warn!(
                    timeout_s = self.settings.rollback_timeout.as_secs(),
                    "validation did not conclude in time"
                );
                Err(Abort {
                    reason: "validation deadline exceeded",
                    error: None,
                    new_container: Some(new),
                })
            }
        }
    }

    async fn validate(&self) -> CycleResult<Validation> {
        let s = &self.settings;
        if !self
            .health
            .wait_for_healthy(s.health_retries, s.health_retry_interval)
            .await?
        {
            return Ok(Validation::Unhealthy);
        }
        if !self
            .health
            .validate_stability(s.stability_checks, s.stability_interval)
            .await?
        {
            return Ok(Validation::Unstable);
        }
        Ok(Validation::Passed)
    }

    /// Step 9: validation passed, make the new container permanent.
    async fn commit(
        &mut self,
        attempt: &mut UpdateAttempt,
        release: &ReleaseInfo,
        old: &ContainerInfo,
        new: &ContainerInfo,
    ) {
        if let Err(e) = self.runtime.remove(&old.id, true).await {
            warn!(id = %old.id, error = %e, "failed to remove old container");
        }
        self.sweep_backups();
        match self
            .runtime
            .prune_except(std::slice::from_ref(&release.artifact_tag))
            .await
        {
            Ok(pruned) if pruned > 0 => debug!(pruned, "superseded images pruned"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "image prune failed"),
        }

        self.current_version = release.version.clone();
        info!(id = %new.id, version = %release.version, "update committed");
        attempt.end(UpdateStatus::Success, format!("updated to {}", release.version));
        self.status.send_replace(UpdateStatus::Success);
    }

    /// Remove the new container (if any) and restore the backup.
    async fn roll_back(&self, attempt: &mut UpdateAttempt, record: &BackupRecord, abort: Abort) {
        let original = abort.error.map(|e| e.to_string());
        warn!(
            reason = abort.reason,
            error = ?original,
            backup = record.timestamp,
            "rolling back"
        );

        if let Some(new) = &abort.new_container {
            if let Err(e) = self.runtime.stop(&new.id, self.settings.stop_timeout).await {
                warn!(id = %new.id, error = %e, "failed to stop new container");
            }
            if let Err(e) = self.runtime.remove(&new.id, true).await {
                warn!(id = %new.id, error = %e, "failed to remove new container");
            }
        }

        match self
            .backups
            .restore_backup(self.runtime.as_ref(), record, self.settings.stop_timeout)
            .await
        {
            Ok(restored) => {
                info!(id = %restored.id, version = %record.source_version, "rollback complete");
                if let Err(e) = self.backups.remove_backup(record) {
                    warn!(backup = record.timestamp, error = %e, "failed to remove consumed backup");
                }
                self.sweep_backups();
                attempt.end(UpdateStatus::RolledBack, abort.reason);
                attempt.error = original;
            }
            Err(e) => {
                error!(
                    backup = record.timestamp,
                    error = %e,
                    "rollback failed, node may be without a running container"
                );
                attempt.end(
                    UpdateStatus::Failed,
                    format!("{}; rollback failed", abort.reason),
                );
                attempt.error = Some(match original {
                    Some(original) => format!("{original}; restore: {e}"),
                    None => format!("restore: {e}"),
                });
            }
        }
        self.status.send_replace(attempt.status);
    }

    /// Apply backup retention. Failures are only logged.
    fn sweep_backups(&self) {
        match self.backups.cleanup_old(self.settings.retention) {
            Ok(removed) if removed > 0 => debug!(removed, "old backups removed"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "backup retention sweep failed"),
        }
    }

    /// Check the running container before the first scheduled cycle.
    ///
    /// Adopts the container's version label when the current version is
    /// unknown. An unhealthy container is only replaced by a backup of the
    /// same version, so a slow-starting release is never downgraded. With
    /// no managed container at all, the newest backup is restored.
    pub async fn recover_on_startup(&mut self) -> CycleResult<RecoveryOutcome> {
        let record = match self.runtime.find_managed().await? {
            Some(container) => {
                if self.current_version == UNKNOWN_VERSION {
                    if let Some(version) = &container.version {
                        info!(%version, id = %container.id, "adopted running version");
                        self.current_version = version.clone();
                    }
                }
                let s = &self.settings;
                if self
                    .health
                    .wait_for_healthy(s.health_retries, s.health_retry_interval)
                    .await?
                {
                    return Ok(RecoveryOutcome::Healthy {
                        version: self.current_version.clone(),
                    });
                }
                let running = container
                    .version
                    .clone()
                    .unwrap_or_else(|| self.current_version.clone());
                warn!(id = %container.id, version = %running, "managed container unhealthy at startup");

                let matching = self
                    .backups
                    .list_backups()?
                    .into_iter()
                    .find(|r| same_version(&r.source_version, &running));
                match matching {
                    Some(record) => record,
                    None => {
                        warn!(version = %running, "no backup of the running version, leaving container in place");
                        return Ok(RecoveryOutcome::Unhealthy { version: running });
                    }
                }
            }
            None => {
                warn!("no managed container running at startup");
                match self.backups.latest()? {
                    Some(record) => record,
                    None => {
                        return Ok(RecoveryOutcome::Unrecoverable {
                            reason: "no managed container and no backup available".to_string(),
                        });
                    }
                }
            }
        };

        let restored = self
            .backups
            .restore_backup(self.runtime.as_ref(), &record, self.settings.stop_timeout)
            .await?;
        info!(id = %restored.id, version = %record.source_version, "recovered from backup");
        self.current_version = record.source_version.clone();
        Ok(RecoveryOutcome::Restored {
            version: record.source_version,
            backup: record.timestamp,
        })
    }
}

/// Semver equality when both sides parse, string equality otherwise.
fn same_version(a: &str, b: &str) -> bool {
    match (parse_version(a), parse_version(b)) {
        (Some(a), Some(b)) => a == b,
        _ => a == b,
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetup_core::{LABEL_MANAGED, NodeTier, RestartPolicy, RolloutPolicy};
    use fleetup_core::ContainerSpec;
    use fleetup_health::{ProbeResult, ScriptedProbe};
    use fleetup_runtime::{FailPoint, InMemoryRuntime};
    use fleetup_source::FixedSource;

    const OLD_TAG: &str = "registry.example.com/node:1.0.0";
    const NEW_TAG: &str = "registry.example.com/node:1.1.0";

    struct Harness {
        runtime: Arc<InMemoryRuntime>,
        source: Arc<FixedSource>,
        probe: Arc<ScriptedProbe>,
        _dir: tempfile::TempDir,
        orchestrator: UpdateOrchestrator,
    }

    fn release(canary: u8) -> ReleaseInfo {
        ReleaseInfo {
            version: "1.1.0".to_string(),
            artifact_tag: NEW_TAG.to_string(),
            published_at: 1_000,
            active: true,
            rollout: RolloutPolicy {
                canary_percent: canary,
                cohort_percent: 0,
                inter_cohort_delay_secs: 0,
            },
        }
    }

    fn old_spec() -> ContainerSpec {
        ContainerSpec {
            name: "node".to_string(),
            image: OLD_TAG.to_string(),
            env: vec!["RPC_URL=http://rpc".to_string()],
            labels: BTreeMap::from([
                (LABEL_MANAGED.to_string(), "true".to_string()),
                (LABEL_VERSION.to_string(), "1.0.0".to_string()),
            ]),
            port_bindings: BTreeMap::new(),
            binds: vec!["/data:/data".to_string()],
            restart_policy: RestartPolicy::default(),
            network_mode: None,
        }
    }

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            stop_timeout: Duration::from_millis(10),
            health_retries: 3,
            health_retry_interval: Duration::from_millis(1),
            stability_checks: 3,
            stability_interval: Duration::from_millis(1),
            rollback_timeout: Duration::from_secs(5),
            ..OrchestratorSettings::default()
        }
    }

    fn harness(probe: ScriptedProbe, settings: OrchestratorSettings) -> Harness {
        let runtime = Arc::new(InMemoryRuntime::default());
        runtime.seed_container(old_spec());
        let source = Arc::new(FixedSource::new(Some(release(100))));
        let probe = Arc::new(probe);
        let dir = tempfile::tempdir().unwrap();
        let backups = BackupStore::open(dir.path()).unwrap();
        let identity = NodeIdentity::new("test-node-123", NodeTier::Validator).unwrap();
        let orchestrator = UpdateOrchestrator::new(
            identity,
            settings,
            source.clone(),
            runtime.clone(),
            backups,
            HealthValidator::new(probe.clone()),
        )
        .with_current_version("1.0.0")
        .with_clock(|| 2_000);
        Harness {
            runtime,
            source,
            probe,
            _dir: dir,
            orchestrator,
        }
    }

    #[tokio::test]
    async fn success_swaps_container_and_advances_version() {
        let mut h = harness(ScriptedProbe::always(ProbeResult::Healthy), settings());
        let result = h.orchestrator.check_and_update().await;

        assert_eq!(result.status, UpdateStatus::Success, "{result:?}");
        assert_eq!(result.from_version, "1.0.0");
        assert_eq!(result.to_version.as_deref(), Some("1.1.0"));
        assert_eq!(result.cohort, Some(CohortDecision::Canary));
        assert!(result.backup.is_some());
        assert_eq!(h.orchestrator.current_version(), "1.1.0");
        assert_eq!(h.orchestrator.status(), UpdateStatus::Idle);

        let containers = h.runtime.containers();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].version.as_deref(), Some("1.1.0"));
        assert_eq!(containers[0].image, NEW_TAG);
        assert!(!h.runtime.images().contains(&OLD_TAG.to_string()));
    }

    #[tokio::test]
    async fn backup_precedes_stop() {
        let mut h = harness(ScriptedProbe::always(ProbeResult::Healthy), settings());
        h.orchestrator.check_and_update().await;

        let calls = h.runtime.calls();
        let inspect = calls.iter().position(|c| c == "inspect:c1").unwrap();
        let stop = calls.iter().position(|c| c == "stop:c1").unwrap();
        let remove = calls.iter().position(|c| c == "remove:c1").unwrap();
        assert!(inspect < stop);
        assert!(stop < remove);
    }

    #[tokio::test]
    async fn same_version_is_a_no_op() {
        let mut h = harness(ScriptedProbe::always(ProbeResult::Healthy), settings());
        h.orchestrator = h.orchestrator.with_current_version("v1.1.0");
        let result = h.orchestrator.check_and_update().await;

        assert_eq!(result.status, UpdateStatus::Idle);
        assert!(result.backup.is_none());
        assert!(h.orchestrator.backups().list_backups().unwrap().is_empty());
        assert_eq!(h.runtime.calls(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn no_release_is_a_no_op() {
        let mut h = harness(ScriptedProbe::always(ProbeResult::Healthy), settings());
        h.source.clear();
        let result = h.orchestrator.check_and_update().await;
        assert_eq!(result.status, UpdateStatus::Idle);
        assert!(result.to_version.is_none());
    }

    #[tokio::test]
    async fn source_error_fails_without_side_effects() {
        let mut h = harness(ScriptedProbe::always(ProbeResult::Healthy), settings());
        h.source.fail_with("connection refused");
        let result = h.orchestrator.check_and_update().await;
        assert_eq!(result.status, UpdateStatus::Failed);
        assert!(result.error.unwrap().contains("connection refused"));
        assert!(h.runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn unparsable_release_version_fails() {
        let mut h = harness(ScriptedProbe::always(ProbeResult::Healthy), settings());
        let mut bad = release(100);
        bad.version = "latest".to_string();
        h.source.set(bad);
        let result = h.orchestrator.check_and_update().await;
        assert_eq!(result.status, UpdateStatus::Failed);
        assert!(h.runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn not_eligible_reports_version_without_applying() {
        let mut h = harness(ScriptedProbe::always(ProbeResult::Healthy), settings());
        h.source.set(release(0));
        let result = h.orchestrator.check_and_update().await;
        assert_eq!(result.status, UpdateStatus::Idle);
        assert_eq!(result.to_version.as_deref(), Some("1.1.0"));
        assert_eq!(result.cohort, Some(CohortDecision::NotEligible));
        assert!(h.runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn auto_update_off_reports_without_applying() {
        let settings = OrchestratorSettings {
            auto_update: false,
            ..settings()
        };
        let mut h = harness(ScriptedProbe::always(ProbeResult::Healthy), settings);
        let result = h.orchestrator.check_and_update().await;
        assert_eq!(result.status, UpdateStatus::Idle);
        assert_eq!(result.cohort, Some(CohortDecision::Canary));
        assert_eq!(result.reason, "auto-update disabled");
        assert!(h.runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn pull_failure_fails_before_backup() {
        let mut h = harness(ScriptedProbe::always(ProbeResult::Healthy), settings());
        h.runtime.fail_on(FailPoint::Pull);
        let result = h.orchestrator.check_and_update().await;
        assert_eq!(result.status, UpdateStatus::Failed);
        assert_eq!(result.reason, "artifact pull failed");
        assert!(result.backup.is_none());
        assert_eq!(h.runtime.running().len(), 1);
    }

    #[tokio::test]
    async fn missing_container_fails() {
        let mut h = harness(ScriptedProbe::always(ProbeResult::Healthy), settings());
        h.runtime.remove("c1", true).await.unwrap();
        let result = h.orchestrator.check_and_update().await;
        assert_eq!(result.status, UpdateStatus::Failed);
        assert_eq!(result.reason, "no managed container");
    }

    #[tokio::test]
    async fn backup_failure_aborts_before_stop() {
        let mut h = harness(ScriptedProbe::always(ProbeResult::Healthy), settings());
        h.runtime.fail_on(FailPoint::Inspect);
        let result = h.orchestrator.check_and_update().await;
        assert_eq!(result.status, UpdateStatus::Failed);
        assert_eq!(result.reason, "backup failed");
        assert!(!h.runtime.calls().iter().any(|c| c.starts_with("stop:")));
        assert_eq!(h.runtime.running()[0].id, "c1");
    }

    #[tokio::test]
    async fn start_failure_rolls_back() {
        let mut h = harness(ScriptedProbe::always(ProbeResult::Healthy), settings());
        h.runtime.fail_on(FailPoint::Start);
        let result = h.orchestrator.check_and_update().await;
        // The restore also needs start, so it fails too.
        assert_eq!(result.status, UpdateStatus::Failed);
        assert!(result.reason.contains("rollback failed"));
        let error = result.error.unwrap();
        assert!(error.contains("injected failure"));
        assert!(error.contains("restore"));
    }

    #[tokio::test]
    async fn stop_failure_rolls_back_to_original_configuration() {
        let mut h = harness(ScriptedProbe::always(ProbeResult::Healthy), settings());
        h.runtime.fail_on(FailPoint::Stop);
        let result = h.orchestrator.check_and_update().await;

        assert_eq!(result.status, UpdateStatus::RolledBack, "{result:?}");
        assert_eq!(result.reason, "update failed");
        assert!(result.error.unwrap().contains("injected failure: stop:c1"));
        assert_eq!(h.orchestrator.current_version(), "1.0.0");

        let running = h.runtime.running();
        assert_eq!(running.len(), 1);
        assert_ne!(running[0].id, "c1");
        let spec = h.runtime.spec_of(&running[0].id).unwrap();
        let original = old_spec();
        assert_eq!(spec.image, OLD_TAG);
        assert_eq!(spec.env, original.env);
        assert_eq!(spec.binds, original.binds);
        assert_eq!(spec.labels[LABEL_VERSION], "1.0.0");
        assert!(!h.runtime.calls().iter().any(|c| c == &format!("start:{NEW_TAG}")));
    }

    #[tokio::test]
    async fn repeated_rollbacks_keep_backups_bounded() {
        let settings = OrchestratorSettings {
            retention: 2,
            ..settings()
        };
        let mut h = harness(ScriptedProbe::always(ProbeResult::Unhealthy), settings);
        for _ in 0..5 {
            let result = h.orchestrator.check_and_update().await;
            assert_eq!(result.status, UpdateStatus::RolledBack, "{result:?}");
            let consumed = result.backup.unwrap();
            assert!(!std::path::Path::new(&consumed.storage_path).exists());
            assert!(h.orchestrator.backups().list_backups().unwrap().len() <= 2);
        }
        assert_eq!(h.runtime.running()[0].version.as_deref(), Some("1.0.0"));
    }

    #[tokio::test]
    async fn unhealthy_new_container_rolls_back() {
        let mut h = harness(ScriptedProbe::always(ProbeResult::Unhealthy), settings());
        let result = h.orchestrator.check_and_update().await;

        assert_eq!(result.status, UpdateStatus::RolledBack);
        assert_eq!(result.reason, "health check failed");
        assert_eq!(h.orchestrator.current_version(), "1.0.0");
        assert_eq!(h.probe.calls(), 3);

        let running = h.runtime.running();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].version.as_deref(), Some("1.0.0"));
        assert_eq!(running[0].image, OLD_TAG);
        assert_eq!(h.runtime.containers().len(), 1);
    }

    #[tokio::test]
    async fn unstable_new_container_rolls_back() {
        let probe = ScriptedProbe::new(
            [ProbeResult::Healthy, ProbeResult::Healthy, ProbeResult::Failed],
            ProbeResult::Healthy,
        );
        let mut h = harness(probe, settings());
        let result = h.orchestrator.check_and_update().await;
        assert_eq!(result.status, UpdateStatus::RolledBack);
        assert_eq!(result.reason, "stability check failed");
        assert_eq!(h.runtime.running()[0].version.as_deref(), Some("1.0.0"));
    }

    #[tokio::test]
    async fn validation_deadline_forces_rollback() {
        let settings = OrchestratorSettings {
            rollback_timeout: Duration::from_millis(50),
            ..settings()
        };
        let probe = ScriptedProbe::always(ProbeResult::Healthy).with_delay(Duration::from_millis(40));
        let mut h = harness(probe, settings);
        let result = h.orchestrator.check_and_update().await;
        assert_eq!(result.status, UpdateStatus::RolledBack);
        assert_eq!(result.reason, "validation deadline exceeded");
        assert_eq!(h.runtime.running()[0].version.as_deref(), Some("1.0.0"));
    }

    #[tokio::test]
    async fn status_returns_to_idle_after_cycle() {
        let mut h = harness(ScriptedProbe::always(ProbeResult::Healthy), settings());
        let rx = h.orchestrator.subscribe();
        h.orchestrator.check_and_update().await;
        assert_eq!(*rx.borrow(), UpdateStatus::Idle);
    }

    #[tokio::test]
    async fn recovery_adopts_label_when_healthy() {
        let mut h = harness(ScriptedProbe::always(ProbeResult::Healthy), settings());
        h.orchestrator = h.orchestrator.with_current_version(UNKNOWN_VERSION);
        let outcome = h.orchestrator.recover_on_startup().await.unwrap();
        assert_eq!(
            outcome,
            RecoveryOutcome::Healthy {
                version: "1.0.0".to_string()
            }
        );
        assert_eq!(h.orchestrator.current_version(), "1.0.0");
    }

    #[tokio::test]
    async fn recovery_restores_newest_backup_when_unhealthy() {
        let mut h = harness(ScriptedProbe::always(ProbeResult::Unhealthy), settings());
        let record = h
            .orchestrator
            .backups()
            .create_backup(h.runtime.as_ref(), "c1", "1.0.0", OLD_TAG)
            .await
            .unwrap();

        let outcome = h.orchestrator.recover_on_startup().await.unwrap();
        assert_eq!(
            outcome,
            RecoveryOutcome::Restored {
                version: "1.0.0".to_string(),
                backup: record.timestamp,
            }
        );
        let running = h.runtime.running();
        assert_eq!(running.len(), 1);
        assert_ne!(running[0].id, "c1");
    }

    #[tokio::test]
    async fn recovery_keeps_unhealthy_container_without_matching_backup() {
        let mut h = harness(ScriptedProbe::always(ProbeResult::Unhealthy), settings());
        // Backup of an older version, as left behind by a successful update.
        h.orchestrator
            .backups()
            .create_backup(h.runtime.as_ref(), "c1", "0.9.0", OLD_TAG)
            .await
            .unwrap();

        let outcome = h.orchestrator.recover_on_startup().await.unwrap();
        assert_eq!(
            outcome,
            RecoveryOutcome::Unhealthy {
                version: "1.0.0".to_string()
            }
        );
        assert_eq!(h.orchestrator.current_version(), "1.0.0");
        assert_eq!(h.runtime.running()[0].id, "c1");
        assert!(!h.runtime.calls().iter().any(|c| c.starts_with("start:")));
    }

    #[tokio::test]
    async fn recovery_restores_newest_backup_when_container_missing() {
        let mut h = harness(ScriptedProbe::always(ProbeResult::Healthy), settings());
        let record = h
            .orchestrator
            .backups()
            .create_backup(h.runtime.as_ref(), "c1", "0.9.0", OLD_TAG)
            .await
            .unwrap();
        h.runtime.remove("c1", true).await.unwrap();

        let outcome = h.orchestrator.recover_on_startup().await.unwrap();
        assert_eq!(
            outcome,
            RecoveryOutcome::Restored {
                version: "0.9.0".to_string(),
                backup: record.timestamp,
            }
        );
        assert_eq!(h.orchestrator.current_version(), "0.9.0");
        assert_eq!(h.runtime.running().len(), 1);
    }

    #[tokio::test]
    async fn recovery_without_container_or_backup() {
        let mut h = harness(ScriptedProbe::always(ProbeResult::Healthy), settings());
        h.runtime.remove("c1", true).await.unwrap();
        let outcome = h.orchestrator.recover_on_startup().await.unwrap();
        assert!(matches!(outcome, RecoveryOutcome::Unrecoverable { .. }));
    }
}
