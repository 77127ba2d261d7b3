//! Agent — runs on every fleet node and keeps its container current.
//!
//! In daemon mode the agent:
//! 1. Loads configuration, idling until a node id and version source are set
//! 2. Builds the version source, container runtime, backup store and health probe
//! 3. Health-checks the running container and restores a backup if needed
//! 4. Runs one update cycle per `check_interval`, reporting each result
//! 5. On shutdown, lets the in-flight cycle finish and exits

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use fleetup_backup::BackupStore;
use fleetup_core::{UpdateResult, UpdaterConfig};
use fleetup_health::{HealthValidator, HttpProbe};
use fleetup_rollout::{OrchestratorSettings, RecoveryOutcome, UpdateOrchestrator};
use fleetup_runtime::DockerRuntime;
use fleetup_source::{RpcVersionSource, VersionSource};

use crate::telemetry::TelemetryReporter;

/// How often an unconfigured agent re-reads its configuration.
pub const IDLE_POLL: Duration = Duration::from_secs(30);

/// Everything one update schedule needs.
pub struct Agent {
    orchestrator: UpdateOrchestrator,
    source: Arc<dyn VersionSource>,
    reporter: Option<TelemetryReporter>,
    check_interval: Duration,
}

impl Agent {
    /// Build the production wiring from a validated configuration.
    pub fn from_config(config: &UpdaterConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let identity = config.identity()?;

        let rpc_url = config
            .source
            .rpc_url
            .as_deref()
            .context("source.rpc_url is not set")?;
        let contract = config
            .source
            .contract
            .as_deref()
            .context("source.contract is not set")?;
        let source: Arc<dyn VersionSource> = Arc::new(RpcVersionSource::new(
            rpc_url,
            contract,
            config.source_timeout()?,
        )?);

        let runtime = Arc::new(DockerRuntime::new(
            &config.runtime.docker_socket,
            &config.runtime.container_label,
        ));
        let backups = BackupStore::open(&config.backup.dir)
            .with_context(|| format!("opening backup dir {}", config.backup.dir.display()))?;
        let probe = HttpProbe::new(&config.health.url, config.health_timeout()?)?;

        let mut orchestrator = UpdateOrchestrator::new(
            identity.clone(),
            OrchestratorSettings::from_config(config)?,
            source.clone(),
            runtime,
            backups,
            HealthValidator::new(Arc::new(probe)),
        );
        if let Some(version) = &config.current_version {
            orchestrator = orchestrator.with_current_version(version.clone());
        }

        let reporter = config
            .telemetry
            .url
            .as_deref()
            .map(|url| TelemetryReporter::new(url, &identity))
            .transpose()?;

        Ok(Self::new(orchestrator, source, reporter, config.check_interval()?))
    }

    pub fn new(
        orchestrator: UpdateOrchestrator,
        source: Arc<dyn VersionSource>,
        reporter: Option<TelemetryReporter>,
        check_interval: Duration,
    ) -> Self {
        Self {
            orchestrator,
            source,
            reporter,
            check_interval,
        }
    }

    pub fn orchestrator(&self) -> &UpdateOrchestrator {
        &self.orchestrator
    }

    /// Run one cycle and hand the result to telemetry in the background.
    pub async fn cycle(&mut self) -> UpdateResult {
        let result = self.orchestrator.check_and_update().await;
        if let Some(reporter) = &self.reporter {
            reporter.report(result.clone());
        }
        result
    }

    /// Run one cycle and wait for its telemetry to be delivered.
    pub async fn cycle_reported(&mut self) -> UpdateResult {
        let result = self.orchestrator.check_and_update().await;
        if let Some(reporter) = &self.reporter {
            if let Err(e) = reporter.send(&result).await {
                warn!(error = %e, "telemetry delivery failed");
            }
        }
        result
    }

    /// Startup checks: source reachability and container recovery.
    pub async fn prepare(&mut self) {
        if !self.source.test_connection().await {
            warn!("version source unreachable at startup, will keep polling");
        }
        match self.orchestrator.recover_on_startup().await {
            Ok(RecoveryOutcome::Healthy { version }) => {
                info!(%version, "running container healthy");
            }
            Ok(RecoveryOutcome::Restored { version, backup }) => {
                warn!(%version, backup, "restored container from backup at startup");
            }
            Ok(RecoveryOutcome::Unhealthy { version }) => {
                warn!(%version, "running container unhealthy at startup, left in place");
            }
            Ok(RecoveryOutcome::Unrecoverable { reason }) => {
                error!(%reason, "startup recovery could not produce a healthy container");
            }
            Err(e) => error!(error = %e, "startup recovery failed"),
        }
    }

    /// Run the update schedule until `shutdown` flips.
    ///
    /// The first cycle runs immediately. A cycle in flight when the
    /// shutdown signal arrives is finished before returning, and no cycle
    /// starts once shutdown has been requested.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        if *shutdown.borrow_and_update() {
            info!("shutdown requested before the update schedule started");
            return;
        }
        info!(
            node_id = %self.orchestrator.identity().node_id(),
            tier = %self.orchestrator.identity().tier(),
            interval_secs = self.check_interval.as_secs(),
            version = %self.orchestrator.current_version(),
            "update schedule started"
        );

        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    info!("update schedule shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.cycle().await;
                }
            }
        }
    }
}

/// Load configuration, re-reading it every [`IDLE_POLL`] until it names a
/// node and a version source. Returns `None` if shut down while idle.
pub async fn wait_until_configured(
    path: Option<&Path>,
    shutdown: &mut watch::Receiver<bool>,
) -> anyhow::Result<Option<UpdaterConfig>> {
    loop {
        let config = UpdaterConfig::load(path)?;
        if config.is_configured() {
            return Ok(Some(config));
        }
        info!(
            poll_secs = IDLE_POLL.as_secs(),
            "node id or version source not configured, idling"
        );
        tokio::select! {
            _ = tokio::time::sleep(IDLE_POLL) => {}
            _ = shutdown.changed() => return Ok(None),
        }
    }
}

/// Daemon entry point for `fleetupd run`.
pub async fn run_daemon(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    info!("fleetup daemon starting");

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let Some(config) = wait_until_configured(config_path.as_deref(), &mut shutdown_rx).await? else {
        info!("fleetup daemon stopped before configuration");
        return Ok(());
    };

    let mut agent = Agent::from_config(&config)?;
    agent.prepare().await;
    agent.run(shutdown_rx).await;

    info!("fleetup daemon stopped");
    Ok(())
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to install CTRL+C handler");
        std::future::pending::<()>().await;
    }
}
