//! End-to-end update cycles against the in-memory runtime.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use wiremock::matchers::{body_partial_json, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

use fleetup_backup::BackupStore;
use fleetup_core::{
    CohortDecision, ContainerSpec, LABEL_MANAGED, LABEL_VERSION, NodeIdentity, NodeTier,
    PortBinding, ReleaseInfo, RestartPolicy, RolloutPolicy, UpdateStatus,
};
use fleetup_health::{HealthValidator, ProbeResult, ScriptedProbe};
use fleetup_rollout::{CohortAssigner, OrchestratorSettings, UpdateOrchestrator};
use fleetup_runtime::InMemoryRuntime;
use fleetup_source::FixedSource;
use fleetupd::agent::Agent;
use fleetupd::telemetry::TelemetryReporter;

const NODE_ID: &str = "test-node-123";

fn tag(version: &str) -> String {
    format!("registry.example.com/node:{version}")
}

fn release(version: &str) -> ReleaseInfo {
    ReleaseInfo {
        version: version.to_string(),
        artifact_tag: tag(version),
        published_at: 1_700_000_000,
        active: true,
        rollout: RolloutPolicy {
            canary_percent: 100,
            cohort_percent: 0,
            inter_cohort_delay_secs: 0,
        },
    }
}

fn node_spec() -> ContainerSpec {
    ContainerSpec {
        name: "node".to_string(),
        image: tag("1.0.0"),
        env: vec!["CHAIN=mainnet".to_string(), "PEERS=16".to_string()],
        labels: BTreeMap::from([
            (LABEL_MANAGED.to_string(), "true".to_string()),
            (LABEL_VERSION.to_string(), "1.0.0".to_string()),
        ]),
        port_bindings: BTreeMap::from([(
            "8080/tcp".to_string(),
            vec![PortBinding {
                host_ip: "0.0.0.0".to_string(),
                host_port: "8080".to_string(),
            }],
        )]),
        binds: vec!["/srv/node:/data".to_string()],
        restart_policy: RestartPolicy {
            name: "on-failure".to_string(),
            maximum_retry_count: 5,
        },
        network_mode: Some("host".to_string()),
    }
}

struct Fleet {
    runtime: Arc<InMemoryRuntime>,
    source: Arc<FixedSource>,
    backups: BackupStore,
    _dir: tempfile::TempDir,
}

impl Fleet {
    fn new(release: ReleaseInfo) -> Self {
        let runtime = Arc::new(InMemoryRuntime::default());
        runtime.seed_container(node_spec());
        let dir = tempfile::tempdir().unwrap();
        Self {
            runtime,
            source: Arc::new(FixedSource::new(Some(release))),
            backups: BackupStore::open(dir.path()).unwrap(),
            _dir: dir,
        }
    }

    fn orchestrator(&self, probe: ScriptedProbe, retention: usize) -> UpdateOrchestrator {
        let settings = OrchestratorSettings {
            stop_timeout: Duration::from_millis(10),
            health_retries: 4,
            health_retry_interval: Duration::from_millis(1),
            stability_checks: 3,
            stability_interval: Duration::from_millis(1),
            rollback_timeout: Duration::from_secs(10),
            retention,
            ..OrchestratorSettings::default()
        };
        UpdateOrchestrator::new(
            NodeIdentity::new(NODE_ID, NodeTier::Validator).unwrap(),
            settings,
            self.source.clone(),
            self.runtime.clone(),
            self.backups.clone(),
            HealthValidator::new(Arc::new(probe)),
        )
        .with_clock(|| 1_700_000_100)
    }
}

#[tokio::test]
async fn scenario_a_unchanged_release_is_a_no_op() {
    let fleet = Fleet::new(release("1.1.0"));
    let mut orchestrator = fleet.orchestrator(ScriptedProbe::always(ProbeResult::Healthy), 3);
    orchestrator.recover_on_startup().await.unwrap();
    assert_eq!(orchestrator.current_version(), "1.0.0");

    let first = orchestrator.check_and_update().await;
    assert_eq!(first.status, UpdateStatus::Success, "{first:?}");
    let backups_after_first = fleet.backups.list_backups().unwrap().len();

    let second = orchestrator.check_and_update().await;
    assert_eq!(second.status, UpdateStatus::Idle);
    assert_eq!(second.from_version, "1.1.0");
    assert!(second.backup.is_none());
    assert_eq!(fleet.backups.list_backups().unwrap().len(), backups_after_first);
}

#[tokio::test]
async fn scenario_b_failed_health_check_rolls_back() {
    let fleet = Fleet::new(release("1.1.0"));
    let probe = ScriptedProbe::always(ProbeResult::Unhealthy);
    let mut orchestrator = fleet
        .orchestrator(probe, 3)
        .with_current_version("1.0.0");

    let result = orchestrator.check_and_update().await;
    assert_eq!(result.status, UpdateStatus::RolledBack);
    assert_eq!(result.reason, "health check failed");
    assert!(result.backup.is_some());
    assert_eq!(orchestrator.current_version(), "1.0.0");

    // Only the restored container remains, with the original configuration.
    let containers = fleet.runtime.containers();
    assert_eq!(containers.len(), 1);
    let restored = fleet.runtime.spec_of(&containers[0].id).unwrap();
    let original = node_spec();
    assert_eq!(restored.image, tag("1.0.0"));
    assert_eq!(restored.labels[LABEL_VERSION], "1.0.0");
    assert_eq!(restored.env, original.env);
    assert_eq!(restored.port_bindings, original.port_bindings);
    assert_eq!(restored.binds, original.binds);
    assert_eq!(restored.restart_policy, original.restart_policy);
    assert!(
        !fleet
            .runtime
            .containers()
            .iter()
            .any(|c| c.version.as_deref() == Some("1.1.0"))
    );
}

#[tokio::test]
async fn scenario_c_successful_updates_respect_retention() {
    let fleet = Fleet::new(release("1.1.0"));
    let mut orchestrator = fleet
        .orchestrator(ScriptedProbe::always(ProbeResult::Healthy), 2)
        .with_current_version("1.0.0");

    for version in ["1.1.0", "1.2.0", "1.3.0", "1.4.0"] {
        fleet.source.set(release(version));
        let result = orchestrator.check_and_update().await;
        assert_eq!(result.status, UpdateStatus::Success, "{result:?}");
        assert_eq!(orchestrator.current_version(), version);

        let running = fleet.runtime.running();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].version.as_deref(), Some(version));
        assert_eq!(fleet.runtime.containers().len(), 1);
        assert!(fleet.backups.list_backups().unwrap().len() <= 2);
    }

    let backups = fleet.backups.list_backups().unwrap();
    assert_eq!(backups.len(), 2);
    assert!(backups[0].timestamp > backups[1].timestamp);
    assert_eq!(backups[0].source_version, "1.3.0");
    assert_eq!(fleet.runtime.images(), vec![tag("1.4.0")]);
}

#[tokio::test]
async fn scenario_d_cohort_decision_is_stable() {
    let policy = RolloutPolicy {
        canary_percent: 5,
        cohort_percent: 20,
        inter_cohort_delay_secs: 3_600,
    };
    let reference = CohortAssigner::new(NODE_ID);
    let bucket = reference.bucket();
    assert!((1..=100).contains(&bucket));
    let decision = reference.decide(&policy, 1_700_000_000, 1_700_000_100);

    for _ in 0..100 {
        let assigner = CohortAssigner::new(NODE_ID);
        assert_eq!(assigner.bucket(), bucket);
        assert_eq!(assigner.decide(&policy, 1_700_000_000, 1_700_000_100), decision);
    }

    // The orchestrator sees the same decision and only a canary applies it.
    let mut gated = release("2.0.0");
    gated.rollout = policy;
    let fleet = Fleet::new(gated);
    let mut orchestrator = fleet
        .orchestrator(ScriptedProbe::always(ProbeResult::Healthy), 3)
        .with_current_version("1.0.0");
    let result = orchestrator.check_and_update().await;
    assert_eq!(result.cohort, Some(decision));
    assert_eq!(
        result.status == UpdateStatus::Success,
        decision == CohortDecision::Canary,
        "{result:?}"
    );
}

#[tokio::test]
async fn scheduler_reports_every_cycle_and_stops_on_shutdown() {
    let sink = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "node_id": NODE_ID, "tier": "validator" })))
        .respond_with(ResponseTemplate::new(200))
        .mount(&sink)
        .await;

    let fleet = Fleet::new(release("1.1.0"));
    let orchestrator = fleet
        .orchestrator(ScriptedProbe::always(ProbeResult::Healthy), 3)
        .with_current_version("1.0.0");
    let identity = orchestrator.identity().clone();
    let reporter = TelemetryReporter::new(&sink.uri(), &identity).unwrap();
    let mut agent = Agent::new(
        orchestrator,
        fleet.source.clone(),
        Some(reporter),
        Duration::from_millis(20),
    );

    let (tx, rx) = watch::channel(false);
    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        let _ = tx.send(true);
    });
    agent.run(rx).await;
    stopper.await.unwrap();

    assert_eq!(agent.orchestrator().current_version(), "1.1.0");
    // Give the fire-and-forget reports a moment to land.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let received = sink.received_requests().await.unwrap();
    assert!(received.len() >= 2, "expected several reports, got {}", received.len());
}

#[tokio::test]
async fn failing_cycles_do_not_stop_the_schedule() {
    let fleet = Fleet::new(release("1.1.0"));
    fleet.source.fail_with("rpc unavailable");
    let orchestrator = fleet
        .orchestrator(ScriptedProbe::always(ProbeResult::Healthy), 3)
        .with_current_version("1.0.0");
    let mut agent = Agent::new(orchestrator, fleet.source.clone(), None, Duration::from_millis(10));

    for _ in 0..3 {
        let result = agent.cycle().await;
        assert_eq!(result.status, UpdateStatus::Failed);
    }
    fleet.source.recover();
    let result = agent.cycle().await;
    assert_eq!(result.status, UpdateStatus::Success);
}

#[tokio::test]
async fn schedule_does_not_start_after_shutdown_was_requested() {
    let fleet = Fleet::new(release("1.1.0"));
    let orchestrator = fleet
        .orchestrator(ScriptedProbe::always(ProbeResult::Healthy), 3)
        .with_current_version("1.0.0");
    let mut agent = Agent::new(orchestrator, fleet.source.clone(), None, Duration::from_millis(10));

    // Shutdown arrives while startup recovery is still running.
    let (tx, rx) = watch::channel(false);
    agent.prepare().await;
    tx.send(true).unwrap();
    let calls_before = fleet.runtime.calls().len();
    agent.run(rx).await;

    assert_eq!(agent.orchestrator().current_version(), "1.0.0");
    assert_eq!(fleet.runtime.calls().len(), calls_before);
    assert_eq!(fleet.runtime.running()[0].version.as_deref(), Some("1.0.0"));
}

#[tokio::test]
async fn reported_cycle_waits_for_delivery() {
    let sink = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "node_id": NODE_ID, "status": "success" })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&sink)
        .await;

    let fleet = Fleet::new(release("1.1.0"));
    let orchestrator = fleet
        .orchestrator(ScriptedProbe::always(ProbeResult::Healthy), 3)
        .with_current_version("1.0.0");
    let reporter = TelemetryReporter::new(&sink.uri(), orchestrator.identity()).unwrap();
    let mut agent = Agent::new(orchestrator, fleet.source.clone(), Some(reporter), Duration::from_secs(60));

    let result = agent.cycle_reported().await;
    assert_eq!(result.status, UpdateStatus::Success);
    // No grace period: the report is already on the wire.
    assert_eq!(sink.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn broken_release_rolls_back_without_piling_up_backups() {
    let fleet = Fleet::new(release("1.1.0"));
    let mut orchestrator = fleet
        .orchestrator(ScriptedProbe::always(ProbeResult::Unhealthy), 2)
        .with_current_version("1.0.0");

    for _ in 0..5 {
        let result = orchestrator.check_and_update().await;
        assert_eq!(result.status, UpdateStatus::RolledBack, "{result:?}");
        assert!(fleet.backups.list_backups().unwrap().len() <= 2);
    }
    assert_eq!(fleet.runtime.containers().len(), 1);
}
