//! fleetupd — the fleetup node updater daemon.
//!
//! # Usage
//!
//! ```text
//! fleetupd run --config /etc/fleetup/fleetup.toml
//! fleetupd once
//! fleetupd cohort --node-id node-0001 --canary 5 --cohort 20 --delay 86400
//! fleetupd backups
//! ```

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use fleetup_backup::BackupStore;
use fleetup_core::{RolloutPolicy, UpdaterConfig};
use fleetup_rollout::CohortAssigner;
use fleetupd::agent::{self, Agent};

#[derive(Parser)]
#[command(name = "fleetupd", about = "Self-updating fleet node agent")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the update schedule until interrupted.
    Run {
        /// Path to fleetup.toml.
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Run a single check-and-update cycle and print the result.
    Once {
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Show the cohort a node falls into for a rollout policy.
    Cohort {
        #[arg(long)]
        node_id: String,

        #[arg(long, default_value = "5")]
        canary: u8,

        #[arg(long, default_value = "20")]
        cohort: u8,

        /// Inter-cohort delay in seconds.
        #[arg(long, default_value = "86400")]
        delay: u64,

        /// Release publication time (Unix seconds). Defaults to now.
        #[arg(long)]
        published_at: Option<u64>,
    },

    /// List backups, newest first.
    Backups {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run { config } => agent::run_daemon(config).await,
        Command::Once { config } => run_once(config).await,
        Command::Cohort {
            node_id,
            canary,
            cohort,
            delay,
            published_at,
        } => {
            let policy = RolloutPolicy {
                canary_percent: canary,
                cohort_percent: cohort,
                inter_cohort_delay_secs: delay,
            };
            show_cohort(&node_id, &policy, published_at);
            Ok(())
        }
        Command::Backups { config } => list_backups(config),
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fleetup=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run_once(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = UpdaterConfig::load(config_path.as_deref())?;
    if !config.is_configured() {
        anyhow::bail!("node_id, source.rpc_url and source.contract must be set");
    }
    let mut agent = Agent::from_config(&config)?;
    // The process exits right after, so delivery is awaited here.
    let result = agent.cycle_reported().await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn show_cohort(node_id: &str, policy: &RolloutPolicy, published_at: Option<u64>) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let published_at = published_at.unwrap_or(now);
    let assigner = CohortAssigner::new(node_id);

    println!("node_id:   {node_id}");
    println!("bucket:    {}", assigner.bucket());
    println!("decision:  {}", assigner.decide(policy, published_at, now));
    match assigner.time_until_eligible(policy, published_at, now) {
        Some(0) => println!("eligible:  now"),
        Some(secs) => println!("eligible:  in {secs}s"),
        None => println!("eligible:  never (outside every band)"),
    }
}

fn list_backups(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = UpdaterConfig::load(config_path.as_deref())?;
    let store = BackupStore::open(&config.backup.dir)?;
    let records = store.list_backups()?;
    if records.is_empty() {
        println!("no backups in {}", store.dir().display());
        return Ok(());
    }
    println!("{:<16} {:<12} {:<14} ARTIFACT", "TIMESTAMP", "VERSION", "CONTAINER");
    for r in records {
        let container: String = r.container_id.chars().take(12).collect();
        println!(
            "{:<16} {:<12} {:<14} {}",
            r.timestamp, r.source_version, container, r.source_artifact_tag
        );
    }
    Ok(())
}
