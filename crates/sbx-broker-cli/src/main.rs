//! SBX Broker CLI
//!
//! Inspects broker configuration and drives the broker against in-memory
//! backends.
//!
//! ## Commands
//!
//! - `config`: Print the effective configuration
//! - `workloads`: List the workload catalog
//! - `simulate`: Launch runs against in-memory fakes and stream their events

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use provision_backend::fakes::{MemoryArchiveStore, MemoryBackend, MemoryPool};
use provision_backend::PoolSettings;
use sbx_broker_core::{
    init_tracing, Broker, BrokerConfig, Category, DeployMode, LogFormat, RunEvent, StreamItem,
    Subscription,
};
use tracing::{info, warn, Level};

/// Size reported for every archive in the simulated store.
const SIMULATED_ARCHIVE_BYTES: u64 = 2_400_000;

#[derive(Parser)]
#[command(name = "sbx-broker")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Admission-controlled sandbox broker", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// JSON configuration file (default: built-in defaults plus environment)
    #[arg(short, long, global = true, env = "SBX_BROKER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration as JSON
    Config,

    /// List launchable workloads
    Workloads,

    /// Launch runs against in-memory backends and print their event streams
    Simulate {
        /// Workload to launch
        #[arg(short, long, default_value = "snake")]
        workload: String,

        /// Run category (cold, warm, snapshot)
        #[arg(short = 'k', long, default_value = "cold")]
        category: String,

        /// Deploy mode (restore, clone)
        #[arg(short, long, default_value = "restore")]
        mode: String,

        /// Number of runs to launch
        #[arg(short, long, default_value = "1")]
        runs: usize,

        /// Leave the archive store empty so restores fall back to cloning
        #[arg(long)]
        no_archives: bool,

        /// Keep the configured propagation and retry delays
        #[arg(long)]
        real_delays: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let format = if cli.json {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    init_tracing(format, level);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Config => cmd_config(&config),
        Commands::Workloads => cmd_workloads(&config),
        Commands::Simulate {
            workload,
            category,
            mode,
            runs,
            no_archives,
            real_delays,
        } => {
            let category: Category = category.parse()?;
            let mode: DeployMode = mode.parse()?;
            let config = if real_delays {
                config
            } else {
                config.without_delays()
            };
            cmd_simulate(config, &workload, category, mode, runs, no_archives).await
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<BrokerConfig> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            BrokerConfig::from_json(&raw)
                .with_context(|| format!("Invalid config {}", path.display()))
        }
        None => BrokerConfig::from_env().context("Invalid environment configuration"),
    }
}

fn cmd_config(config: &BrokerConfig) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

fn cmd_workloads(config: &BrokerConfig) -> Result<()> {
    for (name, spec) in &config.workloads {
        println!(
            "{:<14} image={:<8} path={:<20} archive={}",
            name, spec.image, spec.path, spec.archive_id
        );
    }
    Ok(())
}

async fn cmd_simulate(
    mut config: BrokerConfig,
    workload: &str,
    category: Category,
    mode: DeployMode,
    runs: usize,
    no_archives: bool,
) -> Result<()> {
    if runs == 0 {
        bail!("--runs must be at least 1");
    }
    if category.uses_pool() && config.pool.is_none() {
        config.pool = Some(PoolSettings::default());
    }

    let mut archives = MemoryArchiveStore::new();
    if !no_archives {
        for spec in config.workloads.values() {
            archives = archives.with_archive(&spec.archive_id, SIMULATED_ARCHIVE_BYTES);
        }
    }

    let backend = Arc::new(MemoryBackend::new());
    let mut builder =
        Broker::builder(config.clone(), backend.clone()).with_archives(Arc::new(archives));
    if config.pool.is_some() {
        builder = builder.with_pool(Arc::new(MemoryPool::new()));
    }
    let broker = builder.build().context("Failed to build broker")?;
    broker.start().await.context("Failed to start broker")?;

    let mut streams = Vec::new();
    for _ in 0..runs {
        match broker.launch(category, workload, mode).await {
            Ok(launched) => {
                info!(run_id = %launched.run_id, stream = %launched.stream_path, "Launched");
                streams.push(launched.events);
            }
            Err(err) if err.is_retryable() => {
                warn!(error = %err, "Launch rejected");
                println!("{}", serde_json::json!({ "type": "rejected", "message": err.to_string() }));
            }
            Err(err) => return Err(err).context("Launch failed"),
        }
    }

    for mut events in streams {
        print_until_finished(&mut events).await?;
    }

    println!("{}", serde_json::to_string(&broker.status())?);
    println!("{}", serde_json::to_string(&broker.metrics())?);

    broker.shutdown().await;
    info!(sandboxes_deleted = backend.deleted().len(), "Simulation finished");
    Ok(())
}

/// Print stream items until the provisioning task's last line or the end
/// of the stream.
async fn print_until_finished(events: &mut Subscription) -> Result<()> {
    while let Some(item) = events.next().await {
        println!("{}", serde_json::to_string(&item.to_json())?);
        let done = match &item {
            StreamItem::Event(RunEvent::Log { message, .. }) => {
                message.starts_with("Auto-cleanup in")
            }
            StreamItem::Event(RunEvent::Complete { .. }) => true,
            _ => false,
        };
        if done {
            break;
        }
    }
    Ok(())
}
