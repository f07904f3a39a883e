/// gpu-occupy - keep idle GPU nodes reserved
///
/// Scans a Kubernetes cluster for GPU nodes with no active workload and pins a
/// placeholder job to each one so the capacity is not handed to someone else.
mod config;
mod k8s;
mod occupy;
mod utils;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::OccupyConfig;
use crate::k8s::nodes::summarize;
use crate::k8s::{KubernetesClient, NodeInventory};
use crate::occupy::sku::{classify_node, Classification};
use crate::occupy::workflow::{delete_once, submit_once};
use crate::occupy::{
    AutoConfirm, Confirm, DeleteSelector, JobManager, Patrol, SkuProfile, StdinConfirm,
};

#[derive(Parser)]
#[command(name = "gpu-occupy")]
#[command(about = "Reserve idle GPU nodes with placeholder jobs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "occupy.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate example configuration file
    Init,

    /// Show GPU nodes and their free capacity
    Nodes,

    /// List tracked occupancy jobs
    List,

    /// Submit occupancy jobs for every idle GPU node
    Submit {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,

        /// Only occupy nodes of this instance family (e.g. p5, p4d)
        #[arg(long, value_parser = parse_sku)]
        sku: Option<SkuProfile>,
    },

    /// Delete occupancy jobs and their manifests
    Delete {
        /// Regex matched against the full job name
        #[arg(short, long, conflicts_with = "all", required_unless_present = "all")]
        pattern: Option<String>,

        /// Delete every tracked job
        #[arg(long)]
        all: bool,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Keep occupying idle GPU nodes until interrupted
    Patrol {
        /// Seconds between patrol rounds
        #[arg(short, long, value_parser = clap::value_parser!(u64).range(30..=3600))]
        interval: u64,
    },
}

fn parse_sku(value: &str) -> std::result::Result<SkuProfile, String> {
    SkuProfile::from_key(value).ok_or_else(|| {
        let known: Vec<&str> = SkuProfile::ALL.iter().map(|s| s.key()).collect();
        format!("unknown instance family '{}', expected one of: {}", value, known.join(", "))
    })
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("gpu_occupy={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Execute command
    let result = match cli.command {
        Commands::Init => init_config(&cli).await,
        Commands::Nodes => show_nodes(&cli).await,
        Commands::List => list_jobs(&cli).await,
        Commands::Submit { yes, sku } => submit(&cli, yes, sku).await,
        Commands::Delete {
            ref pattern,
            all,
            yes,
        } => delete(&cli, pattern.as_deref(), all, yes).await,
        Commands::Patrol { interval } => patrol(&cli, Duration::from_secs(interval)).await,
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// Check prerequisites and load configuration
async fn connect(cli: &Cli) -> Result<(OccupyConfig, KubernetesClient)> {
    KubernetesClient::check_kubectl_installed()
        .await
        .context("kubectl is required")?;

    let config = OccupyConfig::from_file(&cli.config).context("Failed to load configuration")?;
    let client = KubernetesClient::new(&config);

    info!(
        "Namespace: {}, manifests in {}",
        config.namespace,
        config.yaml_dir.display()
    );
    Ok((config, client))
}

fn confirmation(yes: bool) -> Box<dyn Confirm> {
    if yes {
        Box::new(AutoConfirm(true))
    } else {
        Box::new(StdinConfirm)
    }
}

/// Show GPU nodes and their free capacity
async fn show_nodes(cli: &Cli) -> Result<()> {
    let (config, client) = connect(cli).await?;
    let mut jobs = JobManager::new(&client, &config)?;
    jobs.recover().await.context("Failed to recover tracked jobs")?;

    let inventory = NodeInventory::new(&client, &config);
    let nodes = inventory
        .list_gpu_nodes()
        .await
        .context("Failed to query GPU nodes")?;

    if nodes.is_empty() {
        info!("No GPU nodes found");
        return Ok(());
    }

    let idle = inventory.idle_candidates(nodes.clone(), &jobs.occupied_nodes());

    info!("GPU nodes (idle policy: {:?}):", inventory.idle_policy());
    for node in &nodes {
        let class = match classify_node(node) {
            Classification::Known(sku) => sku.to_string(),
            Classification::Unclassified(_) => "unclassified".to_string(),
        };
        let status = if let Some(job) = jobs.tracked_for_node(&node.name) {
            format!("occupied by {}", job.name)
        } else if !node.ready || !node.schedulable {
            "not schedulable".to_string()
        } else if idle.iter().any(|n| n.name == node.name) {
            "idle".to_string()
        } else {
            "busy".to_string()
        };
        info!(
            "  - {} [{}] {} ({}/{} GPUs free) {}",
            node.name,
            node.instance_type,
            class,
            node.gpu_free(),
            node.gpu_capacity,
            status
        );
    }

    info!("");
    info!("By instance type:");
    for (instance_type, summary) in summarize(&nodes, &idle) {
        info!(
            "  {}: {} node(s), {} idle, {} idle GPU(s)",
            instance_type, summary.total_nodes, summary.idle_nodes, summary.idle_gpus
        );
    }

    Ok(())
}

/// List tracked occupancy jobs
async fn list_jobs(cli: &Cli) -> Result<()> {
    let (config, client) = connect(cli).await?;
    let mut jobs = JobManager::new(&client, &config)?;
    jobs.recover().await.context("Failed to recover tracked jobs")?;

    let tracked = jobs.list_tracked();
    if tracked.is_empty() {
        info!("No occupancy jobs");
        return Ok(());
    }

    info!("Occupancy jobs:");
    for job in tracked {
        let sku = job
            .sku
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        info!(
            "  - {} on {} ({}, since {}, {})",
            job.name,
            job.node,
            sku,
            job.created.format("%Y-%m-%d %H:%M:%S UTC"),
            job.manifest_path.display()
        );
    }

    Ok(())
}

/// Submit occupancy jobs for idle GPU nodes
async fn submit(cli: &Cli, yes: bool, sku: Option<SkuProfile>) -> Result<()> {
    let (config, client) = connect(cli).await?;
    let mut jobs = JobManager::new(&client, &config)?;
    jobs.recover().await.context("Failed to recover tracked jobs")?;

    let inventory = NodeInventory::new(&client, &config);
    let confirm = confirmation(yes);
    let summary = submit_once(&inventory, &mut jobs, confirm.as_ref(), sku).await?;
    if summary.cancelled {
        return Ok(());
    }

    if !summary.unclassified.is_empty() {
        info!(
            "Left alone (unknown instance type): {}",
            summary.unclassified.join(", ")
        );
    }
    if !summary.failed.is_empty() {
        anyhow::bail!("{} submission(s) failed", summary.failed.len());
    }
    if !summary.submitted.is_empty() {
        info!("✓ Idle GPU nodes occupied");
    }

    Ok(())
}

/// Delete occupancy jobs
async fn delete(cli: &Cli, pattern: Option<&str>, all: bool, yes: bool) -> Result<()> {
    let selector = match (all, pattern) {
        (true, _) => DeleteSelector::All,
        (false, Some(pattern)) => DeleteSelector::parse(pattern),
        (false, None) => anyhow::bail!("Either --pattern or --all is required"),
    };

    let (config, client) = connect(cli).await?;
    let mut jobs = JobManager::new(&client, &config)?;
    jobs.recover().await.context("Failed to recover tracked jobs")?;

    let confirm = confirmation(yes);
    let summary = delete_once(&mut jobs, &selector, confirm.as_ref()).await?;
    if summary.cancelled {
        return Ok(());
    }

    let failed = summary.reports.iter().filter(|r| !r.is_ok()).count();
    if failed > 0 {
        anyhow::bail!("{} deletion(s) did not complete", failed);
    }

    Ok(())
}

/// Occupy idle GPU nodes on a fixed interval until Ctrl-C
async fn patrol(cli: &Cli, interval: Duration) -> Result<()> {
    let (config, client) = connect(cli).await?;
    let jobs = JobManager::new(&client, &config)?;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, stopping after the current round");
                trigger.cancel();
            }
            Err(e) => warn!("Could not listen for Ctrl-C: {}", e),
        }
    });

    let inventory = NodeInventory::new(&client, &config);
    let report = Patrol::new(inventory, jobs, interval)
        .run(cancel)
        .await
        .context("Patrol aborted")?;

    if !report.occupied_nodes.is_empty() {
        info!("Occupied this run: {}", report.occupied_nodes.join(", "));
    }

    Ok(())
}

/// Initialize example configuration file
async fn init_config(cli: &Cli) -> Result<()> {
    if cli.config.exists() {
        anyhow::bail!(
            "Configuration file already exists: {}",
            cli.config.display()
        );
    }

    let example_config = OccupyConfig::example();
    let yaml = serde_yaml::to_string(&example_config)?;

    tokio::fs::write(&cli.config, yaml)
        .await
        .context("Failed to write configuration file")?;

    info!("Example configuration created: {}", cli.config.display());
    info!("");
    info!("Next steps:");
    info!("  1. Set namespace, image and job kind for your cluster");
    info!("  2. Check which GPU nodes are idle:");
    info!("     gpu-occupy nodes");
    info!("  3. Occupy them once, or keep patrolling:");
    info!("     gpu-occupy submit");
    info!("     gpu-occupy patrol --interval 300");

    Ok(())
}
