//! clawscaler - Clawbernetes node autoscaler
//!
//! Runs the node controller against a scenario file with in-memory
//! collaborators, or dry-runs a single provisioning or disruption decision
//! and prints it as JSON.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use claw_nodescaler::disruption::mark_conditions;
use claw_nodescaler::scenario::Seeded;
use claw_nodescaler::{
    Backoff, Controller, ControllerConfig, InMemoryCluster, Planner, Provisioner,
    ReconcileContext, Scenario, simulate_kube,
};
use claw_provisioning::{NodeClaimTemplate, PlacementTarget};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_FILTER: &str = "clawscaler=info,claw_nodescaler=info";

#[derive(Parser)]
#[command(name = "clawscaler")]
#[command(about = "Clawbernetes node autoscaler")]
#[command(version)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show where pending pods would go and which nodes would be launched
    Simulate {
        /// Path to scenario file
        #[arg(short, long)]
        scenario: PathBuf,

        /// Path to config file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Show the disruption plan for a scenario
    Disrupt {
        /// Path to scenario file
        #[arg(short, long)]
        scenario: PathBuf,

        /// Path to config file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Plan as if this many seconds had passed, so grace periods and
        /// expiry can be exercised
        #[arg(long, default_value_t = 0)]
        elapsed_secs: u64,
    },

    /// Run the controller until Ctrl-C
    Run {
        /// Path to scenario file
        #[arg(short, long)]
        scenario: PathBuf,

        /// Path to config file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Seconds between simulated kubelet steps
        #[arg(long, default_value_t = 1)]
        kube_interval_secs: u64,
    },

    /// Validate a config file
    CheckConfig {
        /// Path to config file
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[derive(Serialize)]
struct SimulationReport {
    placements: BTreeMap<String, String>,
    node_claims: Vec<NodeClaimTemplate>,
    unschedulable: BTreeMap<String, String>,
    new_capacity_price: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Simulate { scenario, config } => simulate(&scenario, config.as_deref()).await?,
        Commands::Disrupt {
            scenario,
            config,
            elapsed_secs,
        } => disrupt(&scenario, config.as_deref(), elapsed_secs).await?,
        Commands::Run {
            scenario,
            config,
            kube_interval_secs,
        } => run(&scenario, config.as_deref(), kube_interval_secs).await?,
        Commands::CheckConfig { config } => check_config(&config)?,
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_writer(io::stderr)).init();
    } else {
        registry.with(fmt::layer().with_writer(io::stderr)).init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ControllerConfig> {
    match path {
        Some(path) => ControllerConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(ControllerConfig::default()),
    }
}

fn load_scenario(path: &Path) -> anyhow::Result<Seeded> {
    let scenario = Scenario::from_file(path).with_context(|| format!("loading {}", path.display()))?;
    Ok(scenario.build()?)
}

async fn capture(
    seeded: &Seeded,
    config: &ControllerConfig,
) -> anyhow::Result<ReconcileContext> {
    let (provider, cluster, store) = seeded;
    let ctx = ReconcileContext::capture(
        &**provider,
        &**cluster,
        store,
        &Backoff::from_config(&config.backoff),
        config.scheduling.policy(),
        &CancellationToken::new(),
    )
    .await?;
    Ok(ctx)
}

async fn simulate(scenario: &Path, config: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config)?;
    let seeded = load_scenario(scenario)?;
    let ctx = capture(&seeded, &config).await?;

    let results = Provisioner::<InMemoryCluster>::plan(&ctx);
    let placements = results
        .placements
        .iter()
        .map(|p| {
            let target = match &p.target {
                PlacementTarget::ExistingNode(node) => node.clone(),
                PlacementTarget::NewClaim(i) => results
                    .node_claims
                    .get(*i)
                    .map_or_else(|| format!("claim-{i}"), |c| c.name.clone()),
            };
            (p.pod.to_string(), target)
        })
        .collect();
    let report = SimulationReport {
        placements,
        new_capacity_price: results.new_capacity_price(),
        unschedulable: results
            .unschedulable
            .iter()
            .map(|(pod, reason)| (pod.to_string(), reason.to_string()))
            .collect(),
        node_claims: results.node_claims,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn disrupt(scenario: &Path, config: Option<&Path>, elapsed_secs: u64) -> anyhow::Result<()> {
    let config = load_config(config)?;
    let seeded = load_scenario(scenario)?;
    let ctx = capture(&seeded, &config).await?;
    let store = &seeded.2;

    // Conditions are stamped at the real time; planning looks ahead.
    mark_conditions(store, &ctx, Utc::now());
    let elapsed = ChronoDuration::from_std(Duration::from_secs(elapsed_secs))
        .context("elapsed-secs out of range")?;
    let now = Utc::now() + elapsed;
    let ctx = ctx.with_claims(store.list()).at(now);

    let plan = Planner::new(&ctx, &config.disruption, now).plan();
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

async fn run(scenario: &Path, config: Option<&Path>, kube_interval_secs: u64) -> anyhow::Result<()> {
    let config = load_config(config)?;
    let (provider, cluster, store) = load_scenario(scenario)?;
    info!(
        scenario = %scenario.display(),
        nodes = cluster.nodes().len(),
        pods = cluster.pods().len(),
        claims = store.len(),
        "starting clawscaler"
    );

    let cancel = CancellationToken::new();
    let controller = Controller::new(
        Arc::clone(&provider),
        Arc::clone(&cluster),
        Arc::clone(&store),
        config,
        cancel.clone(),
    );
    let (_leader_tx, leader) = watch::channel(true);

    let kube = {
        let cancel = cancel.clone();
        let (provider, cluster, store) = (Arc::clone(&provider), Arc::clone(&cluster), Arc::clone(&store));
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(Duration::from_secs(kube_interval_secs.max(1)));
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = ticks.tick() => {
                        if let Err(e) = simulate_kube(&provider, &cluster, &store).await {
                            warn!(error = %e, "kubelet step failed");
                        }
                    }
                }
            }
        })
    };

    let shutdown = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl-C");
            }
            info!("shutting down");
            cancel.cancel();
        })
    };

    controller.run(leader).await;
    shutdown.abort();
    kube.await.context("kubelet task")?;

    let mut phases: BTreeMap<String, usize> = BTreeMap::new();
    for claim in store.list() {
        *phases.entry(claim.phase.to_string()).or_default() += 1;
    }
    println!("{}", serde_json::to_string_pretty(&phases)?);
    Ok(())
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = ControllerConfig::from_file(path)?;
    println!("{} is valid", path.display());
    println!("  workers: {}", config.workers);
    println!("  provisioning every {}s", config.provisioning.interval_secs);
    if config.disruption.enabled {
        let methods: Vec<String> = config.disruption.methods.iter().map(ToString::to_string).collect();
        println!(
            "  disruption every {}s: {}",
            config.disruption.interval_secs,
            methods.join(", ")
        );
    } else {
        println!("  disruption disabled");
    }
    Ok(())
}
