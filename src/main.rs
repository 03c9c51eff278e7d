//! knd - Karpenter nodepool drain CLI tool.
//!
//! Reads cluster-wide allocation pressure from Prometheus, derives a drain
//! budget, cordons the oldest nodes in the nodepool, and evicts their
//! non-critical pods while honoring PodDisruptionBudgets.

mod config;
mod drain;
mod error;
mod evict;
mod k8s;
mod karpenter;
mod notify;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use config::{Args, Command, DrainArgs, DrainRunConfig, KarpenterCommand, Settings};
use drain::runner::{self, DrainContext};
use evict::token::PdbTokenManager;
use k8s::cluster::KubeCluster;
use k8s::pdb::{PdbCache, DEFAULT_PDB_CACHE_TTL};
use karpenter::{MetricsSource, PromClient, ResourceType};
use notify::slack::{self, SlackNotifier};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = init_tracing(&args.log_level) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    if let Err(e) = run(args).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}

/// Initialize tracing subscriber.
fn init_tracing(log_level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to initialize log filter: {e}"))?;

    fmt().with_env_filter(filter).with_target(false).init();

    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let settings = Settings::from_args(&args)?;

    match &args.command {
        Command::Drain(drain_args) => run_drain(&settings, drain_args).await,
        Command::Karpenter(KarpenterCommand::AllocateRate) => run_allocate_rate(&settings).await,
    }
}

/// `knd karpenter allocate-rate`
async fn run_allocate_rate(settings: &Settings) -> Result<()> {
    let prom = PromClient::new(&settings.prometheus_address, &settings.prometheus_org_id)?;
    let nodepool = &settings.nodepool_name;

    let memory_allocatable = prom
        .nodes_allocatable(nodepool, ResourceType::Memory)
        .await?;
    let cpu_allocatable = prom.nodes_allocatable(nodepool, ResourceType::Cpu).await?;
    info!(
        memory_allocatable_gb = memory_allocatable,
        cpu_allocatable_vcpu = cpu_allocatable,
        "nodepool allocatable capacity"
    );

    let memory_rate = prom.allocate_rate(nodepool, ResourceType::Memory).await?;
    let cpu_rate = prom.allocate_rate(nodepool, ResourceType::Cpu).await?;
    info!(
        memory_allocate_rate = memory_rate,
        cpu_allocate_rate = cpu_rate,
        "Karpenter allocate rates (%)"
    );

    Ok(())
}

/// `knd drain`
async fn run_drain(settings: &Settings, drain_args: &DrainArgs) -> Result<()> {
    let run_config = DrainRunConfig::from_args(drain_args)?;

    let client = k8s::client::build_client(&settings.kube_config).await?;
    let prom = PromClient::new(&settings.prometheus_address, &settings.prometheus_org_id)?;
    let notifier = settings.slack_webhook_url.as_ref().map(|url| {
        info!("Slack notifications enabled");
        Arc::new(SlackNotifier::new(url.clone()))
    });

    let ctx = DrainContext {
        cluster: Arc::new(KubeCluster::new(client)),
        metrics: Arc::new(prom) as Arc<dyn MetricsSource>,
        pdb_cache: Arc::new(PdbCache::new(DEFAULT_PDB_CACHE_TTL)),
        tokens: Arc::new(PdbTokenManager::new(
            run_config.eviction.pdb_token_max_in_flight,
        )),
        notifier: notifier.clone(),
        cluster_name: settings.cluster_name.clone(),
        nodepool: settings.nodepool_name.clone(),
        policy: run_config.policy,
        eviction: run_config.eviction,
        progressive: run_config.progressive,
        settle_delay: run_config.settle_delay,
    };

    info!(nodepool = %ctx.nodepool, "starting node drain");
    match runner::node_drain(&ctx).await {
        Ok(outcome) => {
            if let Some(notifier) = &notifier {
                let message = slack::format_drain_complete(
                    &outcome.results,
                    &outcome.summary,
                    &settings.cluster_name,
                    &settings.nodepool_name,
                );
                if let Err(e) = notifier.send(&message).await {
                    error!(error = %e, "failed to send completion notification");
                }
            }
            info!(
                planned = outcome.summary.planned_drain_node_count,
                drained = outcome.summary.drained_node_count,
                stopped_by_safety = outcome.summary.stopped_by_safety,
                "node drain finished"
            );
            Ok(())
        }
        Err(failure) => {
            if let Some(notifier) = &notifier {
                let message = slack::format_drain_error(
                    &failure.source.to_string(),
                    &failure.summary,
                    &settings.cluster_name,
                    &settings.nodepool_name,
                );
                if let Err(e) = notifier.send(&message).await {
                    error!(error = %e, "failed to send failure notification");
                }
            }
            Err(failure.into())
        }
    }
}
