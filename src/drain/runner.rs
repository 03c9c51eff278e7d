//! Run coordination for a drain invocation.
//!
//! One shot: list candidates, plan a budget, cordon the oldest nodes
//! up-front, then evict them one node at a time. Progressive mode re-checks
//! the safety gates between nodes so rising pressure stops the run early.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::drain::policy::{self, DrainPolicyOptions};
use crate::drain::report::{DrainSummary, NodeDrainResult};
use crate::evict::engine::{EvictionConfig, EvictionEngine};
use crate::evict::token::PdbTokenManager;
use crate::k8s::cluster::ClusterOps;
use crate::k8s::node;
use crate::k8s::pdb::PdbCache;
use crate::karpenter::{MetricsSource, ResourceType};
use crate::notify::slack::{self, SlackNotifier};

/// Everything a drain run needs, built once at startup and injected.
pub struct DrainContext {
    pub cluster: Arc<dyn ClusterOps>,
    pub metrics: Arc<dyn MetricsSource>,
    pub pdb_cache: Arc<PdbCache>,
    pub tokens: Arc<PdbTokenManager>,
    pub notifier: Option<Arc<SlackNotifier>>,
    pub cluster_name: String,
    pub nodepool: String,
    pub policy: DrainPolicyOptions,
    pub eviction: EvictionConfig,
    pub progressive: bool,
    pub settle_delay: Duration,
}

#[derive(Debug)]
pub struct DrainOutcome {
    pub results: Vec<NodeDrainResult>,
    pub summary: DrainSummary,
}

/// A failed run still reports what it did before failing.
#[derive(Debug, Error)]
#[error("node drain failed: {source}")]
pub struct DrainFailure {
    pub summary: DrainSummary,
    #[source]
    pub source: anyhow::Error,
}

pub async fn node_drain(ctx: &DrainContext) -> Result<DrainOutcome, DrainFailure> {
    let mut summary = DrainSummary::new(&ctx.nodepool);
    match run_drain(ctx, &mut summary).await {
        Ok(results) => {
            summary.finalize();
            Ok(DrainOutcome { results, summary })
        }
        Err(source) => {
            summary.finalize();
            Err(DrainFailure { summary, source })
        }
    }
}

async fn run_drain(ctx: &DrainContext, summary: &mut DrainSummary) -> Result<Vec<NodeDrainResult>> {
    let mut candidates = ctx
        .cluster
        .list_nodepool_nodes(&ctx.nodepool)
        .await
        .map_err(|e| anyhow!("failed to list nodes in nodepool {}: {e}", ctx.nodepool))?;
    summary.total_nodes_in_nodepool = candidates.len();
    node::sort_by_creation(&mut candidates);
    info!(nodepool = %ctx.nodepool, nodes = candidates.len(), "listed drain candidates");

    notify(ctx, slack::format_node_count(&ctx.cluster_name, &ctx.nodepool, candidates.len())).await;

    let (memory_rate, cpu_rate) = read_allocate_rates(ctx).await?;
    let max_rate = memory_rate.max(cpu_rate);
    info!(memory_rate, cpu_rate, max_rate, "current allocate rates");
    notify(
        ctx,
        slack::format_allocate_rate(&ctx.cluster_name, &ctx.nodepool, memory_rate, cpu_rate),
    )
    .await;

    let verdict = policy::evaluate_safety(max_rate, &ctx.policy, ctx.metrics.as_ref()).await;
    let planned = if verdict.blocked {
        warn!(reason = %verdict.reason, "drain blocked by safety conditions");
        summary.stopped_by_safety = true;
        summary.stop_safety_reason = verdict.reason;
        0
    } else {
        policy::calculate_drain_node_count(candidates.len(), max_rate, &ctx.policy)
    };
    summary.planned_drain_node_count = planned;
    info!(planned, "drain budget computed");

    // Cordon everything in the budget before the first eviction; a cordoned
    // node that is never drained is harmless and re-runs pick it up again.
    let targets: Vec<Node> = candidates.into_iter().take(planned).collect();
    for target in &targets {
        let name = target.name_any();
        ctx.cluster
            .cordon_node(&name)
            .await
            .map_err(|e| anyhow!("failed to cordon node {name}: {e}"))?;
    }

    let engine = EvictionEngine::new(
        ctx.cluster.clone(),
        ctx.pdb_cache.clone(),
        ctx.tokens.clone(),
        ctx.eviction.clone(),
    );
    let recheck = ctx.progressive
        && (ctx.policy.safety_max_allocate_rate > 0 || !ctx.policy.safety_queries.is_empty());

    let mut results = Vec::new();
    for (index, target) in targets.iter().enumerate() {
        let name = target.name_any();
        if node::nodepool(target) != Some(ctx.nodepool.as_str()) {
            warn!(node = %name, "node no longer labeled for the target nodepool, skipping");
            continue;
        }

        match engine.evict_node(&name).await {
            Ok(report) => {
                summary.drained_node_count += 1;
                summary.merge_report(&report);
            }
            Err(failure) => {
                summary.drained_node_count += 1;
                summary.merge_report(&failure.report);
                return Err(anyhow!(failure));
            }
        }

        results.push(NodeDrainResult {
            node_name: name.clone(),
            instance_type: node::instance_type(target),
            nodepool_name: ctx.nodepool.clone(),
            age: node::age_rfc3339(target),
        });

        if !ctx.settle_delay.is_zero() {
            info!(
                node = %name,
                delay = ?ctx.settle_delay,
                "settling so the autoscaler can observe the node removal"
            );
            sleep(ctx.settle_delay).await;
        }

        if recheck && index + 1 < targets.len() {
            let (memory_rate, cpu_rate) = best_effort_rates(ctx).await;
            let verdict =
                policy::evaluate_safety(memory_rate.max(cpu_rate), &ctx.policy, ctx.metrics.as_ref())
                    .await;
            if verdict.blocked {
                warn!(reason = %verdict.reason, "stopping further drains on safety conditions");
                summary.stopped_by_safety = true;
                summary.stop_safety_reason = verdict.reason;
                break;
            }
        }
    }

    // Closing snapshot is informational only.
    let (memory_rate, cpu_rate) = best_effort_rates(ctx).await;
    info!(memory_rate, cpu_rate, "allocate rates after drain");
    notify(
        ctx,
        slack::format_allocate_rate(&ctx.cluster_name, &ctx.nodepool, memory_rate, cpu_rate),
    )
    .await;

    Ok(results)
}

async fn read_allocate_rates(ctx: &DrainContext) -> Result<(i64, i64)> {
    let memory = ctx
        .metrics
        .allocate_rate(&ctx.nodepool, ResourceType::Memory)
        .await
        .map_err(|e| anyhow!("failed to read memory allocate rate: {e}"))?;
    let cpu = ctx
        .metrics
        .allocate_rate(&ctx.nodepool, ResourceType::Cpu)
        .await
        .map_err(|e| anyhow!("failed to read cpu allocate rate: {e}"))?;
    Ok((memory, cpu))
}

/// Failed reads fall back to 0 instead of aborting: mid-run and closing
/// snapshots must not take down a drain that is already underway.
async fn best_effort_rates(ctx: &DrainContext) -> (i64, i64) {
    let memory = match ctx.metrics.allocate_rate(&ctx.nodepool, ResourceType::Memory).await {
        Ok(rate) => rate,
        Err(e) => {
            warn!(error = %e, "memory allocate rate read failed, continuing");
            0
        }
    };
    let cpu = match ctx.metrics.allocate_rate(&ctx.nodepool, ResourceType::Cpu).await {
        Ok(rate) => rate,
        Err(e) => {
            warn!(error = %e, "cpu allocate rate read failed, continuing");
            0
        }
    };
    (memory, cpu)
}

async fn notify(ctx: &DrainContext, message: String) {
    if let Some(notifier) = &ctx.notifier {
        if let Err(e) = notifier.send(&message).await {
            warn!(error = %e, "failed to send notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::fake::{test_node, test_pod, FakeCluster, FakeMetrics};
    use crate::k8s::pdb::DEFAULT_PDB_CACHE_TTL;
    use chrono::TimeZone;
    use chrono::Utc;

    fn fast_eviction() -> EvictionConfig {
        EvictionConfig {
            max_retries: 1,
            retry_backoff: Duration::from_millis(1),
            deletion_timeout: Duration::from_millis(30),
            check_interval: Duration::from_millis(5),
            node_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    fn context(
        cluster: Arc<FakeCluster>,
        metrics: Arc<FakeMetrics>,
        policy: DrainPolicyOptions,
    ) -> DrainContext {
        DrainContext {
            cluster: cluster as Arc<dyn ClusterOps>,
            metrics: metrics as Arc<dyn MetricsSource>,
            pdb_cache: Arc::new(PdbCache::new(DEFAULT_PDB_CACHE_TTL)),
            tokens: Arc::new(PdbTokenManager::new(1)),
            notifier: None,
            cluster_name: "test-cluster".to_string(),
            nodepool: "workers".to_string(),
            policy,
            eviction: fast_eviction(),
            progressive: true,
            settle_delay: Duration::ZERO,
        }
    }

    fn seeded_nodes(cluster: &FakeCluster, count: usize) {
        let mut nodes = cluster.nodes.lock().unwrap();
        for i in 0..count {
            nodes.push(test_node(
                &format!("node-{i}"),
                "workers",
                Utc.with_ymd_and_hms(2020 + i as i32, 1, 1, 0, 0, 0).unwrap(),
            ));
        }
    }

    #[tokio::test]
    async fn test_empty_nodepool_drains_nothing() {
        let cluster = Arc::new(FakeCluster::default());
        let metrics = Arc::new(FakeMetrics::with_rates(vec![40]));
        let ctx = context(cluster.clone(), metrics, DrainPolicyOptions::default());

        let outcome = node_drain(&ctx).await.unwrap();
        assert_eq!(outcome.summary.total_nodes_in_nodepool, 0);
        assert_eq!(outcome.summary.planned_drain_node_count, 0);
        assert_eq!(outcome.summary.drained_node_count, 0);
        assert!(outcome.results.is_empty());
        assert!(cluster.cordoned_nodes().is_empty());
    }

    #[tokio::test]
    async fn test_oldest_nodes_drained_in_order() {
        let cluster = Arc::new(FakeCluster::default());
        // Seed out of creation order; the runner must sort.
        {
            let mut nodes = cluster.nodes.lock().unwrap();
            nodes.push(test_node(
                "node-new",
                "workers",
                Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            ));
            nodes.push(test_node(
                "node-old",
                "workers",
                Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
            ));
            nodes.push(test_node(
                "node-mid",
                "workers",
                Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap(),
            ));
        }
        // formula/floor: 3 * 0.69 = 2.07 -> 2
        let metrics = Arc::new(FakeMetrics::with_rates(vec![30]));
        let ctx = context(cluster.clone(), metrics, DrainPolicyOptions::default());

        let outcome = node_drain(&ctx).await.unwrap();
        assert_eq!(outcome.summary.planned_drain_node_count, 2);
        assert_eq!(outcome.summary.drained_node_count, 2);
        assert_eq!(cluster.cordoned_nodes(), vec!["node-old", "node-mid"]);
        let drained: Vec<_> = outcome.results.iter().map(|r| r.node_name.as_str()).collect();
        assert_eq!(drained, vec!["node-old", "node-mid"]);
        assert_eq!(outcome.results[0].instance_type, "m5.large");
        assert_eq!(outcome.results[0].nodepool_name, "workers");
    }

    #[tokio::test]
    async fn test_safety_threshold_blocks_run() {
        let cluster = Arc::new(FakeCluster::default());
        seeded_nodes(&cluster, 5);
        let metrics = Arc::new(FakeMetrics::with_rates(vec![55]));
        let policy = DrainPolicyOptions {
            safety_max_allocate_rate: 50,
            ..Default::default()
        };
        let ctx = context(cluster.clone(), metrics, policy);

        let outcome = node_drain(&ctx).await.unwrap();
        assert_eq!(outcome.summary.planned_drain_node_count, 0);
        assert!(outcome.summary.stopped_by_safety);
        assert!(outcome
            .summary
            .stop_safety_reason
            .contains(">= safetyMaxAllocateRate"));
        assert!(cluster.cordoned_nodes().is_empty());
    }

    #[tokio::test]
    async fn test_progressive_stop_on_rising_pressure() {
        let cluster = Arc::new(FakeCluster::default());
        seeded_nodes(&cluster, 4);
        // First read (memory, cpu) = (30, 30) plans 2 nodes; the recheck
        // after node 1 reads 95 and trips the threshold.
        let metrics = Arc::new(FakeMetrics::with_rates(vec![30, 30, 95]));
        let policy = DrainPolicyOptions {
            safety_max_allocate_rate: 90,
            ..Default::default()
        };
        let ctx = context(cluster.clone(), metrics, policy);

        let outcome = node_drain(&ctx).await.unwrap();
        assert_eq!(outcome.summary.planned_drain_node_count, 2);
        assert_eq!(outcome.summary.drained_node_count, 1);
        assert!(outcome.summary.stopped_by_safety);
        assert_eq!(outcome.results.len(), 1);
        // Both budgeted nodes were cordoned before the stop.
        assert_eq!(cluster.cordoned_nodes().len(), 2);
    }

    #[tokio::test]
    async fn test_progressive_disabled_drains_full_budget() {
        let cluster = Arc::new(FakeCluster::default());
        seeded_nodes(&cluster, 4);
        let metrics = Arc::new(FakeMetrics::with_rates(vec![30, 30, 95]));
        let policy = DrainPolicyOptions {
            safety_max_allocate_rate: 90,
            ..Default::default()
        };
        let mut ctx = context(cluster.clone(), metrics, policy);
        ctx.progressive = false;

        let outcome = node_drain(&ctx).await.unwrap();
        assert_eq!(outcome.summary.drained_node_count, 2);
        assert!(!outcome.summary.stopped_by_safety);
    }

    #[tokio::test]
    async fn test_engine_failure_returns_partial_summary() {
        let cluster = Arc::new(FakeCluster::default());
        seeded_nodes(&cluster, 2);
        cluster
            .pods
            .lock()
            .unwrap()
            .push(test_pod("default", "immortal", "node-0"));
        cluster.fail_evictions("immortal", 500, "boom");

        let metrics = Arc::new(FakeMetrics::with_rates(vec![10]));
        let ctx = context(cluster.clone(), metrics, DrainPolicyOptions::default());

        let failure = node_drain(&ctx).await.unwrap_err();
        // floor(2 * 0.89) = 1
        assert_eq!(failure.summary.planned_drain_node_count, 1);
        assert_eq!(failure.summary.drained_node_count, 1);
        assert!(failure.summary.error_total() >= 1);
        assert!(!failure.summary.top_error_reasons.is_empty());
        assert!(failure.to_string().contains("node drain failed"));
    }

    #[tokio::test]
    async fn test_pods_evicted_from_drained_nodes() {
        let cluster = Arc::new(FakeCluster::default());
        seeded_nodes(&cluster, 2);
        {
            let mut pods = cluster.pods.lock().unwrap();
            pods.push(test_pod("default", "web-1", "node-0"));
            pods.push(test_pod("default", "web-2", "node-0"));
        }
        // 2 * 0.59 = 1.18 -> plan 1 node
        let metrics = Arc::new(FakeMetrics::with_rates(vec![40]));
        let ctx = context(cluster.clone(), metrics, DrainPolicyOptions::default());

        let outcome = node_drain(&ctx).await.unwrap();
        assert_eq!(outcome.summary.drained_node_count, 1);
        assert_eq!(outcome.summary.total_pods, 2);
        assert_eq!(outcome.summary.evicted_pods, 2);
        assert_eq!(outcome.summary.deleted_pods, 0);
    }
}
