//! Per-node pod eviction engine.
//!
//! Removes non-critical pods from a cordoned node: a bounded worker pool per
//! node, PDB tokens to pace pods sharing a disruption budget, retry with
//! backoff, an optional eviction-to-delete fallback, and a fast path that
//! force-deletes pods already stuck in a broken state. Counts land in an
//! [`EvictionReport`]; per-pod failures never abort the node, only a missed
//! per-node deadline does.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use futures::{stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use thiserror::Error;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::drain::report::EvictionReport;
use crate::error::KndError;
use crate::evict::token::{PdbTokenManager, TokenGuard};
use crate::k8s::cluster::ClusterOps;
use crate::k8s::pdb::{matching_pdb_keys, PdbCache};
use crate::k8s::pod;

pub const REASON_NOT_FOUND: &str = "not_found";
pub const REASON_PDB_BLOCKED: &str = "pdb_blocked";
pub const REASON_TOO_MANY_REQUESTS: &str = "too_many_requests";
pub const REASON_TIMEOUT: &str = "timeout";
pub const REASON_WAIT_FAILED: &str = "wait_for_deletion_failed";
pub const REASON_PROBLEM_FORCE_FAILED: &str = "problem_pod_force_delete_failed";
pub const REASON_PROBLEM_FORCE_WAIT_FAILED: &str = "problem_pod_force_delete_wait_failed";
pub const REASON_FORCE_DELETE_FAILED: &str = "force_delete_failed";
pub const REASON_FORCE_DELETE_WAIT_FAILED: &str = "force_delete_wait_failed";
pub const REASON_OTHER: &str = "other";

const NORMAL_GRACE_SECONDS: u32 = 60;
const BATCH_TIMEOUT_MULTIPLIER: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionMode {
    /// Eviction subresource; the API server enforces PDBs.
    Evict,
    /// Direct pod deletion.
    Delete,
}

impl EvictionMode {
    pub fn parse(s: &str) -> Result<Self, KndError> {
        match s.to_lowercase().as_str() {
            "evict" => Ok(EvictionMode::Evict),
            "delete" => Ok(EvictionMode::Delete),
            other => Err(KndError::InvalidConfig(format!(
                "unknown pod eviction mode: {other}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionMode::Evict => "evict",
            EvictionMode::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EvictionConfig {
    pub mode: EvictionMode,
    /// Fall back to delete after eviction retries are exhausted.
    pub force: bool,
    /// Fast-path problem pods with a zero-grace delete.
    pub force_problem_pods: bool,
    pub pdb_token: bool,
    pub pdb_token_max_in_flight: usize,
    pub max_concurrent: usize,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub deletion_timeout: Duration,
    pub check_interval: Duration,
    /// Deadline for everything the engine does on one node.
    pub node_timeout: Duration,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            mode: EvictionMode::Evict,
            force: false,
            force_problem_pods: true,
            pdb_token: true,
            pdb_token_max_in_flight: 1,
            max_concurrent: 30,
            max_retries: 3,
            retry_backoff: Duration::from_secs(10),
            deletion_timeout: Duration::from_secs(120),
            check_interval: Duration::from_secs(20),
            node_timeout: Duration::from_secs(600),
        }
    }
}

impl EvictionConfig {
    /// Clamp values that would stall the worker pool.
    pub fn clamped(mut self) -> Self {
        if self.max_concurrent == 0 {
            self.max_concurrent = 1;
        }
        if self.pdb_token_max_in_flight == 0 {
            self.pdb_token_max_in_flight = 1;
        }
        self
    }
}

/// A node whose eviction could not finish. Carries the counts accumulated
/// before the failure so the run summary stays truthful.
#[derive(Debug, Error)]
#[error("failed to drain pods from node {node_name}: {source}")]
pub struct NodeDrainError {
    pub node_name: String,
    pub report: EvictionReport,
    #[source]
    pub source: anyhow::Error,
}

pub struct EvictionEngine {
    cluster: Arc<dyn ClusterOps>,
    pdb_cache: Arc<PdbCache>,
    tokens: Arc<PdbTokenManager>,
    config: EvictionConfig,
}

impl EvictionEngine {
    pub fn new(
        cluster: Arc<dyn ClusterOps>,
        pdb_cache: Arc<PdbCache>,
        tokens: Arc<PdbTokenManager>,
        config: EvictionConfig,
    ) -> Self {
        Self {
            cluster,
            pdb_cache,
            tokens,
            config: config.clamped(),
        }
    }

    /// Remove every non-critical pod from the node, within the node deadline.
    pub async fn evict_node(&self, node_name: &str) -> Result<EvictionReport, NodeDrainError> {
        info!(node = node_name, mode = self.config.mode.as_str(), "starting pod eviction");

        let report = Arc::new(Mutex::new(EvictionReport::new(node_name)));
        let outcome = timeout(
            self.config.node_timeout,
            self.drain_node_pods(node_name, &report),
        )
        .await;
        let snapshot = report.lock().unwrap().clone();

        match outcome {
            Ok(Ok(())) => {
                info!(
                    node = %snapshot.node_name,
                    evicted = snapshot.evicted_pods,
                    deleted = snapshot.deleted_pods,
                    errors = snapshot.error_total(),
                    "node eviction complete"
                );
                Ok(snapshot)
            }
            Ok(Err(source)) => Err(NodeDrainError {
                node_name: node_name.to_string(),
                report: snapshot,
                source,
            }),
            Err(_) => Err(NodeDrainError {
                node_name: node_name.to_string(),
                report: snapshot,
                source: anyhow!(
                    "node eviction deadline ({:?}) exceeded",
                    self.config.node_timeout
                ),
            }),
        }
    }

    async fn drain_node_pods(
        &self,
        node_name: &str,
        report: &Arc<Mutex<EvictionReport>>,
    ) -> anyhow::Result<()> {
        let listed = self
            .cluster
            .list_node_pods(node_name)
            .await
            .map_err(|e| anyhow!("failed to list pods on node {node_name}: {e}"))?;
        let pods = pod::non_critical(listed);
        report.lock().unwrap().total_pods = pods.len();

        if pods.is_empty() {
            debug!(node = node_name, "no non-critical pods on node");
            return Ok(());
        }

        let (normal, problem) = self.partition_pods(pods).await;
        if !problem.is_empty() {
            info!(node = node_name, count = problem.len(), "found pods in a broken state");
        }

        stream::iter(normal)
            .for_each_concurrent(self.config.max_concurrent, |p| async move {
                self.process_pod(p, report).await;
            })
            .await;

        if self.config.force_problem_pods {
            for p in problem {
                self.fast_delete_problem_pod(&p, report).await;
            }
        }

        self.wait_for_node_to_empty(node_name).await
    }

    /// Split pods into normal and problem sets from a fresh read. Without the
    /// problem-pod fast path everything goes through the normal machine.
    async fn partition_pods(&self, pods: Vec<Pod>) -> (Vec<Pod>, Vec<Pod>) {
        if !self.config.force_problem_pods {
            return (pods, Vec::new());
        }
        let mut normal = Vec::new();
        let mut problem = Vec::new();
        for p in pods {
            let namespace = pod::namespace(&p);
            match self.cluster.get_pod(&namespace, &p.name_any()).await {
                Ok(current) if pod::is_problem_pod(&current) => problem.push(p),
                _ => normal.push(p),
            }
        }
        (normal, problem)
    }

    async fn process_pod(&self, p: Pod, report: &Arc<Mutex<EvictionReport>>) {
        let namespace = pod::namespace(&p);
        let name = p.name_any();

        let current = match self.cluster.get_pod(&namespace, &name).await {
            Ok(current) => Some(current),
            Err(e) if is_not_found(&e) => {
                debug!(pod = %name, "pod already gone");
                return;
            }
            Err(e) => {
                warn!(pod = %name, error = %e, "could not refresh pod state before eviction");
                None
            }
        };
        let is_problem = current.as_ref().map(pod::is_problem_pod).unwrap_or(false);

        if self.config.force_problem_pods && is_problem {
            self.fast_delete_problem_pod(&p, report).await;
            return;
        }

        let _tokens = if self.config.pdb_token {
            Some(self.acquire_pdb_tokens(&namespace, &p).await)
        } else {
            None
        };

        self.remove_pod(&p, is_problem, report).await;
    }

    async fn acquire_pdb_tokens(&self, namespace: &str, p: &Pod) -> TokenGuard {
        let keys = match self
            .pdb_cache
            .namespace_pdbs(self.cluster.as_ref(), namespace)
            .await
        {
            Ok(entries) => {
                let zero_budget = entries.iter().filter(|e| e.disruptions_allowed == 0).count();
                if zero_budget > 0 {
                    debug!(namespace, zero_budget, "namespace has PDBs with no disruptions allowed");
                }
                matching_pdb_keys(namespace, p.labels(), &entries)
            }
            Err(e) => {
                warn!(namespace, error = %e, "failed to load PDB snapshot, proceeding without tokens");
                Vec::new()
            }
        };
        if !keys.is_empty() {
            debug!(pod = %p.name_any(), keys = ?keys, "waiting for PDB tokens");
        }
        let guard = self.tokens.acquire(&keys).await;
        if !guard.is_empty() {
            debug!(pod = %p.name_any(), held = ?guard.keys(), "holding PDB tokens");
        }
        guard
    }

    /// Attempt loop with backoff, then the optional eviction-to-delete
    /// fallback.
    async fn remove_pod(&self, p: &Pod, is_problem: bool, report: &Arc<Mutex<EvictionReport>>) {
        let namespace = pod::namespace(p);
        let name = p.name_any();
        let mut pdb_counted = false;
        let mut success_counted = false;

        for attempt in 0..self.config.max_retries {
            if attempt > 0 {
                sleep(self.config.retry_backoff).await;
            }

            let grace = removal_grace(self.config.mode, is_problem);
            let result = match self.config.mode {
                EvictionMode::Evict => self.cluster.evict_pod(&namespace, &name, grace).await,
                EvictionMode::Delete => self.cluster.delete_pod(&namespace, &name, grace).await,
            };

            match result {
                Ok(()) => {
                    if !success_counted {
                        success_counted = true;
                        let mut r = report.lock().unwrap();
                        match self.config.mode {
                            EvictionMode::Evict => r.evicted_pods += 1,
                            EvictionMode::Delete => {
                                r.deleted_pods += 1;
                                if grace == 0 {
                                    r.force_deleted_pods += 1;
                                }
                            }
                        }
                    }
                    match self.wait_for_deletion(p, report).await {
                        Ok(()) => return,
                        Err(e) => {
                            warn!(pod = %name, attempt = attempt + 1, error = %e, "pod still present after removal request, retrying");
                            report.lock().unwrap().add_error_reason(REASON_WAIT_FAILED);
                        }
                    }
                }
                Err(e) if is_not_found(&e) => {
                    // Idempotent success: the target is already gone. Deletes
                    // still count so the pod lands in a success bucket.
                    debug!(pod = %name, "pod already removed");
                    if self.config.mode == EvictionMode::Delete && !success_counted {
                        let mut r = report.lock().unwrap();
                        r.deleted_pods += 1;
                        if grace == 0 {
                            r.force_deleted_pods += 1;
                        }
                    }
                    return;
                }
                Err(e) => {
                    let reason = classify_removal_error(&e);
                    warn!(pod = %name, attempt = attempt + 1, reason, error = %e, "pod removal attempt failed");
                    let mut r = report.lock().unwrap();
                    r.add_error_reason(reason);
                    if reason == REASON_PDB_BLOCKED && !pdb_counted {
                        r.pdb_blocked_pods += 1;
                        pdb_counted = true;
                    }
                }
            }
        }

        if self.config.mode == EvictionMode::Evict && self.config.force {
            self.force_delete_fallback(p, is_problem, report).await;
        } else {
            warn!(
                pod = %name,
                retries = self.config.max_retries,
                "giving up on pod after exhausting retries"
            );
        }
    }

    async fn force_delete_fallback(
        &self,
        p: &Pod,
        is_problem: bool,
        report: &Arc<Mutex<EvictionReport>>,
    ) {
        let namespace = pod::namespace(p);
        let name = p.name_any();
        let grace = if is_problem { 0 } else { NORMAL_GRACE_SECONDS };
        info!(pod = %name, grace, "eviction retries exhausted, falling back to delete");

        match self.cluster.delete_pod(&namespace, &name, grace).await {
            Err(e) if !is_not_found(&e) => {
                warn!(pod = %name, error = %e, "fallback delete failed");
                report.lock().unwrap().add_error_reason(REASON_FORCE_DELETE_FAILED);
            }
            _ => {
                {
                    let mut r = report.lock().unwrap();
                    r.deleted_pods += 1;
                    r.forced_by_fallback += 1;
                    if grace == 0 {
                        r.force_deleted_pods += 1;
                    }
                }
                if let Err(e) = self.wait_for_deletion(p, report).await {
                    warn!(pod = %name, error = %e, "fallback delete not observed");
                    report
                        .lock()
                        .unwrap()
                        .add_error_reason(REASON_FORCE_DELETE_WAIT_FAILED);
                }
            }
        }
    }

    /// Zero-grace delete for pods already stuck in a broken state.
    async fn fast_delete_problem_pod(&self, p: &Pod, report: &Arc<Mutex<EvictionReport>>) {
        let namespace = pod::namespace(p);
        let name = p.name_any();
        info!(pod = %name, "force deleting problem pod");

        match self.cluster.delete_pod(&namespace, &name, 0).await {
            Err(e) if !is_not_found(&e) => {
                warn!(pod = %name, error = %e, "problem pod force delete failed");
                report
                    .lock()
                    .unwrap()
                    .add_error_reason(REASON_PROBLEM_FORCE_FAILED);
            }
            _ => {
                {
                    let mut r = report.lock().unwrap();
                    r.deleted_pods += 1;
                    r.force_deleted_pods += 1;
                    r.problem_pods_forced += 1;
                }
                if let Err(e) = self.wait_for_deletion(p, report).await {
                    warn!(pod = %name, error = %e, "problem pod delete not observed");
                    report
                        .lock()
                        .unwrap()
                        .add_error_reason(REASON_PROBLEM_FORCE_WAIT_FAILED);
                }
            }
        }
    }

    /// Poll until the pod is gone. Batch workloads get 1.5x the timeout. A
    /// final check that fails only because of rate limiting counts as
    /// success, with an audit counter.
    async fn wait_for_deletion(
        &self,
        p: &Pod,
        report: &Arc<Mutex<EvictionReport>>,
    ) -> anyhow::Result<()> {
        let namespace = pod::namespace(p);
        let name = p.name_any();
        let multiplier = if pod::is_batch_pod(p) {
            BATCH_TIMEOUT_MULTIPLIER
        } else {
            1.0
        };
        let deadline = Instant::now() + self.config.deletion_timeout.mul_f64(multiplier);

        let mut last_error: Option<kube::Error> = None;
        while Instant::now() < deadline {
            match self.cluster.get_pod(&namespace, &name).await {
                Err(e) if is_not_found(&e) => {
                    debug!(pod = %name, "pod deleted");
                    return Ok(());
                }
                Err(e) => {
                    warn!(pod = %name, error = %e, "transient error while waiting for pod deletion");
                    last_error = Some(e);
                }
                Ok(_) => {
                    debug!(pod = %name, "pod not yet deleted");
                    last_error = None;
                }
            }
            sleep(self.config.check_interval).await;
        }

        match self.cluster.get_pod(&namespace, &name).await {
            Err(e) if is_not_found(&e) => return Ok(()),
            Err(e) => last_error = Some(e),
            Ok(_) => {}
        }

        if last_error.as_ref().map(is_rate_limit_error).unwrap_or(false) {
            warn!(pod = %name, "cannot confirm deletion because of rate limiting, assuming the pod is gone");
            report.lock().unwrap().rate_limit_assumed += 1;
            return Ok(());
        }

        Err(anyhow!("timed out waiting for pod {namespace}/{name} to be deleted"))
    }

    /// The node is done when no non-critical pods remain on it. Bounded by
    /// the caller's node deadline.
    async fn wait_for_node_to_empty(&self, node_name: &str) -> anyhow::Result<()> {
        loop {
            let listed = self
                .cluster
                .list_node_pods(node_name)
                .await
                .map_err(|e| anyhow!("failed to list pods on node {node_name}: {e}"))?;
            let remaining = pod::non_critical(listed).len();
            if remaining == 0 {
                info!(node = node_name, "all non-critical pods removed");
                return Ok(());
            }
            debug!(node = node_name, remaining, "waiting for remaining pods to terminate");
            sleep(self.config.check_interval).await;
        }
    }
}

fn removal_grace(mode: EvictionMode, is_problem: bool) -> u32 {
    match mode {
        EvictionMode::Evict => NORMAL_GRACE_SECONDS,
        EvictionMode::Delete => {
            if is_problem {
                0
            } else {
                NORMAL_GRACE_SECONDS
            }
        }
    }
}

pub(crate) fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 404)
}

pub(crate) fn classify_removal_error(err: &kube::Error) -> &'static str {
    if let kube::Error::Api(e) = err {
        if e.code == 404 {
            return REASON_NOT_FOUND;
        }
        if e.code == 429 {
            let message = e.message.to_lowercase();
            if message.contains("disruption") || message.contains("budget") || message.contains("pdb")
            {
                return REASON_PDB_BLOCKED;
            }
            return REASON_TOO_MANY_REQUESTS;
        }
    }
    let message = err.to_string().to_lowercase();
    if message.contains("timeout") || message.contains("deadline exceeded") {
        return REASON_TIMEOUT;
    }
    REASON_OTHER
}

fn is_rate_limit_error(err: &kube::Error) -> bool {
    let message = err.to_string().to_lowercase();
    message.contains("rate limit") || message.contains("too many requests")
}
