//! Eviction accounting and the run summary.

use std::collections::HashMap;

/// Per-node pod removal counts. Counters only ever increase; a pod lands in
/// exactly one success counter or contributes to an error bucket.
#[derive(Debug, Clone, Default)]
pub struct EvictionReport {
    pub node_name: String,
    pub total_pods: usize,
    pub evicted_pods: usize,
    pub deleted_pods: usize,
    pub force_deleted_pods: usize,
    pub pdb_blocked_pods: usize,
    pub forced_by_fallback: usize,
    pub problem_pods_forced: usize,
    /// Deletions assumed successful because the final existence check was
    /// rate limited.
    pub rate_limit_assumed: usize,
    pub errors_by_reason: HashMap<String, usize>,
}

impl EvictionReport {
    pub fn new(node_name: &str) -> Self {
        Self {
            node_name: node_name.to_string(),
            ..Default::default()
        }
    }

    pub fn add_error_reason(&mut self, reason: &str) {
        let reason = if reason.is_empty() { "unknown" } else { reason };
        *self.errors_by_reason.entry(reason.to_string()).or_insert(0) += 1;
    }

    pub fn error_total(&self) -> usize {
        self.errors_by_reason.values().sum()
    }
}

/// One drained node, for the completion notification.
#[derive(Debug, Clone)]
pub struct NodeDrainResult {
    pub node_name: String,
    pub instance_type: String,
    pub nodepool_name: String,
    pub age: String,
}

/// Whole-run aggregation across drained nodes.
#[derive(Debug, Clone, Default)]
pub struct DrainSummary {
    pub target_nodepool: String,
    pub total_nodes_in_nodepool: usize,
    pub planned_drain_node_count: usize,
    pub drained_node_count: usize,
    pub total_pods: usize,
    pub evicted_pods: usize,
    pub deleted_pods: usize,
    pub force_deleted_pods: usize,
    pub pdb_blocked_pods: usize,
    pub forced_by_fallback: usize,
    pub problem_pods_forced: usize,
    pub rate_limit_assumed: usize,
    pub stopped_by_safety: bool,
    pub stop_safety_reason: String,
    pub errors_by_reason: HashMap<String, usize>,
    pub top_error_reasons: Vec<String>,
}

impl DrainSummary {
    pub fn new(nodepool: &str) -> Self {
        Self {
            target_nodepool: nodepool.to_string(),
            ..Default::default()
        }
    }

    pub fn merge_report(&mut self, report: &EvictionReport) {
        self.total_pods += report.total_pods;
        self.evicted_pods += report.evicted_pods;
        self.deleted_pods += report.deleted_pods;
        self.force_deleted_pods += report.force_deleted_pods;
        self.pdb_blocked_pods += report.pdb_blocked_pods;
        self.forced_by_fallback += report.forced_by_fallback;
        self.problem_pods_forced += report.problem_pods_forced;
        self.rate_limit_assumed += report.rate_limit_assumed;
        for (reason, count) in &report.errors_by_reason {
            *self.errors_by_reason.entry(reason.clone()).or_insert(0) += count;
        }
    }

    /// Compute the surfaced top-3 error reasons.
    pub fn finalize(&mut self) {
        self.top_error_reasons = top_reasons(&self.errors_by_reason, 3);
    }

    pub fn error_total(&self) -> usize {
        self.errors_by_reason.values().sum()
    }
}

/// Reasons by descending count; key order breaks ties so the output is
/// stable.
pub fn top_reasons(counts: &HashMap<String, usize>, n: usize) -> Vec<String> {
    if n == 0 || counts.is_empty() {
        return Vec::new();
    }
    let mut items: Vec<(&String, &usize)> = counts.iter().collect();
    items.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    items.into_iter().take(n).map(|(k, _)| k.clone()).collect()
}
