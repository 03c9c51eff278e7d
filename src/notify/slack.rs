//! Slack webhook notifications for drain runs.
//!
//! Plain-text payloads (`{"text": ...}`). Notification failures are logged
//! by callers and never abort a run.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::debug;

use crate::drain::report::{DrainSummary, NodeDrainResult};

#[derive(Serialize)]
struct SlackMessage<'a> {
    text: &'a str,
}

pub struct SlackNotifier {
    webhook_url: String,
    client: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    /// POST the message to the webhook; anything but HTTP 200 is a failure.
    pub async fn send(&self, message: &str) -> Result<()> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&SlackMessage { text: message })
            .send()
            .await
            .context("failed to send Slack notification")?;

        if response.status() != reqwest::StatusCode::OK {
            bail!(
                "slack notification failed with status code: {}",
                response.status()
            );
        }
        debug!("Slack notification sent");
        Ok(())
    }
}

pub fn format_node_count(cluster: &str, nodepool: &str, count: usize) -> String {
    format!("ℹ️ Current node count in nodepool {nodepool} of {cluster}: {count}")
}

pub fn format_allocate_rate(cluster: &str, nodepool: &str, memory_rate: i64, cpu_rate: i64) -> String {
    let mut message = format!(
        "🔄 Current Karpenter allocate rates for nodepool {nodepool} of {cluster}\n\n"
    );
    message.push_str(&format!("• MemoryAllocateRate: {memory_rate}%\n"));
    message.push_str(&format!("• CpuAllocateRate: {cpu_rate}%\n"));
    message
}

pub fn format_drain_complete(
    results: &[NodeDrainResult],
    summary: &DrainSummary,
    cluster: &str,
    nodepool: &str,
) -> String {
    let mut message = if results.is_empty() {
        format!("ℹ️ No nodes were drained (cluster: {cluster}, nodepool: {nodepool})\n\n")
    } else {
        let mut message =
            format!("🔄 Node drain complete (cluster: {cluster}, nodepool: {nodepool})\n\n");
        for result in results {
            message.push_str(&format!(
                "• Node: {}\n  Instance type: {}\n  Nodepool: {}\n  Created: {}\n",
                result.node_name, result.instance_type, result.nodepool_name, result.age
            ));
        }
        message.push('\n');
        message
    };
    message.push_str(&format_summary_block(summary));
    message
}

pub fn format_drain_error(
    error: &str,
    summary: &DrainSummary,
    cluster: &str,
    nodepool: &str,
) -> String {
    let mut message =
        format!("❌ Node drain run failed (cluster: {cluster}, nodepool: {nodepool})\n\n");
    message.push_str(&format!("Error: {error}\n\n"));
    message.push_str(&format_summary_block(summary));
    message
}

fn format_summary_block(summary: &DrainSummary) -> String {
    let mut block = String::from("📊 Drain summary\n\n");
    block.push_str(&format!("• Nodepool: {}\n", summary.target_nodepool));
    block.push_str(&format!(
        "• Total nodes in nodepool: {}\n",
        summary.total_nodes_in_nodepool
    ));
    block.push_str(&format!(
        "• Planned drain count: {}\n",
        summary.planned_drain_node_count
    ));
    block.push_str(&format!(
        "• Drained node count: {}\n",
        summary.drained_node_count
    ));

    block.push('\n');
    block.push_str(&format!("• Target pods: {}\n", summary.total_pods));
    block.push_str(&format!("• Evicted: {}\n", summary.evicted_pods));
    block.push_str(&format!(
        "• Deleted: {} (force deleted: {})\n",
        summary.deleted_pods, summary.force_deleted_pods
    ));
    block.push_str(&format!("• PDB blocked: {}\n", summary.pdb_blocked_pods));
    block.push_str(&format!(
        "• Fallback force deletes: {}\n",
        summary.forced_by_fallback
    ));
    block.push_str(&format!(
        "• Problem pods force deleted: {}\n",
        summary.problem_pods_forced
    ));
    if summary.rate_limit_assumed > 0 {
        block.push_str(&format!(
            "• Deletions assumed on rate limit: {}\n",
            summary.rate_limit_assumed
        ));
    }
    if summary.error_total() > 0 {
        block.push_str(&format!("• Errors recorded: {}\n", summary.error_total()));
    }

    if summary.stopped_by_safety {
        block.push('\n');
        block.push_str(&format!(
            "• Further drains blocked by safety: true ({})\n",
            summary.stop_safety_reason
        ));
    }

    if !summary.top_error_reasons.is_empty() {
        block.push('\n');
        block.push_str(&format!(
            "• Top error reasons: {}\n",
            summary.top_error_reasons.join(", ")
        ));
    }

    block
}
