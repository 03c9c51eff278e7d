//! CLI configuration and argument parsing.
//!
//! Flags parse straight into typed structs handed to the coordinator and the
//! eviction engine. Bad values are configuration errors and never start a
//! run.

use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand};

use crate::drain::policy::{DrainPolicy, DrainPolicyOptions, DrainRounding, StepRule};
use crate::error::KndError;
use crate::evict::engine::{EvictionConfig, EvictionMode};

/// Karpenter nodepool drain CLI tool.
///
/// Reads cluster allocation pressure, derives a drain budget, cordons the
/// oldest nodes, and evicts their non-critical pods while honoring
/// PodDisruptionBudgets.
#[derive(Parser, Debug, Clone)]
#[command(name = "knd")]
#[command(about = "Karpenter nodepool drain CLI tool")]
#[command(version)]
pub struct Args {
    /// Prometheus server address
    #[arg(
        long,
        global = true,
        default_value = "http://localhost:8080/prometheus",
        env = "PROMETHEUS_ADDRESS"
    )]
    pub prometheus_address: String,

    /// Organization ID sent as X-Scope-OrgID on every Prometheus request
    #[arg(
        long,
        global = true,
        default_value = "organization-dev",
        env = "PROMETHEUS_SCOPE_ORG_ID"
    )]
    pub prometheus_org_id: String,

    /// Slack webhook URL for run notifications (disabled when empty)
    #[arg(long, global = true, default_value = "", env = "SLACK_WEBHOOK_URL")]
    pub slack_webhook_url: String,

    /// Kubernetes client mode (local|cluster)
    #[arg(long, global = true, default_value = "local", env = "KUBE_CONFIG")]
    pub kube_config: String,

    /// Cluster name used in notifications
    #[arg(long, global = true, default_value = "", env = "CLUSTER_NAME")]
    pub cluster_name: String,

    /// Karpenter nodepool to operate on
    #[arg(long, global = true, env = "NODEPOOL_NAME")]
    pub nodepool_name: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "KND_LOG_LEVEL")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Cordon the oldest nodes within the drain budget and evict their pods
    Drain(DrainArgs),

    /// Karpenter metrics lookups
    #[command(subcommand)]
    Karpenter(KarpenterCommand),
}

#[derive(Subcommand, Debug, Clone)]
pub enum KarpenterCommand {
    /// Show current memory/cpu allocate rates for the nodepool
    AllocateRate,
}

#[derive(clap::Args, Debug, Clone)]
pub struct DrainArgs {
    /// Drain policy (formula|step)
    #[arg(long, default_value = "formula")]
    pub drain_policy: String,

    /// Rounding for the formula policy (floor|round|ceil)
    #[arg(long, default_value = "floor")]
    pub drain_rounding: String,

    /// Minimum drain count once a drain is decided (0 disables)
    #[arg(long, default_value_t = 0)]
    pub drain_min: usize,

    /// Absolute cap on drained nodes (0 disables)
    #[arg(long, default_value_t = 0)]
    pub drain_max_absolute: usize,

    /// Fractional cap on drained nodes, e.g. 0.2 for 20% (0 disables)
    #[arg(long, default_value_t = 0.0)]
    pub drain_max_fraction: f64,

    /// Step policy rules, e.g. "80:1,60:2" (semicolons also accepted)
    #[arg(long, default_value = "")]
    pub drain_step_rules: String,

    /// Block the run when maxAllocateRate reaches this value (0 disables)
    #[arg(long, default_value_t = 0)]
    pub drain_safety_max_allocate_rate: i64,

    /// Safety queries, separated by semicolons or newlines; any sample > 0
    /// blocks the run
    #[arg(long, default_value = "")]
    pub drain_safety_queries: String,

    /// Treat safety query failures as blocking
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub drain_safety_fail_closed: bool,

    /// Re-evaluate safety conditions after each drained node
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub drain_progressive: bool,

    /// Pod removal mode (evict|delete); evict uses the eviction subresource
    #[arg(long, default_value = "evict")]
    pub pod_eviction_mode: String,

    /// Fall back to delete when eviction retries are exhausted
    #[arg(long)]
    pub force: bool,

    /// Immediately delete (grace=0) pods stuck in a broken state
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub force_problem_pods: bool,

    /// Pace pods matching the same PDB through a shared token
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub pdb_token: bool,

    /// Concurrent holders per PDB token
    #[arg(long, default_value_t = 1)]
    pub pdb_token_max_in_flight: usize,

    /// Maximum pods removed concurrently per node
    #[arg(long, default_value_t = 30)]
    pub pod_max_concurrent: usize,

    /// Maximum removal attempts per pod
    #[arg(long, default_value_t = 3)]
    pub pod_max_retries: u32,

    /// Backoff between removal attempts (e.g. 10s)
    #[arg(long, default_value = "10s")]
    pub pod_retry_backoff: String,

    /// How long to wait for a pod to disappear after removal (e.g. 2m)
    #[arg(long, default_value = "2m")]
    pub pod_deletion_timeout: String,

    /// Poll interval while waiting on pod deletion (e.g. 20s)
    #[arg(long, default_value = "20s")]
    pub pod_check_interval: String,

    /// Pause after each drained node so the autoscaler can observe the
    /// removal (e.g. 50s)
    #[arg(long, default_value = "50s")]
    pub settle_delay: String,
}

/// Cluster-wide settings shared by every subcommand.
#[derive(Debug, Clone)]
pub struct Settings {
    pub prometheus_address: String,
    pub prometheus_org_id: String,
    pub slack_webhook_url: Option<String>,
    pub kube_config: String,
    pub cluster_name: String,
    pub nodepool_name: String,
}

impl Settings {
    pub fn from_args(args: &Args) -> Result<Self, KndError> {
        let nodepool_name = args
            .nodepool_name
            .clone()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| KndError::InvalidConfig("--nodepool-name is required".to_string()))?;

        Ok(Self {
            prometheus_address: args.prometheus_address.clone(),
            prometheus_org_id: args.prometheus_org_id.clone(),
            slack_webhook_url: Some(args.slack_webhook_url.clone()).filter(|s| !s.is_empty()),
            kube_config: args.kube_config.clone(),
            cluster_name: args.cluster_name.clone(),
            nodepool_name,
        })
    }
}

/// Typed configuration for one drain run.
#[derive(Debug, Clone)]
pub struct DrainRunConfig {
    pub policy: DrainPolicyOptions,
    pub eviction: EvictionConfig,
    pub progressive: bool,
    pub settle_delay: Duration,
}

impl DrainRunConfig {
    pub fn from_args(args: &DrainArgs) -> Result<Self, KndError> {
        if !(0.0..=1.0).contains(&args.drain_max_fraction) {
            return Err(KndError::InvalidConfig(format!(
                "--drain-max-fraction must be within [0, 1], got {}",
                args.drain_max_fraction
            )));
        }
        if args.drain_safety_max_allocate_rate < 0 {
            return Err(KndError::InvalidConfig(
                "--drain-safety-max-allocate-rate must be >= 0".to_string(),
            ));
        }

        let policy = DrainPolicyOptions {
            policy: DrainPolicy::parse(&args.drain_policy)?,
            rounding: DrainRounding::parse(&args.drain_rounding)?,
            min_drain: args.drain_min,
            max_drain_absolute: args.drain_max_absolute,
            max_drain_fraction: args.drain_max_fraction,
            step_rules: parse_step_rules(&args.drain_step_rules)?,
            safety_max_allocate_rate: args.drain_safety_max_allocate_rate,
            safety_queries: split_queries(&args.drain_safety_queries),
            safety_fail_closed: args.drain_safety_fail_closed,
        };

        let eviction = EvictionConfig {
            mode: EvictionMode::parse(&args.pod_eviction_mode)?,
            force: args.force,
            force_problem_pods: args.force_problem_pods,
            pdb_token: args.pdb_token,
            pdb_token_max_in_flight: args.pdb_token_max_in_flight,
            max_concurrent: args.pod_max_concurrent,
            max_retries: args.pod_max_retries,
            retry_backoff: parse_duration(&args.pod_retry_backoff)?,
            deletion_timeout: parse_duration(&args.pod_deletion_timeout)?,
            check_interval: parse_duration(&args.pod_check_interval)?,
            ..Default::default()
        }
        .clamped();

        Ok(Self {
            policy,
            eviction,
            progressive: args.drain_progressive,
            settle_delay: parse_duration(&args.settle_delay)?,
        })
    }
}

/// Parse `"thr:cnt,thr:cnt"` (commas or semicolons) into rules sorted
/// ascending by threshold.
pub fn parse_step_rules(s: &str) -> Result<Vec<StepRule>, KndError> {
    let normalized = s.replace(';', ",");
    let mut rules = Vec::new();

    for part in normalized.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let Some((threshold, count)) = part.split_once(':') else {
            return Err(KndError::InvalidConfig(format!("invalid step rule: {part:?}")));
        };
        let max_allocate_rate: i64 = threshold
            .trim()
            .parse()
            .map_err(|_| KndError::InvalidConfig(format!("invalid threshold: {threshold:?}")))?;
        let drain_count: i64 = count
            .trim()
            .parse()
            .map_err(|_| KndError::InvalidConfig(format!("invalid drain count: {count:?}")))?;
        rules.push(StepRule {
            max_allocate_rate,
            drain_count,
        });
    }

    rules.sort_by_key(|r| r.max_allocate_rate);
    Ok(rules)
}

/// Split on semicolons and newlines, dropping empty entries.
pub fn split_queries(s: &str) -> Vec<String> {
    s.replace('\n', ";")
        .split(';')
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(String::from)
        .collect()
}

/// Parse durations like `10s`, `2m`, `500ms`, or compound `1h30m`.
pub fn parse_duration(s: &str) -> Result<Duration, KndError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(KndError::InvalidConfig("empty duration".to_string()));
    }

    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut unit = String::new();

    for ch in s.chars() {
        if ch.is_ascii_digit() {
            if !unit.is_empty() {
                total += duration_segment(s, &digits, &unit)?;
                digits.clear();
                unit.clear();
            }
            digits.push(ch);
        } else if ch.is_ascii_alphabetic() {
            if digits.is_empty() {
                return Err(KndError::InvalidConfig(format!("invalid duration: {s:?}")));
            }
            unit.push(ch);
        } else {
            return Err(KndError::InvalidConfig(format!("invalid duration: {s:?}")));
        }
    }

    total += duration_segment(s, &digits, &unit)?;
    Ok(total)
}

fn duration_segment(input: &str, digits: &str, unit: &str) -> Result<Duration, KndError> {
    let value: u64 = digits
        .parse()
        .map_err(|_| KndError::InvalidConfig(format!("invalid duration: {input:?}")))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(KndError::InvalidConfig(format!(
            "invalid duration unit in {input:?}"
        ))),
    }
}
