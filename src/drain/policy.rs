//! Drain budget policy and safety gates.
//!
//! The budget is how many nodes may be retired this run. The formula policy
//! eases linearly with pressure (`drainRate = (99 - maxAllocateRate) / 100`);
//! the step policy gives operator-defined plateaus. Safety gates can force
//! the budget to zero regardless of policy.

use tracing::warn;

use crate::error::KndError;
use crate::karpenter::MetricsSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainPolicy {
    Formula,
    Step,
}

impl DrainPolicy {
    pub fn parse(s: &str) -> Result<Self, KndError> {
        match s.to_lowercase().as_str() {
            "formula" => Ok(DrainPolicy::Formula),
            "step" => Ok(DrainPolicy::Step),
            other => Err(KndError::InvalidConfig(format!(
                "unknown drain policy: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainRounding {
    Floor,
    Round,
    Ceil,
}

impl DrainRounding {
    pub fn parse(s: &str) -> Result<Self, KndError> {
        match s.to_lowercase().as_str() {
            "floor" => Ok(DrainRounding::Floor),
            "round" => Ok(DrainRounding::Round),
            "ceil" => Ok(DrainRounding::Ceil),
            other => Err(KndError::InvalidConfig(format!(
                "unknown drain rounding: {other}"
            ))),
        }
    }
}

/// `drain_count` applies when the observed rate is at most
/// `max_allocate_rate`; the first matching rule in ascending order wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepRule {
    pub max_allocate_rate: i64,
    pub drain_count: i64,
}

#[derive(Debug, Clone)]
pub struct DrainPolicyOptions {
    pub policy: DrainPolicy,
    pub rounding: DrainRounding,
    /// Minimum count once a drain is decided; keeps small clusters from
    /// rounding down to zero. 0 disables.
    pub min_drain: usize,
    /// Absolute cap. 0 disables.
    pub max_drain_absolute: usize,
    /// Fractional cap in [0, 1]. 0 disables.
    pub max_drain_fraction: f64,
    pub step_rules: Vec<StepRule>,
    /// Pressure at or above this blocks the run. 0 disables.
    pub safety_max_allocate_rate: i64,
    /// Any query returning a sample > 0 blocks the run.
    pub safety_queries: Vec<String>,
    pub safety_fail_closed: bool,
}

impl Default for DrainPolicyOptions {
    fn default() -> Self {
        Self {
            policy: DrainPolicy::Formula,
            rounding: DrainRounding::Floor,
            min_drain: 0,
            max_drain_absolute: 0,
            max_drain_fraction: 0.0,
            step_rules: Vec::new(),
            safety_max_allocate_rate: 0,
            safety_queries: Vec::new(),
            safety_fail_closed: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SafetyVerdict {
    pub blocked: bool,
    pub reason: String,
}

impl SafetyVerdict {
    fn clear() -> Self {
        Self {
            blocked: false,
            reason: String::new(),
        }
    }

    fn blocked(reason: String) -> Self {
        Self {
            blocked: true,
            reason,
        }
    }
}

/// Final drain budget for this run.
pub fn calculate_drain_node_count(
    len_nodes: usize,
    max_allocate_rate: i64,
    opts: &DrainPolicyOptions,
) -> usize {
    if len_nodes == 0 {
        return 0;
    }

    let base = match opts.policy {
        DrainPolicy::Step => step_policy_count(max_allocate_rate, &opts.step_rules),
        DrainPolicy::Formula => formula_policy_count(len_nodes, max_allocate_rate, opts),
    };

    let mut base = base.min(len_nodes);

    if base > 0 && opts.min_drain > 0 && base < opts.min_drain {
        base = opts.min_drain;
    }

    base = apply_caps(len_nodes, base, opts);

    base.min(len_nodes)
}

fn formula_policy_count(len_nodes: usize, max_allocate_rate: i64, opts: &DrainPolicyOptions) -> usize {
    let drain_rate = ((99 - max_allocate_rate) as f64 / 100.0).clamp(0.0, 1.0);
    let raw = len_nodes as f64 * drain_rate;

    let mut base = match opts.rounding {
        DrainRounding::Round => raw.round(),
        DrainRounding::Ceil => raw.ceil(),
        DrainRounding::Floor => raw.floor(),
    } as usize;

    if base == 0 && drain_rate > 0.0 && opts.min_drain > 0 {
        base = opts.min_drain;
    }

    base
}

fn step_policy_count(max_allocate_rate: i64, rules: &[StepRule]) -> usize {
    for rule in rules {
        if max_allocate_rate <= rule.max_allocate_rate {
            return rule.drain_count.max(0) as usize;
        }
    }
    0
}

fn apply_caps(len_nodes: usize, base: usize, opts: &DrainPolicyOptions) -> usize {
    if base == 0 {
        return 0;
    }

    let mut cap = len_nodes;

    if opts.max_drain_fraction > 0.0 {
        // ceil keeps the fractional cap meaningful on small clusters
        let fraction_cap = (len_nodes as f64 * opts.max_drain_fraction).ceil() as usize;
        cap = cap.min(fraction_cap);
    }

    if opts.max_drain_absolute > 0 && opts.max_drain_absolute < cap {
        cap = opts.max_drain_absolute;
    }

    base.min(cap)
}

/// Pressure-threshold part of the safety gate. Separate so it stays testable
/// without a metrics source.
pub fn threshold_verdict(max_allocate_rate: i64, opts: &DrainPolicyOptions) -> Option<String> {
    if opts.safety_max_allocate_rate > 0 && max_allocate_rate >= opts.safety_max_allocate_rate {
        return Some(format!(
            "maxAllocateRate({max_allocate_rate}) >= safetyMaxAllocateRate({})",
            opts.safety_max_allocate_rate
        ));
    }
    None
}

/// Evaluate all safety gates. Query failures block when fail-closed and are
/// only warned about otherwise.
pub async fn evaluate_safety(
    max_allocate_rate: i64,
    opts: &DrainPolicyOptions,
    metrics: &dyn MetricsSource,
) -> SafetyVerdict {
    if let Some(reason) = threshold_verdict(max_allocate_rate, opts) {
        return SafetyVerdict::blocked(reason);
    }

    for query in &opts.safety_queries {
        match metrics.query(query).await {
            Ok(samples) => {
                if let Some(sample) = samples.iter().find(|s| s.value > 0.0) {
                    warn!(query = %query, value = sample.value, labels = ?sample.metric, "safety query triggered");
                    return SafetyVerdict::blocked(format!("safety query triggered: {query}"));
                }
            }
            Err(e) => {
                if opts.safety_fail_closed {
                    warn!(query = %query, error = %e, "safety query failed (fail-closed)");
                    return SafetyVerdict::blocked(format!(
                        "safety query failed (fail-closed): {query}"
                    ));
                }
                warn!(query = %query, error = %e, "safety query failed, continuing (fail-open)");
            }
        }
    }

    SafetyVerdict::clear()
}
