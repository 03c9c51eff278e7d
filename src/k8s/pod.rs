//! Pod classification for the eviction flow.

use chrono::{Duration, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

const PROBLEM_WAITING_REASONS: [&str; 3] =
    ["ImagePullBackOff", "ErrImagePull", "CrashLoopBackOff"];

/// Pods Pending longer than this are treated as stuck.
const PENDING_PROBLEM_AGE_MINUTES: i64 = 10;

pub fn namespace(pod: &Pod) -> String {
    pod.namespace().unwrap_or_else(|| "default".to_string())
}

/// Strip DaemonSet-owned pods; their controller ignores cordons, so there is
/// no point evicting them.
pub fn non_critical(pods: Vec<Pod>) -> Vec<Pod> {
    pods.into_iter().filter(|p| !is_daemon_set_pod(p)).collect()
}

pub fn is_daemon_set_pod(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .as_ref()
        .map(|refs| refs.iter().any(|r| r.kind == "DaemonSet"))
        .unwrap_or(false)
}

/// A pod is a problem pod when a container is stuck pulling or crash looping,
/// or when it has been Pending for over ten minutes.
pub fn is_problem_pod(pod: &Pod) -> bool {
    if let Some(statuses) = pod.status.as_ref().and_then(|s| s.container_statuses.as_ref()) {
        for cs in statuses {
            let waiting_reason = cs
                .state
                .as_ref()
                .and_then(|s| s.waiting.as_ref())
                .and_then(|w| w.reason.as_deref());
            if let Some(reason) = waiting_reason {
                if PROBLEM_WAITING_REASONS.contains(&reason) {
                    return true;
                }
            }
        }
    }

    if pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Pending") {
        if let Some(created) = pod.metadata.creation_timestamp.as_ref() {
            if Utc::now() - created.0 > Duration::minutes(PENDING_PROBLEM_AGE_MINUTES) {
                return true;
            }
        }
    }

    false
}

/// Batch workloads get more time to terminate. Owner kinds are authoritative;
/// the name check catches unowned one-off jobs.
pub fn is_batch_pod(pod: &Pod) -> bool {
    let batch_owner = pod
        .metadata
        .owner_references
        .as_ref()
        .map(|refs| refs.iter().any(|r| r.kind == "Job" || r.kind == "CronJob"))
        .unwrap_or(false);
    if batch_owner {
        return true;
    }

    let name = pod.name_any().to_lowercase();
    name.contains("job") || name.contains("cron") || name.contains("batch")
}
