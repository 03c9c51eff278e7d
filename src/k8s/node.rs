//! Node candidate helpers.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;

use crate::k8s::cluster::NODEPOOL_LABEL;

pub const INSTANCE_TYPE_LABEL: &str = "beta.kubernetes.io/instance-type";

/// Order candidates oldest first. Nodes without a creation timestamp sort
/// to the front.
pub fn sort_by_creation(nodes: &mut [Node]) {
    nodes.sort_by_key(|n| creation_time(n).unwrap_or(DateTime::<Utc>::MIN_UTC));
}

pub fn creation_time(node: &Node) -> Option<DateTime<Utc>> {
    node.metadata.creation_timestamp.as_ref().map(|t| t.0)
}

pub fn age_rfc3339(node: &Node) -> String {
    creation_time(node)
        .map(|t| t.to_rfc3339())
        .unwrap_or_default()
}

pub fn instance_type(node: &Node) -> String {
    node.labels()
        .get(INSTANCE_TYPE_LABEL)
        .cloned()
        .unwrap_or_default()
}

pub fn nodepool(node: &Node) -> Option<&str> {
    node.labels().get(NODEPOOL_LABEL).map(|s| s.trim())
}
