//! Typed cluster operations behind a seam so the drain flow can be
//! exercised against an in-memory double.
//!
//! Errors stay `kube::Error` end to end: the eviction engine classifies
//! failures by HTTP status code and API message.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::{Api, DeleteParams, EvictParams, ListParams, PropagationPolicy};
use tracing::{debug, info};

/// Label Karpenter puts on every node it provisions.
pub const NODEPOOL_LABEL: &str = "karpenter.sh/nodepool";

#[async_trait]
pub trait ClusterOps: Send + Sync {
    /// Nodes carrying the nodepool label.
    async fn list_nodepool_nodes(&self, nodepool: &str) -> kube::Result<Vec<Node>>;

    /// Mark a node unschedulable. A no-op when it already is.
    async fn cordon_node(&self, name: &str) -> kube::Result<()>;

    /// Pods scheduled on the node that have not finished yet.
    async fn list_node_pods(&self, node_name: &str) -> kube::Result<Vec<Pod>>;

    async fn get_pod(&self, namespace: &str, name: &str) -> kube::Result<Pod>;

    /// Create an Eviction on the pod's eviction subresource. The API server
    /// enforces PodDisruptionBudgets and answers 429 when one would be
    /// violated.
    async fn evict_pod(&self, namespace: &str, name: &str, grace_seconds: u32)
        -> kube::Result<()>;

    async fn delete_pod(&self, namespace: &str, name: &str, grace_seconds: u32)
        -> kube::Result<()>;

    async fn list_pdbs(&self, namespace: &str) -> kube::Result<Vec<PodDisruptionBudget>>;
}

/// Production implementation over a `kube::Client`.
pub struct KubeCluster {
    client: kube::Client,
}

impl KubeCluster {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }
}

fn orphan_delete_params(grace_seconds: u32) -> DeleteParams {
    DeleteParams {
        grace_period_seconds: Some(grace_seconds),
        propagation_policy: Some(PropagationPolicy::Orphan),
        ..Default::default()
    }
}

#[async_trait]
impl ClusterOps for KubeCluster {
    async fn list_nodepool_nodes(&self, nodepool: &str) -> kube::Result<Vec<Node>> {
        let selector = format!("{NODEPOOL_LABEL}={nodepool}");
        let list = self
            .nodes()
            .list(&ListParams::default().labels(&selector))
            .await?;
        Ok(list.items)
    }

    async fn cordon_node(&self, name: &str) -> kube::Result<()> {
        let nodes = self.nodes();
        let node = nodes.get(name).await?;
        let unschedulable = node
            .spec
            .as_ref()
            .and_then(|s| s.unschedulable)
            .unwrap_or(false);
        if unschedulable {
            debug!(node = name, "node already unschedulable, skipping cordon");
            return Ok(());
        }
        nodes.cordon(name).await?;
        info!(node = name, "node cordoned");
        Ok(())
    }

    async fn list_node_pods(&self, node_name: &str) -> kube::Result<Vec<Pod>> {
        let selector =
            format!("spec.nodeName={node_name},status.phase!=Succeeded,status.phase!=Failed");
        let pods: Api<Pod> = Api::all(self.client.clone());
        let list = pods.list(&ListParams::default().fields(&selector)).await?;
        Ok(list.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> kube::Result<Pod> {
        self.pods(namespace).get(name).await
    }

    async fn evict_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_seconds: u32,
    ) -> kube::Result<()> {
        let params = EvictParams {
            delete_options: Some(orphan_delete_params(grace_seconds)),
            ..Default::default()
        };
        self.pods(namespace).evict(name, &params).await?;
        Ok(())
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_seconds: u32,
    ) -> kube::Result<()> {
        self.pods(namespace)
            .delete(name, &orphan_delete_params(grace_seconds))
            .await?;
        Ok(())
    }

    async fn list_pdbs(&self, namespace: &str) -> kube::Result<Vec<PodDisruptionBudget>> {
        let api: Api<PodDisruptionBudget> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items)
    }
}
