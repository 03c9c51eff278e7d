//! In-memory cluster and metrics doubles for exercising the drain flow.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Pod, PodSpec, PodStatus};
use k8s_openapi::api::policy::v1::{
    PodDisruptionBudget, PodDisruptionBudgetSpec, PodDisruptionBudgetStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
use kube::core::ErrorResponse;
use kube::ResourceExt;

use crate::k8s::cluster::{ClusterOps, NODEPOOL_LABEL};
use crate::k8s::node::INSTANCE_TYPE_LABEL;
use crate::karpenter::{MetricsSource, ResourceType, Sample};

pub fn api_error(code: u16, message: &str) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: String::new(),
        code,
    })
}

pub fn not_found_error(name: &str) -> kube::Error {
    api_error(404, &format!("pods \"{name}\" not found"))
}

pub fn test_node(name: &str, nodepool: &str, created: DateTime<Utc>) -> Node {
    let mut node = Node::default();
    node.metadata.name = Some(name.to_string());
    node.metadata.creation_timestamp = Some(Time(created));
    node.metadata.labels = Some(BTreeMap::from([
        (NODEPOOL_LABEL.to_string(), nodepool.to_string()),
        (INSTANCE_TYPE_LABEL.to_string(), "m5.large".to_string()),
    ]));
    node
}

pub fn test_pod(namespace: &str, name: &str, node: &str) -> Pod {
    let mut pod = Pod::default();
    pod.metadata.name = Some(name.to_string());
    pod.metadata.namespace = Some(namespace.to_string());
    pod.metadata.creation_timestamp = Some(Time(Utc::now()));
    pod.spec = Some(PodSpec {
        node_name: Some(node.to_string()),
        ..Default::default()
    });
    pod.status = Some(PodStatus {
        phase: Some("Running".to_string()),
        ..Default::default()
    });
    pod
}

pub fn with_pod_labels(mut pod: Pod, labels: &[(&str, &str)]) -> Pod {
    pod.metadata.labels = Some(
        labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    );
    pod
}

pub fn test_pdb(
    namespace: &str,
    name: &str,
    match_labels: &[(&str, &str)],
    disruptions_allowed: i32,
) -> PodDisruptionBudget {
    let mut pdb = PodDisruptionBudget::default();
    pdb.metadata.name = Some(name.to_string());
    pdb.metadata.namespace = Some(namespace.to_string());
    pdb.spec = Some(PodDisruptionBudgetSpec {
        selector: Some(LabelSelector {
            match_labels: Some(
                match_labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    });
    pdb.status = Some(PodDisruptionBudgetStatus {
        disruptions_allowed,
        ..Default::default()
    });
    pdb
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeCall {
    ListNodes(String),
    Cordon(String),
    ListPods(String),
    GetPod(String),
    Evict { pod: String, grace: u32 },
    Delete { pod: String, grace: u32 },
    ListPdbs(String),
}

/// Scripted failure: `(code, message)` turned into a `kube::Error::Api`.
pub type FakeFailure = (u16, String);

#[derive(Default)]
pub struct FakeCluster {
    pub nodes: Mutex<Vec<Node>>,
    pub pods: Mutex<Vec<Pod>>,
    pub pdbs: Mutex<Vec<PodDisruptionBudget>>,
    pub calls: Mutex<Vec<FakeCall>>,
    /// Per-pod eviction failures returned on every attempt.
    pub evict_failures: Mutex<HashMap<String, FakeFailure>>,
    /// Per-pod delete failures returned on every attempt.
    pub delete_failures: Mutex<HashMap<String, FakeFailure>>,
    /// Extra latency inside evict/delete, to widen overlap windows.
    pub removal_delay: Mutex<Option<Duration>>,
    pub active_removals: AtomicUsize,
    pub max_active_removals: AtomicUsize,
}

impl FakeCluster {
    pub fn fail_evictions(&self, pod: &str, code: u16, message: &str) {
        self.evict_failures
            .lock()
            .unwrap()
            .insert(pod.to_string(), (code, message.to_string()));
    }

    pub fn fail_deletes(&self, pod: &str, code: u16, message: &str) {
        self.delete_failures
            .lock()
            .unwrap()
            .insert(pod.to_string(), (code, message.to_string()));
    }

    pub fn set_removal_delay(&self, delay: Duration) {
        *self.removal_delay.lock().unwrap() = Some(delay);
    }

    pub fn cordoned_nodes(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                FakeCall::Cordon(name) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn removal_calls(&self) -> Vec<FakeCall> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| matches!(c, FakeCall::Evict { .. } | FakeCall::Delete { .. }))
            .cloned()
            .collect()
    }

    fn record(&self, call: FakeCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn remove_pod(&self, namespace: &str, name: &str) -> bool {
        let mut pods = self.pods.lock().unwrap();
        let before = pods.len();
        pods.retain(|p| {
            !(p.name_any() == name && p.namespace().as_deref() == Some(namespace))
        });
        pods.len() != before
    }

    fn find_pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.pods
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.name_any() == name && p.namespace().as_deref() == Some(namespace))
            .cloned()
    }

    async fn removal_window(&self) {
        let active = self.active_removals.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_removals.fetch_max(active, Ordering::SeqCst);
        let delay = *self.removal_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn removal_done(&self) {
        self.active_removals.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClusterOps for FakeCluster {
    async fn list_nodepool_nodes(&self, nodepool: &str) -> kube::Result<Vec<Node>> {
        self.record(FakeCall::ListNodes(nodepool.to_string()));
        Ok(self
            .nodes
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.labels().get(NODEPOOL_LABEL).map(String::as_str) == Some(nodepool))
            .cloned()
            .collect())
    }

    async fn cordon_node(&self, name: &str) -> kube::Result<()> {
        self.record(FakeCall::Cordon(name.to_string()));
        let mut nodes = self.nodes.lock().unwrap();
        let Some(node) = nodes.iter_mut().find(|n| n.name_any() == name) else {
            return Err(api_error(404, &format!("nodes \"{name}\" not found")));
        };
        let mut spec = node.spec.clone().unwrap_or_default();
        spec.unschedulable = Some(true);
        node.spec = Some(spec);
        Ok(())
    }

    async fn list_node_pods(&self, node_name: &str) -> kube::Result<Vec<Pod>> {
        self.record(FakeCall::ListPods(node_name.to_string()));
        Ok(self
            .pods
            .lock()
            .unwrap()
            .iter()
            .filter(|p| {
                let on_node = p
                    .spec
                    .as_ref()
                    .and_then(|s| s.node_name.as_deref())
                    == Some(node_name);
                let phase = p.status.as_ref().and_then(|s| s.phase.as_deref());
                on_node && phase != Some("Succeeded") && phase != Some("Failed")
            })
            .cloned()
            .collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> kube::Result<Pod> {
        self.record(FakeCall::GetPod(name.to_string()));
        self.find_pod(namespace, name)
            .ok_or_else(|| not_found_error(name))
    }

    async fn evict_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_seconds: u32,
    ) -> kube::Result<()> {
        self.record(FakeCall::Evict {
            pod: name.to_string(),
            grace: grace_seconds,
        });
        self.removal_window().await;
        let result = {
            let failure = self.evict_failures.lock().unwrap().get(name).cloned();
            match failure {
                Some((code, message)) => Err(api_error(code, &message)),
                None => {
                    if self.remove_pod(namespace, name) {
                        Ok(())
                    } else {
                        Err(not_found_error(name))
                    }
                }
            }
        };
        self.removal_done();
        result
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_seconds: u32,
    ) -> kube::Result<()> {
        self.record(FakeCall::Delete {
            pod: name.to_string(),
            grace: grace_seconds,
        });
        self.removal_window().await;
        let result = {
            let failure = self.delete_failures.lock().unwrap().get(name).cloned();
            match failure {
                Some((code, message)) => Err(api_error(code, &message)),
                None => {
                    if self.remove_pod(namespace, name) {
                        Ok(())
                    } else {
                        Err(not_found_error(name))
                    }
                }
            }
        };
        self.removal_done();
        result
    }

    async fn list_pdbs(&self, namespace: &str) -> kube::Result<Vec<PodDisruptionBudget>> {
        self.record(FakeCall::ListPdbs(namespace.to_string()));
        Ok(self
            .pdbs
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.namespace().as_deref() == Some(namespace))
            .cloned()
            .collect())
    }
}

/// Scripted metrics source. Successive reads consume the configured values;
/// the last one repeats.
#[derive(Default)]
pub struct FakeMetrics {
    rates: Mutex<Vec<i64>>,
    query_values: Mutex<Vec<f64>>,
    query_error: Option<String>,
    pub rate_calls: AtomicUsize,
}

impl FakeMetrics {
    pub fn with_rates(rates: Vec<i64>) -> Self {
        Self {
            rates: Mutex::new(rates),
            ..Default::default()
        }
    }

    pub fn with_query_values(values: Vec<f64>) -> Self {
        Self {
            query_values: Mutex::new(values),
            ..Default::default()
        }
    }

    pub fn with_query_error(message: &str) -> Self {
        Self {
            query_error: Some(message.to_string()),
            ..Default::default()
        }
    }
}

fn next_value<T: Copy>(values: &Mutex<Vec<T>>, default: T) -> T {
    let mut values = values.lock().unwrap();
    if values.len() > 1 {
        values.remove(0)
    } else {
        values.first().copied().unwrap_or(default)
    }
}

#[async_trait]
impl MetricsSource for FakeMetrics {
    async fn query(&self, _expr: &str) -> Result<Vec<Sample>> {
        if let Some(message) = &self.query_error {
            bail!("{message}");
        }
        let value = next_value(&self.query_values, 0.0);
        Ok(vec![Sample {
            metric: HashMap::new(),
            value,
        }])
    }

    async fn allocate_rate(&self, _nodepool: &str, _resource: ResourceType) -> Result<i64> {
        self.rate_calls.fetch_add(1, Ordering::SeqCst);
        Ok(next_value(&self.rates, 0))
    }
}
