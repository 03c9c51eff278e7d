//! Karpenter allocation metrics from Prometheus.
//!
//! The allocate rate per resource type is
//! `round(podRequest / nodepoolUsage * 100)`, both sides read from the
//! Karpenter exporter series for the nodepool.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use tracing::{debug, warn};

const QUERY_TIMEOUT: Duration = Duration::from_secs(30);
const ORG_ID_HEADER: &str = "X-Scope-OrgID";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Memory,
    Cpu,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Memory => "memory",
            ResourceType::Cpu => "cpu",
        }
    }
}

/// One labeled sample of an instant-query vector.
#[derive(Debug, Clone)]
pub struct Sample {
    pub metric: HashMap<String, String>,
    pub value: f64,
}

/// Metrics gateway seam. The production implementation is [`PromClient`];
/// tests drive the planner and coordinator with an in-memory source.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn query(&self, expr: &str) -> Result<Vec<Sample>>;

    async fn allocate_rate(&self, nodepool: &str, resource: ResourceType) -> Result<i64>;
}

/// Prometheus instant-query client. Every request carries the organization
/// scope header and the 30 second query deadline.
pub struct PromClient {
    address: String,
    http: reqwest::Client,
}

impl PromClient {
    pub fn new(address: &str, org_id: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ORG_ID_HEADER,
            HeaderValue::from_str(org_id).context("invalid Prometheus org id")?,
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(QUERY_TIMEOUT)
            .build()
            .context("failed to build Prometheus HTTP client")?;
        Ok(Self {
            address: address.trim_end_matches('/').to_string(),
            http,
        })
    }

    /// Total allocatable capacity of the nodepool, in whole GB or vCPU.
    pub async fn nodes_allocatable(
        &self,
        nodepool: &str,
        resource: ResourceType,
    ) -> Result<i64> {
        self.usage_value(&allocatable_query(nodepool, resource), resource)
            .await
    }

    async fn query_vector(&self, expr: &str) -> Result<Vec<Sample>> {
        debug!(query = expr, "querying Prometheus");
        let url = format!("{}/api/v1/query", self.address);
        let response = self
            .http
            .get(&url)
            .query(&[("query", expr)])
            .send()
            .await
            .context("Prometheus request failed")?;
        let status = response.status();
        let body = response
            .text()
            .await
            .context("failed to read Prometheus response")?;
        if !status.is_success() {
            bail!("Prometheus returned {status}: {body}");
        }
        parse_query_response(&body)
    }

    async fn usage_value(&self, expr: &str, resource: ResourceType) -> Result<i64> {
        let samples = self.query_vector(expr).await?;
        Ok(parse_usage_samples(&samples, resource))
    }
}

#[async_trait]
impl MetricsSource for PromClient {
    async fn query(&self, expr: &str) -> Result<Vec<Sample>> {
        self.query_vector(expr).await
    }

    async fn allocate_rate(&self, nodepool: &str, resource: ResourceType) -> Result<i64> {
        let usage = self
            .usage_value(&nodepool_usage_query(nodepool, resource), resource)
            .await
            .context("failed to read nodepool usage")?;
        let request = self
            .usage_value(&pod_request_query(nodepool, resource), resource)
            .await
            .context("failed to read pod requests")?;

        match resource {
            ResourceType::Memory => {
                debug!(nodepool_usage_gb = usage, pod_request_gb = request, "Karpenter memory")
            }
            ResourceType::Cpu => {
                debug!(nodepool_usage_vcpu = usage, pod_request_vcpu = request, "Karpenter cpu")
            }
        }

        compute_allocate_rate(request, usage)
    }
}

fn allocatable_query(nodepool: &str, resource: ResourceType) -> String {
    format!(
        "sum(karpenter_nodes_allocatable{{nodepool='{nodepool}', resource_type='{resource}'}})",
        resource = resource.as_str()
    )
}

fn pod_request_query(nodepool: &str, resource: ResourceType) -> String {
    let resource = resource.as_str();
    format!(
        "sum(karpenter_nodes_total_pod_requests{{nodepool='{nodepool}',resource_type='{resource}'}} \
         + karpenter_nodes_total_daemon_requests{{nodepool='{nodepool}',resource_type='{resource}'}})"
    )
}

fn nodepool_usage_query(nodepool: &str, resource: ResourceType) -> String {
    format!(
        "karpenter_nodepool_usage{{nodepool='{nodepool}', resource_type='{resource}'}}",
        resource = resource.as_str()
    )
}

fn compute_allocate_rate(pod_request: i64, nodepool_usage: i64) -> Result<i64> {
    if nodepool_usage == 0 {
        bail!("nodepool usage is zero, cannot compute allocate rate");
    }
    Ok((pod_request as f64 / nodepool_usage as f64 * 100.0).round() as i64)
}

/// Memory comes back in bytes and is floored to whole GB; cpu is floored to
/// whole vCPU. An empty vector reads as zero.
fn parse_usage_samples(samples: &[Sample], resource: ResourceType) -> i64 {
    let Some(sample) = samples.first() else {
        return 0;
    };
    match resource {
        ResourceType::Memory => (sample.value as i64) / 1_000_000_000,
        ResourceType::Cpu => sample.value as i64,
    }
}

fn parse_query_response(body: &str) -> Result<Vec<Sample>> {
    #[derive(Deserialize)]
    struct Envelope {
        status: String,
        #[serde(default)]
        warnings: Vec<String>,
        #[serde(default)]
        error: Option<String>,
        data: Option<Data>,
    }

    #[derive(Deserialize)]
    struct Data {
        #[serde(rename = "resultType")]
        result_type: String,
        result: Vec<VectorSample>,
    }

    #[derive(Deserialize)]
    struct VectorSample {
        #[serde(default)]
        metric: HashMap<String, String>,
        value: (f64, String),
    }

    let envelope: Envelope =
        serde_json::from_str(body).context("unexpected Prometheus response body")?;

    if !envelope.warnings.is_empty() {
        warn!(warnings = ?envelope.warnings, "Prometheus query returned warnings");
    }
    if envelope.status != "success" {
        bail!(
            "Prometheus query failed: {}",
            envelope.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }

    let data = envelope.data.context("Prometheus response missing data")?;
    if data.result_type != "vector" {
        bail!("unexpected result type from Prometheus: {}", data.result_type);
    }

    data.result
        .into_iter()
        .map(|s| {
            let value = s
                .value
                .1
                .parse::<f64>()
                .context("unparseable sample value")?;
            Ok(Sample {
                metric: s.metric,
                value,
            })
        })
        .collect()
}
