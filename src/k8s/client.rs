//! Kubernetes client construction for local and in-cluster modes.

use anyhow::Result;
use tracing::debug;

use crate::error::KndError;

/// Build a Kubernetes client.
///
/// `local` reads the active kubeconfig (the right mode for workstations and
/// CI runners); `cluster` uses the in-cluster service account.
pub async fn build_client(mode: &str) -> Result<kube::Client> {
    match mode {
        "local" | "github_action" => {
            debug!("building Kubernetes client from kubeconfig");
            let client = kube::Client::try_default()
                .await
                .map_err(|e| KndError::Kubeconfig(e.to_string()))?;
            Ok(client)
        }
        "cluster" => {
            debug!("building in-cluster Kubernetes client");
            let config =
                kube::Config::incluster().map_err(|e| KndError::Kubeconfig(e.to_string()))?;
            let client =
                kube::Client::try_from(config).map_err(|e| KndError::Kubeconfig(e.to_string()))?;
            Ok(client)
        }
        other => {
            Err(KndError::InvalidConfig(format!("unknown kube-config mode: {other}")).into())
        }
    }
}
