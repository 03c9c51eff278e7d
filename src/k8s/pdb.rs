//! Namespace-scoped PodDisruptionBudget snapshots with a shared TTL cache.
//!
//! The cache keeps one snapshot list per namespace behind an RwLock. The
//! freshness timestamp is per cache, not per namespace: refreshing any
//! namespace extends the whole cache. Within the TTL every reader sees the
//! same snapshot for a namespace.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use tokio::sync::RwLock;

use crate::k8s::cluster::ClusterOps;

pub const DEFAULT_PDB_CACHE_TTL: Duration = Duration::from_secs(30);

/// The slice of a PDB the eviction flow needs.
#[derive(Debug, Clone)]
pub struct PdbEntry {
    pub name: String,
    pub selector: Option<LabelSelector>,
    pub disruptions_allowed: i32,
}

#[derive(Default)]
struct CacheState {
    loaded_at: Option<Instant>,
    by_namespace: HashMap<String, Vec<PdbEntry>>,
}

pub struct PdbCache {
    ttl: Duration,
    state: RwLock<CacheState>,
}

impl PdbCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: RwLock::new(CacheState::default()),
        }
    }

    /// Snapshot of the namespace's PDBs, served from cache within the TTL.
    /// Readers share the read lock; a miss upgrades to the write lock and
    /// re-checks before issuing a single list call.
    pub async fn namespace_pdbs(
        &self,
        cluster: &dyn ClusterOps,
        namespace: &str,
    ) -> kube::Result<Vec<PdbEntry>> {
        {
            let state = self.state.read().await;
            if let Some(entries) = fresh_entries(&state, self.ttl, namespace) {
                return Ok(entries);
            }
        }

        let mut state = self.state.write().await;
        if let Some(entries) = fresh_entries(&state, self.ttl, namespace) {
            return Ok(entries);
        }

        let pdbs = cluster.list_pdbs(namespace).await?;
        let entries: Vec<PdbEntry> = pdbs.iter().map(pdb_entry).collect();
        state
            .by_namespace
            .insert(namespace.to_string(), entries.clone());
        state.loaded_at = Some(Instant::now());
        Ok(entries)
    }
}

fn fresh_entries(state: &CacheState, ttl: Duration, namespace: &str) -> Option<Vec<PdbEntry>> {
    let loaded_at = state.loaded_at?;
    if loaded_at.elapsed() >= ttl {
        return None;
    }
    state.by_namespace.get(namespace).cloned()
}

fn pdb_entry(pdb: &PodDisruptionBudget) -> PdbEntry {
    PdbEntry {
        name: pdb.metadata.name.clone().unwrap_or_default(),
        selector: pdb.spec.as_ref().and_then(|s| s.selector.clone()),
        disruptions_allowed: pdb
            .status
            .as_ref()
            .map(|s| s.disruptions_allowed)
            .unwrap_or(0),
    }
}

/// Token keys (`namespace/name`) of the PDBs whose selector matches the
/// pod's labels.
pub fn matching_pdb_keys(
    namespace: &str,
    labels: &BTreeMap<String, String>,
    entries: &[PdbEntry],
) -> Vec<String> {
    entries
        .iter()
        .filter(|e| selector_matches(e.selector.as_ref(), labels))
        .map(|e| format!("{namespace}/{}", e.name))
        .collect()
}

/// Standard Kubernetes label-selector semantics: an absent selector matches
/// nothing, an empty selector matches everything.
pub fn selector_matches(selector: Option<&LabelSelector>, labels: &BTreeMap<String, String>) -> bool {
    let Some(selector) = selector else {
        return false;
    };

    if let Some(match_labels) = &selector.match_labels {
        for (key, value) in match_labels {
            if labels.get(key) != Some(value) {
                return false;
            }
        }
    }

    if let Some(expressions) = &selector.match_expressions {
        for expr in expressions {
            let value = labels.get(&expr.key);
            let values: &[String] = expr.values.as_deref().unwrap_or(&[]);
            let satisfied = match expr.operator.as_str() {
                "In" => value.map(|v| values.contains(v)).unwrap_or(false),
                "NotIn" => value.map(|v| !values.contains(v)).unwrap_or(true),
                "Exists" => value.is_some(),
                "DoesNotExist" => value.is_none(),
                _ => false,
            };
            if !satisfied {
                return false;
            }
        }
    }

    true
}
