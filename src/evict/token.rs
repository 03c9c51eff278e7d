//! Per-PDB eviction tokens.
//!
//! Pods matching the same PodDisruptionBudget are paced through a counting
//! semaphore per `namespace/name` key, so the engine does not fire a burst
//! of evictions at a budget that can only absorb a few. A pod matching
//! several PDBs takes every token in ascending key order; the total order
//! rules out deadlock between workers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub struct PdbTokenManager {
    max_in_flight: usize,
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

/// Held tokens. Dropping the guard releases the permits in reverse
/// acquisition order on every exit path, panics included.
pub struct TokenGuard {
    permits: Vec<(String, OwnedSemaphorePermit)>,
}

impl TokenGuard {
    pub fn keys(&self) -> Vec<&str> {
        self.permits.iter().map(|(k, _)| k.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.permits.is_empty()
    }
}

impl Drop for TokenGuard {
    fn drop(&mut self) {
        while self.permits.pop().is_some() {}
    }
}

impl PdbTokenManager {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            max_in_flight: max_in_flight.max(1),
            semaphores: Mutex::new(HashMap::new()),
        }
    }

    fn semaphore(&self, key: &str) -> Arc<Semaphore> {
        let mut semaphores = self.semaphores.lock().unwrap();
        semaphores
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_in_flight)))
            .clone()
    }

    /// Acquire tokens for all keys, sorted and deduplicated first.
    pub async fn acquire(&self, keys: &[String]) -> TokenGuard {
        let mut sorted: Vec<String> = keys.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut permits = Vec::with_capacity(sorted.len());
        for key in sorted {
            let semaphore = self.semaphore(&key);
            let permit = semaphore
                .acquire_owned()
                .await
                .expect("PDB token semaphore closed");
            permits.push((key, permit));
        }
        TokenGuard { permits }
    }
}
