//! Kubernetes gateway: client construction, typed cluster operations,
//! node/pod helpers, and the PDB snapshot cache.

pub mod client;
pub mod cluster;
#[cfg(test)]
pub mod fake;
pub mod node;
pub mod pdb;
pub mod pod;
