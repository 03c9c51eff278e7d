//! Pod eviction: the per-node engine and PDB token pacing.

pub mod engine;
pub mod token;
