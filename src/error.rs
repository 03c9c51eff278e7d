//! Custom error types for knd.

use thiserror::Error;

/// Errors raised before a drain run starts.
#[derive(Error, Debug)]
pub enum KndError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Kubeconfig error: {0}")]
    Kubeconfig(String),
}
