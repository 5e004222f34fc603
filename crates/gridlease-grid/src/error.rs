//! Grid error types.

use thiserror::Error;

use crate::types::ContractId;

/// Errors reported by a grid client.
#[derive(Debug, Error)]
pub enum GridError {
    #[error("grid request failed: {0}")]
    Request(String),

    #[error("insufficient capacity on node {node_id}: {reason}")]
    Capacity { node_id: u32, reason: String },

    #[error("network not found: {0}")]
    NetworkNotFound(String),

    #[error("workload not found: {0}")]
    WorkloadNotFound(String),

    #[error("contract not found: {0}")]
    ContractNotFound(ContractId),
}

pub type GridResult<T> = Result<T, GridError>;
