//! Store error definitions.

use thiserror::Error;

use crate::store::kv::KvError;

/// Errors raised by resource caches and config stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The cache prefix does not name a known resource type.
    #[error("no resource type matches prefix {0}")]
    UnknownResourceType(String),

    /// Fewer than all resource caches came up.
    #[error("only {initialized} of 4 resource caches initialized")]
    IncompleteCaches { initialized: usize },

    #[error("kv store error: {0}")]
    Kv(#[from] KvError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// One or more stages could not be altered this cycle.
    #[error("failed to alter stages: {}", stages.join(", "))]
    StagesFailed { stages: Vec<String> },
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
