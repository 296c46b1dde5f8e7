use thiserror::Error;

use crate::graph::config::{CollectionAddress, FieldAddress};

/// Unified error type for the engine.
///
/// Graph-construction and traversal failures are synchronous and
/// side-effect-free: nothing is logged or cached before they are returned,
/// so `validate` can be called repeatedly. Node-level failures
/// (`Retrieval` / `Masking`) are only produced after the retry budget is
/// exhausted.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A declared reference points at a collection that no merged dataset
    /// provides.
    #[error("reference target {target} declared by {declared_by} does not exist in any dataset")]
    MissingReferenceTarget {
        target: FieldAddress,
        declared_by: CollectionAddress,
    },

    /// Two datasets declare the same collection address.
    #[error("duplicate collection address {address} declared by more than one dataset")]
    DuplicateAddress { address: CollectionAddress },

    /// Nodes that no identity seed can reach.
    #[error("no traversal path to reach: {}", format_addresses(.nodes))]
    UnreachableNodes { nodes: Vec<CollectionAddress> },

    /// The reference graph contains a cycle.
    #[error("cycle detected among: {}", format_addresses(.nodes))]
    CycleDetected { nodes: Vec<CollectionAddress> },

    /// Client construction or liveness check failed for a connection.
    #[error("connection '{key}' failed: {message}")]
    Connection {
        key: String,
        message: String,
        cause: Option<anyhow::Error>,
    },

    /// No connection configuration is bound to the referenced key.
    #[error("no available connector for '{key}'")]
    ConnectorNotFound { key: String },

    /// Retrieval failed on a node after exhausting the retry budget.
    #[error("retrieval failed on {node} after {attempts} attempts")]
    Retrieval {
        node: CollectionAddress,
        attempts: u32,
        #[source]
        source: crate::connectors::ConnectorError,
    },

    /// Masking failed on a node after exhausting the retry budget.
    #[error("masking failed on {node} after {attempts} attempts")]
    Masking {
        node: CollectionAddress,
        attempts: u32,
        #[source]
        source: crate::connectors::ConnectorError,
    },

    /// Malformed policy, dataset declaration, or connection secrets.
    #[error("validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// The shared result cache failed or is unreachable.
    #[error("cache error: {message}")]
    Cache {
        message: String,
        cause: Option<anyhow::Error>,
    },

    /// The execution log sink rejected an append.
    #[error("execution log error: {message}")]
    Audit {
        message: String,
        cause: Option<anyhow::Error>,
    },

    /// The request-level deadline elapsed before the traversal finished.
    #[error("request deadline of {limit_secs}s exceeded at {node}")]
    DeadlineExceeded {
        node: CollectionAddress,
        limit_secs: u64,
    },

    /// The request was stopped between nodes.
    #[error("request cancelled")]
    Cancelled,

    #[error("serialization failed")]
    Serialization(#[from] serde_json::Error),
}

fn format_addresses(nodes: &[CollectionAddress]) -> String {
    nodes
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl EngineError {
    pub fn connection<K: Into<String>, M: Into<String>>(key: K, message: M) -> Self {
        Self::Connection {
            key: key.into(),
            message: message.into(),
            cause: None,
        }
    }

    pub fn validation<M: Into<String>>(message: M) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    pub fn validation_field<M: Into<String>, F: Into<String>>(message: M, field: F) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn cache<M: Into<String>>(message: M) -> Self {
        Self::Cache {
            message: message.into(),
            cause: None,
        }
    }

    pub fn cache_with_cause<M: Into<String>, E>(message: M, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Cache {
            message: message.into(),
            cause: Some(anyhow::Error::new(cause)),
        }
    }

    /// Whether retrying the same operation could ever succeed. Construction
    /// and validation errors are deterministic; everything touching a live
    /// store might recover.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::Cache { .. }
                | Self::Audit { .. }
                | Self::Retrieval { .. }
                | Self::Masking { .. }
        )
    }

    /// Short label used in log fields.
    pub fn category(&self) -> &'static str {
        match self {
            Self::MissingReferenceTarget { .. } | Self::DuplicateAddress { .. } => "graph",
            Self::UnreachableNodes { .. } | Self::CycleDetected { .. } => "traversal",
            Self::Connection { .. } => "connection",
            Self::ConnectorNotFound { .. } => "connector_not_found",
            Self::Retrieval { .. } => "retrieval",
            Self::Masking { .. } => "masking",
            Self::Validation { .. } => "validation",
            Self::Cache { .. } => "cache",
            Self::Audit { .. } => "audit",
            Self::DeadlineExceeded { .. } => "deadline",
            Self::Cancelled => "cancelled",
            Self::Serialization(_) => "serialization",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, EngineError>;
