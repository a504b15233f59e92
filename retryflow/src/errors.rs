//! Error types for the retryflow recovery subsystem.
//!
//! Executor failures are never errors here: they are classified into a
//! [`FailureKind`](crate::core::FailureKind) and folded into ledger state.
//! Only registry, request, and storage problems surface as [`RecoveryError`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::core::RetryReport;

/// The main error type for retryflow operations.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// A stage code did not resolve against the registry.
    #[error("Stage not found: {0}")]
    StageNotFound(String),

    /// The stage registry definition is invalid.
    #[error("{0}")]
    Registry(#[from] RegistryError),

    /// A request or configuration value was rejected.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The execution ledger failed before any work was done.
    #[error("{0}")]
    Storage(#[from] StorageError),

    /// The execution ledger failed mid-run; the run was aborted.
    #[error("Run aborted: {source}")]
    Aborted {
        /// The storage failure that ended the run.
        source: StorageError,
        /// What had completed before the abort.
        partial: Box<RetryReport>,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RecoveryError {
    /// Creates an invalid request error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Returns the partial report carried by an aborted run, if any.
    #[must_use]
    pub fn partial_report(&self) -> Option<&RetryReport> {
        match self {
            Self::Aborted { partial, .. } => Some(partial),
            _ => None,
        }
    }

    /// Returns true if the error originated in the execution ledger.
    #[must_use]
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Aborted { .. })
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let kind = match self {
            Self::StageNotFound(_) => "StageNotFound",
            Self::Registry(_) => "InvalidRegistry",
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::Storage(_) => "StorageError",
            Self::Aborted { .. } => "RunAborted",
            Self::Serialization(_) => "SerializationError",
            Self::Io(_) => "IoError",
        };

        let mut map = HashMap::new();
        map.insert("type".to_string(), serde_json::json!(kind));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        if let Some(partial) = self.partial_report() {
            map.insert("partial".to_string(), serde_json::json!(partial));
        }
        map
    }
}

/// The execution ledger failed to read or write.
///
/// Fatal to the current run.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("Storage error during {operation}: {message}")]
pub struct StorageError {
    /// The ledger operation that failed (e.g. "record", "list_failed").
    pub operation: String,
    /// What went wrong.
    pub message: String,
}

impl StorageError {
    /// Creates a new storage error.
    #[must_use]
    pub fn new(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// Errors raised while building a [`StageRegistry`](crate::registry::StageRegistry).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// No stages were declared.
    #[error("Stage registry is empty")]
    Empty,

    /// Two stages share a code.
    #[error("Duplicate stage code: {0}")]
    DuplicateStage(String),

    /// A stage code is not lowercase kebab-case.
    #[error("Invalid stage code '{0}': expected lowercase kebab-case")]
    InvalidCode(String),

    /// A stage tried to use the reserved selector code.
    #[error("Stage code '{0}' is reserved")]
    ReservedCode(String),

    /// A stage names a predecessor that was never declared.
    #[error("Stage '{stage}' depends on unknown stage '{predecessor}'")]
    UnknownPredecessor {
        /// The dependent stage.
        stage: String,
        /// The missing predecessor.
        predecessor: String,
    },

    /// The predecessor links form a cycle.
    #[error("Cycle detected in stage chain: {}", path.join(" -> "))]
    Cycle {
        /// The stages forming the cycle, first repeated at the end.
        path: Vec<String>,
    },
}

/// A specialized `Result` type for retryflow operations.
pub type Result<T> = std::result::Result<T, RecoveryError>;
