//! Execution status and failure classification enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The last known outcome of an (entity, stage) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionStatus {
    /// The stage has never been executed for this entity.
    #[default]
    NeverRun,
    /// The stage produced its content.
    Success,
    /// The stage failed for a reason that may go away on its own.
    TransientFailure,
    /// The stage failed for a reason retrying cannot fix.
    PermanentFailure,
    /// The stage was deliberately not executed.
    Skipped,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NeverRun => write!(f, "never-run"),
            Self::Success => write!(f, "success"),
            Self::TransientFailure => write!(f, "transient-failure"),
            Self::PermanentFailure => write!(f, "permanent-failure"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl ExecutionStatus {
    /// Returns true if the status is one of the two failure states.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::TransientFailure | Self::PermanentFailure)
    }

    /// Returns true if no retry moves the record out of this state.
    ///
    /// Terminal records only leave their state through a force reset.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::PermanentFailure)
    }

    /// Returns true if the status indicates success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Classification applied to every executor outcome and store operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Rate limit, timeout, network error, temporary upstream unavailability.
    Transient,
    /// Validation error, malformed input, content policy rejection.
    Permanent,
    /// The predecessor stage never succeeded for this entity.
    DependencyNotSatisfied,
    /// The execution ledger itself failed.
    Storage,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
            Self::DependencyNotSatisfied => write!(f, "dependency_not_satisfied"),
            Self::Storage => write!(f, "storage"),
        }
    }
}

impl FailureKind {
    /// Returns true if a failure of this kind may be retried with backoff.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transient)
    }
}
