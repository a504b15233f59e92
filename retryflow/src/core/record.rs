//! Execution ledger records and executor outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{ExecutionStatus, FailureKind};

/// Identifies one (entity, stage) pair in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    /// The opaque entity identifier.
    pub entity_id: String,
    /// The stage code.
    pub stage_code: String,
}

impl RecordKey {
    /// Creates a new record key.
    #[must_use]
    pub fn new(entity_id: impl Into<String>, stage_code: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            stage_code: stage_code.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_id, self.stage_code)
    }
}

/// The classified error from the last failed execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    /// Failure classification.
    pub kind: FailureKind,
    /// Error message reported by the executor.
    pub message: String,
}

impl LastError {
    /// Creates a new last error.
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Where a recorded outcome came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeSource {
    /// The first execution of the stage, performed outside the recovery core.
    Original,
    /// A retry issued by the scheduler; counts against the attempt budget.
    Retry,
}

/// One snapshot of the ledger for an (entity, stage) pair.
///
/// Snapshots are never mutated in place; every change produces a new
/// snapshot with a higher `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    /// The opaque entity identifier.
    pub entity_id: String,
    /// The stage code.
    pub stage_code: String,
    /// The owning company, when the entity belongs to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    /// Last known status.
    pub status: ExecutionStatus,
    /// Retry attempts recorded so far.
    pub attempts: u32,
    /// Classified error of the last failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
    /// When the last execution finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    /// Hash of the inputs that produced the last success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_fingerprint: Option<String>,
    /// Snapshot version, starting at 0 for a never-run placeholder.
    #[serde(default)]
    pub version: u64,
}

impl ExecutionRecord {
    /// Creates the placeholder returned for pairs with no ledger entry.
    #[must_use]
    pub fn never_run(entity_id: impl Into<String>, stage_code: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            stage_code: stage_code.into(),
            owner_id: None,
            status: ExecutionStatus::NeverRun,
            attempts: 0,
            last_error: None,
            last_run_at: None,
            content_fingerprint: None,
            version: 0,
        }
    }

    /// Creates a successful original-execution record.
    #[must_use]
    pub fn succeeded(
        entity_id: impl Into<String>,
        stage_code: impl Into<String>,
        fingerprint: Option<String>,
    ) -> Self {
        Self {
            status: ExecutionStatus::Success,
            last_run_at: Some(Utc::now()),
            content_fingerprint: fingerprint,
            version: 1,
            ..Self::never_run(entity_id, stage_code)
        }
    }

    /// Creates a failed record with the given classification and attempt count.
    #[must_use]
    pub fn failed(
        entity_id: impl Into<String>,
        stage_code: impl Into<String>,
        kind: FailureKind,
        message: impl Into<String>,
        attempts: u32,
    ) -> Self {
        let status = if kind.is_retriable() {
            ExecutionStatus::TransientFailure
        } else {
            ExecutionStatus::PermanentFailure
        };

        Self {
            status,
            attempts,
            last_error: Some(LastError::new(kind, message)),
            last_run_at: Some(Utc::now()),
            version: 1,
            ..Self::never_run(entity_id, stage_code)
        }
    }

    /// Sets the owning company.
    #[must_use]
    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    /// Returns the ledger key of this record.
    #[must_use]
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.entity_id.clone(), self.stage_code.clone())
    }

    /// Returns the snapshot that follows this one after `outcome`.
    ///
    /// Attempts only grow for retry outcomes. A failed outcome keeps the
    /// fingerprint of the last success.
    #[must_use]
    pub fn apply(
        &self,
        outcome: &ExecutionOutcome,
        source: OutcomeSource,
        at: DateTime<Utc>,
    ) -> Self {
        let mut next = self.clone();
        next.version = self.version + 1;
        next.last_run_at = Some(at);
        if source == OutcomeSource::Retry {
            next.attempts = self.attempts.saturating_add(1);
        }

        match outcome {
            ExecutionOutcome::Success { fingerprint } => {
                next.status = ExecutionStatus::Success;
                next.last_error = None;
                next.content_fingerprint.clone_from(fingerprint);
            }
            ExecutionOutcome::TransientFailure { message } => {
                next.status = ExecutionStatus::TransientFailure;
                next.last_error = Some(LastError::new(FailureKind::Transient, message.clone()));
            }
            ExecutionOutcome::PermanentFailure { message } => {
                next.status = ExecutionStatus::PermanentFailure;
                next.last_error = Some(LastError::new(FailureKind::Permanent, message.clone()));
            }
        }

        next
    }

    /// Returns the snapshot produced by a force reset.
    ///
    /// The record goes back to `never-run` with a fresh attempt budget.
    #[must_use]
    pub fn reset(&self, at: DateTime<Utc>) -> Self {
        Self {
            entity_id: self.entity_id.clone(),
            stage_code: self.stage_code.clone(),
            owner_id: self.owner_id.clone(),
            status: ExecutionStatus::NeverRun,
            attempts: 0,
            last_error: None,
            last_run_at: Some(at),
            content_fingerprint: None,
            version: self.version + 1,
        }
    }
}

/// The result of one executor invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// Content was generated.
    Success {
        /// Hash of the inputs that produced the content.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fingerprint: Option<String>,
    },
    /// A failure that may clear up on retry.
    TransientFailure {
        /// Error message.
        message: String,
    },
    /// A failure retrying cannot fix.
    PermanentFailure {
        /// Error message.
        message: String,
    },
}

impl ExecutionOutcome {
    /// Creates a success outcome.
    #[must_use]
    pub fn success(fingerprint: Option<String>) -> Self {
        Self::Success { fingerprint }
    }

    /// Creates a transient failure outcome.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientFailure {
            message: message.into(),
        }
    }

    /// Creates a permanent failure outcome.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::PermanentFailure {
            message: message.into(),
        }
    }

    /// Returns true for success outcomes.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Returns the failure classification, if the outcome is a failure.
    #[must_use]
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Success { .. } => None,
            Self::TransientFailure { .. } => Some(FailureKind::Transient),
            Self::PermanentFailure { .. } => Some(FailureKind::Permanent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_run_placeholder() {
        let record = ExecutionRecord::never_run("persona-1", "biography");
        assert_eq!(record.status, ExecutionStatus::NeverRun);
        assert_eq!(record.attempts, 0);
        assert_eq!(record.version, 0);
        assert_eq!(record.key(), RecordKey::new("persona-1", "biography"));
    }

    #[test]
    fn test_failed_record_classification() {
        let transient =
            ExecutionRecord::failed("p", "avatar", FailureKind::Transient, "rate limited", 1);
        assert_eq!(transient.status, ExecutionStatus::TransientFailure);

        let permanent =
            ExecutionRecord::failed("p", "avatar", FailureKind::Permanent, "policy", 0);
        assert_eq!(permanent.status, ExecutionStatus::PermanentFailure);
        assert_eq!(permanent.last_error.unwrap().kind, FailureKind::Permanent);
    }

    #[test]
    fn test_apply_retry_increments_attempts() {
        let record = ExecutionRecord::failed("p", "avatar", FailureKind::Transient, "timeout", 1);
        let next = record.apply(&ExecutionOutcome::transient("timeout"), OutcomeSource::Retry, Utc::now());

        assert_eq!(next.attempts, 2);
        assert_eq!(next.version, record.version + 1);
        assert_eq!(next.status, ExecutionStatus::TransientFailure);
    }

    #[test]
    fn test_apply_original_keeps_attempts() {
        let record = ExecutionRecord::never_run("p", "avatar");
        let next = record.apply(&ExecutionOutcome::transient("timeout"), OutcomeSource::Original, Utc::now());

        assert_eq!(next.attempts, 0);
        assert_eq!(next.status, ExecutionStatus::TransientFailure);
    }

    #[test]
    fn test_apply_success_sets_fingerprint_and_clears_error() {
        let record = ExecutionRecord::failed("p", "avatar", FailureKind::Transient, "timeout", 2)
            .with_owner("acme");
        let next = record.apply(
            &ExecutionOutcome::success(Some("abc".to_string())),
            OutcomeSource::Retry,
            Utc::now(),
        );

        assert_eq!(next.status, ExecutionStatus::Success);
        assert_eq!(next.content_fingerprint.as_deref(), Some("abc"));
        assert!(next.last_error.is_none());
        assert_eq!(next.owner_id.as_deref(), Some("acme"));
    }

    #[test]
    fn test_reset_returns_to_never_run() {
        let record = ExecutionRecord::succeeded("p", "audit", Some("fp".to_string())).with_owner("acme");
        let reset = record.reset(Utc::now());

        assert_eq!(reset.status, ExecutionStatus::NeverRun);
        assert_eq!(reset.attempts, 0);
        assert!(reset.content_fingerprint.is_none());
        assert_eq!(reset.owner_id.as_deref(), Some("acme"));
        assert_eq!(reset.version, 2);
    }

    #[test]
    fn test_outcome_serialize_tagged() {
        let json = serde_json::to_value(ExecutionOutcome::transient("429")).unwrap();
        assert_eq!(json["outcome"], "transient_failure");
        assert_eq!(json["message"], "429");
    }

    #[test]
    fn test_outcome_failure_kind() {
        assert_eq!(ExecutionOutcome::success(None).failure_kind(), None);
        assert_eq!(
            ExecutionOutcome::permanent("bad").failure_kind(),
            Some(FailureKind::Permanent)
        );
    }
}
