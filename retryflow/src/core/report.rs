//! Retry reports and the accumulator that builds them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a failed record was left out of the retriable set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotRetriableReason {
    /// The failure was classified as permanent.
    Permanent,
    /// The record already used its whole attempt budget.
    AttemptsExhausted,
    /// The predecessor stage has not succeeded for the entity.
    DependencyNotSatisfied,
}

/// Counts of non-retriable failures, by reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotRetriableBreakdown {
    /// Permanent failures.
    pub permanent: usize,
    /// Transient failures whose budget is spent.
    pub attempts_exhausted: usize,
    /// Failures blocked on their predecessor stage.
    pub dependency_not_satisfied: usize,
}

impl NotRetriableBreakdown {
    /// Counts one more record for `reason`.
    pub fn add(&mut self, reason: NotRetriableReason) {
        match reason {
            NotRetriableReason::Permanent => self.permanent += 1,
            NotRetriableReason::AttemptsExhausted => self.attempts_exhausted += 1,
            NotRetriableReason::DependencyNotSatisfied => self.dependency_not_satisfied += 1,
        }
    }

    /// Returns the total number of non-retriable records.
    #[must_use]
    pub fn total(&self) -> usize {
        self.permanent + self.attempts_exhausted + self.dependency_not_satisfied
    }

    fn merge(&mut self, other: &Self) {
        self.permanent += other.permanent;
        self.attempts_exhausted += other.attempts_exhausted;
        self.dependency_not_satisfied += other.dependency_not_satisfied;
    }
}

/// Per-stage counters within a [`RetryReport`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageReport {
    /// Stage code.
    pub code: String,
    /// Failed records found for the stage.
    pub total_failed: usize,
    /// Records scheduled for retry.
    pub retriable: usize,
    /// Entities that ended the run in success.
    pub successes: usize,
    /// Entities that ended the run failed.
    pub failures: usize,
    /// Entities that were not attempted.
    pub skipped: usize,
}

/// Outcome counters of a scan or run.
///
/// Produced fresh by every scan or run, never updated afterwards.
/// Run reports are only built through [`ReportAccumulator`], which keeps
/// `processed == successes + failures + skipped`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryReport {
    /// Failed records found by the scan.
    pub total_failed: usize,
    /// Records eligible for retry.
    pub retriable: usize,
    /// Entities resolved by the run.
    pub processed: usize,
    /// Entities that ended in success.
    pub successes: usize,
    /// Entities that ended failed.
    pub failures: usize,
    /// Entities that were not attempted.
    pub skipped: usize,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Whether the run stopped early on cancellation.
    #[serde(default)]
    pub cancelled: bool,
    /// Why the non-retriable records were excluded.
    #[serde(default)]
    pub not_retriable: NotRetriableBreakdown,
    /// Per-stage counters, in dependency order.
    #[serde(default)]
    pub per_stage: Vec<StageReport>,
}

impl RetryReport {
    /// Returns true if the report satisfies the accounting invariant.
    #[must_use]
    pub fn is_balanced(&self) -> bool {
        self.processed == self.successes + self.failures + self.skipped
    }

    /// Returns the sum of two reports.
    ///
    /// Per-stage entries are concatenated, so combining independent
    /// single-stage reports reproduces a multi-stage report.
    #[must_use]
    pub fn combine(&self, other: &Self) -> Self {
        let mut not_retriable = self.not_retriable;
        not_retriable.merge(&other.not_retriable);

        let mut per_stage = self.per_stage.clone();
        per_stage.extend(other.per_stage.iter().cloned());

        Self {
            total_failed: self.total_failed + other.total_failed,
            retriable: self.retriable + other.retriable,
            processed: self.processed + other.processed,
            successes: self.successes + other.successes,
            failures: self.failures + other.failures,
            skipped: self.skipped + other.skipped,
            duration_ms: self.duration_ms + other.duration_ms,
            cancelled: self.cancelled || other.cancelled,
            not_retriable,
            per_stage,
        }
    }
}

impl fmt::Display for RetryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed={} retriable={} processed={} ok={} failed_again={} skipped={} ({}ms)",
            self.total_failed,
            self.retriable,
            self.processed,
            self.successes,
            self.failures,
            self.skipped,
            self.duration_ms
        )
    }
}

/// Why an entity was skipped during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The predecessor stage became unsatisfied mid-run.
    DependencyNotSatisfied,
    /// The record was already in success when re-read.
    AlreadySucceeded,
    /// The record left the retriable state between the scan and the attempt.
    Superseded,
    /// The run was cancelled before the entity was decided.
    Cancelled,
    /// The run was aborted by a ledger failure.
    Aborted,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DependencyNotSatisfied => write!(f, "dependency_not_satisfied"),
            Self::AlreadySucceeded => write!(f, "already_succeeded"),
            Self::Superseded => write!(f, "superseded"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// How a retriable entity ended the run. Each entity resolves exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "resolution", content = "reason", rename_all = "snake_case")]
pub enum Resolution {
    /// A retry succeeded.
    Succeeded,
    /// The entity failed permanently or ran out of attempts.
    Failed,
    /// The entity was not attempted to completion.
    Skipped(SkipReason),
}

/// Builds a [`RetryReport`] from scan counts and per-entity resolutions.
#[derive(Debug, Clone, Default)]
pub struct ReportAccumulator {
    total_failed: usize,
    retriable: usize,
    not_retriable: NotRetriableBreakdown,
    stages: Vec<StageReport>,
}

impl ReportAccumulator {
    /// Creates an empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the scan counts of one stage. Stages are reported in
    /// registration order.
    pub fn register_stage(
        &mut self,
        code: impl Into<String>,
        total_failed: usize,
        retriable: usize,
        not_retriable: NotRetriableBreakdown,
    ) {
        self.total_failed += total_failed;
        self.retriable += retriable;
        self.not_retriable.merge(&not_retriable);
        self.stages.push(StageReport {
            code: code.into(),
            total_failed,
            retriable,
            ..StageReport::default()
        });
    }

    /// Records how one entity of `stage_code` ended the run.
    pub fn resolve(&mut self, stage_code: &str, resolution: Resolution) {
        let index = if let Some(index) = self.stages.iter().position(|s| s.code == stage_code) {
            index
        } else {
            self.stages.push(StageReport {
                code: stage_code.to_string(),
                ..StageReport::default()
            });
            self.stages.len() - 1
        };
        let stage = &mut self.stages[index];

        match resolution {
            Resolution::Succeeded => stage.successes += 1,
            Resolution::Failed => stage.failures += 1,
            Resolution::Skipped(_) => stage.skipped += 1,
        }
    }

    /// Returns the number of entities resolved so far.
    #[must_use]
    pub fn resolved(&self) -> usize {
        self.stages
            .iter()
            .map(|s| s.successes + s.failures + s.skipped)
            .sum()
    }

    /// Produces the final report.
    #[must_use]
    pub fn finish(self, duration_ms: u64, cancelled: bool) -> RetryReport {
        let successes = self.stages.iter().map(|s| s.successes).sum();
        let failures = self.stages.iter().map(|s| s.failures).sum();
        let skipped = self.stages.iter().map(|s| s.skipped).sum();

        RetryReport {
            total_failed: self.total_failed,
            retriable: self.retriable,
            processed: successes + failures + skipped,
            successes,
            failures,
            skipped,
            duration_ms,
            cancelled,
            not_retriable: self.not_retriable,
            per_stage: self.stages,
        }
    }
}
