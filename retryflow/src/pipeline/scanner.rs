//! Read-only classification of failed ledger records.
//!
//! A scan never writes to the ledger and never calls an executor, so it can
//! be repeated freely: two scans without a run in between give identical
//! counts.

use std::sync::Arc;
use tracing::{debug, info};

use crate::core::{
    ExecutionRecord, ExecutionStatus, NotRetriableBreakdown, NotRetriableReason,
    ReportAccumulator, RetryReport,
};
use crate::errors::Result;
use crate::observability::RunTimer;
use crate::registry::{Stage, StageRegistry, StageSelector};
use crate::store::{EntityScope, ExecutionStatusStore};

/// How one record was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// A transient failure with budget left and a satisfied predecessor.
    Retriable,
    /// Selected by force mode; will be reset before it is attempted.
    Forced,
    /// Counted but not scheduled.
    NotRetriable(NotRetriableReason),
}

impl Classification {
    /// Returns true if the record will be attempted by a run.
    #[must_use]
    pub fn is_scheduled(&self) -> bool {
        matches!(self, Self::Retriable | Self::Forced)
    }
}

/// Classifies one record of `stage`.
///
/// In force mode on a stage that supports it, every failed or successful
/// record is selected regardless of predecessor or budget. Otherwise a
/// record is retriable only if it is a transient failure, its predecessor
/// succeeded, and `attempts < max_retries`. An unsatisfied predecessor is
/// reported ahead of the failure kind.
#[must_use]
pub fn classify(
    record: &ExecutionRecord,
    stage: &Stage,
    predecessor_satisfied: bool,
    max_retries: u32,
    force: bool,
) -> Classification {
    if force && stage.supports_force {
        return Classification::Forced;
    }
    if !predecessor_satisfied {
        return Classification::NotRetriable(NotRetriableReason::DependencyNotSatisfied);
    }
    match record.status {
        ExecutionStatus::TransientFailure if record.attempts < max_retries => {
            Classification::Retriable
        }
        ExecutionStatus::TransientFailure => {
            Classification::NotRetriable(NotRetriableReason::AttemptsExhausted)
        }
        _ => Classification::NotRetriable(NotRetriableReason::Permanent),
    }
}

/// One classified record.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanEntry {
    /// The latest snapshot at scan time.
    pub record: ExecutionRecord,
    /// What the scan decided.
    pub classification: Classification,
}

/// Classified records of one stage.
#[derive(Debug, Clone)]
pub struct StageScan {
    /// The scanned stage.
    pub stage: Stage,
    /// Entries ordered by entity id.
    pub entries: Vec<ScanEntry>,
}

impl StageScan {
    /// Returns the number of records in a failure state.
    #[must_use]
    pub fn total_failed(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.record.status.is_failure())
            .count()
    }

    /// Returns the entries a run will attempt.
    #[must_use]
    pub fn scheduled(&self) -> Vec<&ScanEntry> {
        self.entries
            .iter()
            .filter(|e| e.classification.is_scheduled())
            .collect()
    }

    /// Returns why the other failures were left out.
    #[must_use]
    pub fn breakdown(&self) -> NotRetriableBreakdown {
        let mut breakdown = NotRetriableBreakdown::default();
        for entry in &self.entries {
            if let Classification::NotRetriable(reason) = entry.classification {
                breakdown.add(reason);
            }
        }
        breakdown
    }
}

/// The result of scanning every selected stage, in dependency order.
#[derive(Debug, Clone)]
pub struct ScanPlan {
    /// Per-stage results.
    pub stages: Vec<StageScan>,
}

impl ScanPlan {
    /// Returns an accumulator primed with this plan's scan counts.
    #[must_use]
    pub fn accumulator(&self) -> ReportAccumulator {
        let mut acc = ReportAccumulator::new();
        for scan in &self.stages {
            acc.register_stage(
                scan.stage.code.clone(),
                scan.total_failed(),
                scan.scheduled().len(),
                scan.breakdown(),
            );
        }
        acc
    }

    /// Returns the report-only view of the plan.
    #[must_use]
    pub fn report(&self, duration_ms: u64) -> RetryReport {
        self.accumulator().finish(duration_ms, false)
    }

    /// Returns the number of entries a run will attempt.
    #[must_use]
    pub fn scheduled_count(&self) -> usize {
        self.stages.iter().map(|s| s.scheduled().len()).sum()
    }
}

/// What to scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    /// Stages to scan.
    pub selector: StageSelector,
    /// Entities to consider.
    pub scope: EntityScope,
    /// Attempt budget used to classify transient failures.
    pub max_retries: u32,
    /// Whether force mode is requested.
    pub force: bool,
}

impl ScanRequest {
    /// Scans `selector` over every entity with a budget of 3 and no force.
    #[must_use]
    pub fn new(selector: StageSelector) -> Self {
        Self {
            selector,
            scope: EntityScope::All,
            max_retries: 3,
            force: false,
        }
    }

    /// Restricts the entities.
    #[must_use]
    pub fn with_scope(mut self, scope: EntityScope) -> Self {
        self.scope = scope;
        self
    }

    /// Sets the attempt budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Enables force mode.
    #[must_use]
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

/// Builds scan plans and report-only reports from the ledger.
#[derive(Clone)]
pub struct FailureScanner {
    registry: Arc<StageRegistry>,
    store: Arc<dyn ExecutionStatusStore>,
}

impl std::fmt::Debug for FailureScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureScanner")
            .field("stages", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl FailureScanner {
    /// Creates a scanner.
    #[must_use]
    pub fn new(registry: Arc<StageRegistry>, store: Arc<dyn ExecutionStatusStore>) -> Self {
        Self { registry, store }
    }

    /// Classifies every candidate record of the selected stages.
    ///
    /// # Errors
    ///
    /// Returns `StageNotFound` for an unknown stage code and `Storage` if the
    /// ledger cannot be read.
    pub async fn plan(&self, request: &ScanRequest) -> Result<ScanPlan> {
        let stages = self.registry.expand(&request.selector)?;
        let mut scans = Vec::with_capacity(stages.len());

        for stage in stages {
            let forced = request.force && stage.supports_force;
            let records = if forced {
                self.store
                    .list(&stage.code, &request.scope)
                    .await?
                    .into_iter()
                    .filter(|r| r.status.is_failure() || r.status.is_success())
                    .collect()
            } else {
                self.store
                    .list_failed(std::slice::from_ref(&stage.code), &request.scope)
                    .await?
            };

            let mut entries = Vec::with_capacity(records.len());
            for record in records {
                let satisfied = forced
                    || self
                        .store
                        .is_predecessor_satisfied(&record.entity_id, stage)
                        .await?;
                let classification =
                    classify(&record, stage, satisfied, request.max_retries, request.force);
                entries.push(ScanEntry {
                    record,
                    classification,
                });
            }

            let scan = StageScan {
                stage: stage.clone(),
                entries,
            };
            debug!(
                stage = %stage.code,
                failed = scan.total_failed(),
                scheduled = scan.scheduled().len(),
                forced,
                "Scanned stage"
            );
            scans.push(scan);
        }

        Ok(ScanPlan { stages: scans })
    }

    /// Produces a report-only [`RetryReport`]. Nothing is written or executed.
    ///
    /// # Errors
    ///
    /// See [`plan`](Self::plan).
    pub async fn scan(&self, request: &ScanRequest) -> Result<RetryReport> {
        let timer = RunTimer::start();
        let plan = self.plan(request).await?;
        let report = plan.report(timer.elapsed_ms());

        info!(
            script = %request.selector,
            total_failed = report.total_failed,
            retriable = report.retriable,
            "Scan complete"
        );
        Ok(report)
    }
}
