//! Executes retries for the records a scan selected.
//!
//! Stages run one after another in dependency order. Within a stage,
//! entities are retried concurrently up to the configured bound, and each
//! entity's own attempts are strictly sequential. Every scheduled entity
//! resolves exactly once into the report accumulator.
//!
//! The predecessor is re-read right before an entity is attempted. Forced
//! entities skip that check unless this run re-executed the predecessor
//! for the same entity, in which case they follow its new outcome.

use futures::stream::{self, StreamExt};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use super::idempotency::{IdempotencyDecision, IdempotencyGuard};
use super::retry::{RetryAttempt, RetryPolicy};
use super::scanner::{Classification, FailureScanner, ScanEntry, ScanRequest};
use crate::cancellation::CancellationToken;
use crate::core::{
    ExecutionOutcome, ExecutionStatus, OutcomeSource, Resolution, RetryReport, SkipReason,
};
use crate::errors::{RecoveryError, Result, StorageError};
use crate::events::{event_types, EventSink, NoOpEventSink};
use crate::executor::StageExecutor;
use crate::observability::{run_span, RunTimer};
use crate::registry::{Stage, StageRegistry, StageSelector};
use crate::store::{EntityScope, ExecutionStatusStore};

/// Default number of entities retried at once within a stage.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Parameters of one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Stages to recover.
    pub selector: StageSelector,
    /// Entities to consider.
    pub scope: EntityScope,
    /// Attempt budget and backoff.
    pub policy: RetryPolicy,
    /// Reset and re-run terminal records on stages that allow it.
    pub force: bool,
    /// Entities retried at once within a stage. Zero is treated as one.
    pub concurrency: usize,
    /// Caller-owned cancellation.
    pub cancel: Option<Arc<CancellationToken>>,
}

impl RunOptions {
    /// Recovers `selector` over every entity with the default policy.
    #[must_use]
    pub fn new(selector: StageSelector) -> Self {
        Self {
            selector,
            scope: EntityScope::All,
            policy: RetryPolicy::default(),
            force: false,
            concurrency: DEFAULT_CONCURRENCY,
            cancel: None,
        }
    }

    /// Restricts the entities.
    #[must_use]
    pub fn with_scope(mut self, scope: EntityScope) -> Self {
        self.scope = scope;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Enables force mode.
    #[must_use]
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Sets the concurrency bound.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Attaches a cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancel = Some(token);
        self
    }

    fn scan_request(&self) -> ScanRequest {
        ScanRequest::new(self.selector.clone())
            .with_scope(self.scope.clone())
            .with_max_retries(self.policy.max_retries)
            .with_force(self.force)
    }
}

/// Coordinates scanning, backoff, execution, and ledger updates.
#[derive(Clone)]
pub struct RetryScheduler {
    registry: Arc<StageRegistry>,
    store: Arc<dyn ExecutionStatusStore>,
    executor: Arc<dyn StageExecutor>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for RetryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryScheduler")
            .field("stages", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl RetryScheduler {
    /// Creates a scheduler that emits no events.
    #[must_use]
    pub fn new(
        registry: Arc<StageRegistry>,
        store: Arc<dyn ExecutionStatusStore>,
        executor: Arc<dyn StageExecutor>,
    ) -> Self {
        Self {
            registry,
            store,
            executor,
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Returns a scanner over the same registry and ledger.
    #[must_use]
    pub fn scanner(&self) -> FailureScanner {
        FailureScanner::new(self.registry.clone(), self.store.clone())
    }

    /// Returns the stage registry.
    #[must_use]
    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    /// Scans, retries every scheduled record, and reports.
    ///
    /// # Errors
    ///
    /// - `InvalidRequest` for an invalid policy.
    /// - `StageNotFound` for an unknown stage code.
    /// - `Storage` if the ledger fails while planning; nothing was attempted.
    /// - `Aborted` if the ledger fails mid-run; carries the partial report.
    pub async fn run(&self, options: &RunOptions) -> Result<RetryReport> {
        options.policy.validate()?;

        let run_id = Uuid::new_v4().to_string();
        let span = run_span(&run_id, &options.selector, options.force);
        self.execute_run(options, &run_id).instrument(span).await
    }

    async fn execute_run(&self, options: &RunOptions, run_id: &str) -> Result<RetryReport> {
        let timer = RunTimer::start();
        let token = match &options.cancel {
            Some(parent) => parent.child(),
            None => Arc::new(CancellationToken::new()),
        };

        let plan = self.scanner().plan(&options.scan_request()).await?;
        let mut acc = plan.accumulator();
        let concurrency = options.concurrency.max(1);

        info!(
            stages = plan.stages.len(),
            scheduled = plan.scheduled_count(),
            concurrency,
            "Recovery run started"
        );
        self.events
            .emit(
                event_types::RUN_STARTED,
                Some(json!({
                    "runId": run_id,
                    "script": options.selector.to_string(),
                    "force": options.force,
                    "stages": plan.stages.len(),
                    "scheduled": plan.scheduled_count(),
                })),
            )
            .await;

        let mut failure: Option<StorageError> = None;
        let mut cancelled_skips = 0usize;
        // Entities re-executed this run, per stage code.
        let mut executed: HashMap<&str, HashSet<String>> = HashMap::new();
        let token_ref = &token;

        for scan in &plan.stages {
            let scheduled = scan.scheduled();
            if scheduled.is_empty() {
                continue;
            }
            let stage = &scan.stage;
            debug!(stage = %stage.code, entities = scheduled.len(), "Processing stage");

            let predecessor_executed = stage
                .predecessor
                .as_deref()
                .and_then(|code| executed.get(code))
                .cloned()
                .unwrap_or_default();
            let predecessor_ref = &predecessor_executed;

            let mut drained = Vec::with_capacity(scheduled.len());
            {
                let mut results = stream::iter(scheduled)
                    .map(move |entry| {
                        let recheck = entry.classification != Classification::Forced
                            || predecessor_ref.contains(&entry.record.entity_id);
                        self.process_entity(stage, entry, recheck, options, token_ref, run_id)
                    })
                    .buffer_unordered(concurrency);

                while let Some((entity_id, result)) = results.next().await {
                    let resolution = result.unwrap_or_else(|err| {
                        error!(entity_id = %entity_id, stage = %stage.code, error = %err, "Ledger failure");
                        failure.get_or_insert(err);
                        Resolution::Skipped(SkipReason::Aborted)
                    });
                    drained.push((entity_id, resolution));
                }
            }

            // Labels are decided once the stage has drained, so a skip that
            // raced a ledger failure is reported as aborted.
            let mut stage_executed = HashSet::new();
            for (entity_id, resolution) in drained {
                let resolution = match resolution {
                    Resolution::Skipped(SkipReason::Cancelled) if failure.is_some() => {
                        Resolution::Skipped(SkipReason::Aborted)
                    }
                    other => other,
                };
                match resolution {
                    Resolution::Succeeded | Resolution::Failed => {
                        stage_executed.insert(entity_id.clone());
                    }
                    Resolution::Skipped(SkipReason::Cancelled) => cancelled_skips += 1,
                    Resolution::Skipped(_) => {}
                }

                acc.resolve(&stage.code, resolution);
                self.events
                    .emit(
                        event_types::ENTITY_RESOLVED,
                        Some(json!({
                            "runId": run_id,
                            "entityId": entity_id,
                            "stage": stage.code,
                            "resolution": resolution,
                        })),
                    )
                    .await;
            }
            executed.insert(stage.code.as_str(), stage_executed);
        }

        let cancelled = failure.is_none() && cancelled_skips > 0;
        let report = acc.finish(timer.elapsed_ms(), cancelled);

        if let Some(source) = failure {
            error!(error = %source, %report, "Recovery run aborted");
            self.events
                .emit(
                    event_types::RUN_ABORTED,
                    Some(json!({ "runId": run_id, "error": source.to_string(), "report": report })),
                )
                .await;
            return Err(RecoveryError::Aborted {
                source,
                partial: Box::new(report),
            });
        }

        if cancelled {
            warn!(reason = ?token.reason(), %report, "Recovery run cancelled");
            self.events
                .emit(
                    event_types::RUN_CANCELLED,
                    Some(json!({ "runId": run_id, "reason": token.reason(), "report": report })),
                )
                .await;
        } else {
            info!(%report, "Recovery run complete");
            self.events
                .emit(
                    event_types::RUN_COMPLETED,
                    Some(json!({ "runId": run_id, "report": report })),
                )
                .await;
        }

        Ok(report)
    }

    async fn process_entity(
        &self,
        stage: &Stage,
        entry: &ScanEntry,
        recheck_predecessor: bool,
        options: &RunOptions,
        token: &CancellationToken,
        run_id: &str,
    ) -> (String, std::result::Result<Resolution, StorageError>) {
        let entity_id = entry.record.entity_id.clone();
        let forced = entry.classification == Classification::Forced;
        let span = tracing::debug_span!("entity", entity_id = %entity_id, stage = %stage.code, forced);

        let result = self
            .retry_entity(
                stage,
                &entity_id,
                forced,
                recheck_predecessor,
                &options.policy,
                token,
                run_id,
            )
            .instrument(span)
            .await;

        // Stop scheduling new attempts anywhere in the run.
        if let Err(err) = &result {
            token.cancel(format!("ledger failure: {err}"));
        }
        (entity_id, result)
    }

    #[allow(clippy::too_many_arguments)]
    async fn retry_entity(
        &self,
        stage: &Stage,
        entity_id: &str,
        forced: bool,
        recheck_predecessor: bool,
        policy: &RetryPolicy,
        token: &CancellationToken,
        run_id: &str,
    ) -> std::result::Result<Resolution, StorageError> {
        if token.is_cancelled() {
            return Ok(Resolution::Skipped(SkipReason::Cancelled));
        }

        if recheck_predecessor && !self.store.is_predecessor_satisfied(entity_id, stage).await? {
            debug!("Predecessor no longer satisfied");
            return Ok(Resolution::Skipped(SkipReason::DependencyNotSatisfied));
        }

        let current = self.store.get(entity_id, &stage.code).await?;
        if let IdempotencyDecision::AlreadySucceeded { fingerprint } =
            IdempotencyGuard::check(&current, forced)
        {
            debug!(fingerprint = ?fingerprint, "Already succeeded");
            return Ok(Resolution::Skipped(SkipReason::AlreadySucceeded));
        }

        let mut attempts = if forced {
            let reset = self.store.reset(entity_id, &stage.code).await?;
            info!(from = %current.status, version = reset.version, "Force reset to never-run");
            reset.attempts
        } else if current.status == ExecutionStatus::TransientFailure
            && policy.has_budget(current.attempts)
        {
            current.attempts
        } else {
            debug!(status = %current.status, attempts = current.attempts, "No longer retriable");
            return Ok(Resolution::Skipped(SkipReason::Superseded));
        };

        let mut attempt_number = 0u32;
        loop {
            if token.is_cancelled() {
                return Ok(Resolution::Skipped(SkipReason::Cancelled));
            }

            attempt_number += 1;
            let attempt = RetryAttempt::schedule(entity_id, &stage.code, attempt_number, policy);
            debug!(attempt = attempt.attempt_number, delay_ms = attempt.delay_ms(), "Scheduling retry");
            self.events
                .emit(
                    event_types::ATTEMPT_SCHEDULED,
                    Some(json!({
                        "runId": run_id,
                        "entityId": attempt.entity_id,
                        "stage": attempt.stage_code,
                        "attempt": attempt.attempt_number,
                        "delayMs": attempt.delay_ms(),
                    })),
                )
                .await;

            tokio::select! {
                biased;
                () = token.cancelled() => {
                    debug!(attempt = attempt.attempt_number, "Cancelled during backoff");
                    return Ok(Resolution::Skipped(SkipReason::Cancelled));
                }
                () = tokio::time::sleep(attempt.scheduled_delay) => {}
            }

            let outcome = self.executor.execute(entity_id, stage, forced).await;
            self.events
                .emit(
                    event_types::ATTEMPT_COMPLETED,
                    Some(json!({
                        "runId": run_id,
                        "entityId": entity_id,
                        "stage": stage.code,
                        "attempt": attempt.attempt_number,
                        "outcome": outcome,
                    })),
                )
                .await;

            match outcome {
                ExecutionOutcome::Success { .. } => {
                    self.store
                        .record(entity_id, &stage.code, &outcome, OutcomeSource::Retry)
                        .await?;
                    info!(attempt = attempt.attempt_number, "Retry succeeded");
                    return Ok(Resolution::Succeeded);
                }
                ExecutionOutcome::TransientFailure { ref message }
                    if policy.has_budget(attempts.saturating_add(1)) =>
                {
                    debug!(attempt = attempt.attempt_number, error = %message, "Transient failure, retrying");
                    let recorded = self
                        .store
                        .record(entity_id, &stage.code, &outcome, OutcomeSource::Retry)
                        .await?;
                    attempts = recorded.attempts;
                }
                ExecutionOutcome::TransientFailure { message } => {
                    let total = attempts.saturating_add(1);
                    let exhausted = ExecutionOutcome::permanent(format!(
                        "retry budget exhausted after {total} attempts: {message}"
                    ));
                    self.store
                        .record(entity_id, &stage.code, &exhausted, OutcomeSource::Retry)
                        .await?;
                    warn!(attempts = total, error = %message, "Retry budget exhausted");
                    return Ok(Resolution::Failed);
                }
                ExecutionOutcome::PermanentFailure { ref message } => {
                    self.store
                        .record(entity_id, &stage.code, &outcome, OutcomeSource::Retry)
                        .await?;
                    warn!(attempt = attempt.attempt_number, error = %message, "Permanent failure");
                    return Ok(Resolution::Failed);
                }
            }
        }
    }
}
