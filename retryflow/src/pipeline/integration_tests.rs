//! End-to-end recovery tests over the persona pipeline.

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::api::{RecoveryService, RetryRequest};
use crate::cancellation::CancellationToken;
use crate::core::{
    ExecutionOutcome, ExecutionRecord, ExecutionStatus, FailureKind, OutcomeSource, RetryReport,
};
use crate::errors::StorageError;
use crate::pipeline::{RetryPolicy, RetryScheduler, RunOptions, ScanRequest};
use crate::registry::{StageRegistry, StageSelector};
use crate::store::{EntityScope, ExecutionStatusStore, FileExecutionStore, InMemoryExecutionStore};
use crate::testing::{
    assert_record, assert_report_balanced, assert_report_counts, assert_same_scan, LedgerFixture,
    ScriptedExecutor,
};

fn policy(max_retries: u32, delay_ms: u64) -> RetryPolicy {
    RetryPolicy::new()
        .with_max_retries(max_retries)
        .with_initial_delay_ms(delay_ms)
        .with_backoff_multiplier(2.0)
}

/// p1: biography transient.
/// p2: biography ok, attributions permanent.
/// p3: biography ok, attributions ok, competencies transient with spent budget.
/// p4: avatar transient, but competencies never ran.
/// p5: biography ok, attributions transient.
async fn mixed_ledger() -> LedgerFixture {
    let fixture = LedgerFixture::persona_pipeline().with_owner("acme");
    fixture.transient("p1", "biography", 0).await.unwrap();

    fixture.succeeded_before("p2", "attributions").await.unwrap();
    fixture.permanent("p2", "attributions").await.unwrap();

    fixture.succeeded_before("p3", "competencies").await.unwrap();
    fixture.transient("p3", "competencies", 3).await.unwrap();

    fixture.succeeded("p4", "biography").await.unwrap();
    fixture.transient("p4", "avatar", 0).await.unwrap();

    fixture.succeeded_before("p5", "attributions").await.unwrap();
    fixture.transient("p5", "attributions", 1).await.unwrap();
    fixture
}

#[tokio::test]
async fn test_scan_classifies_mixed_ledger() {
    let fixture = mixed_ledger().await;
    let report = fixture
        .scanner()
        .scan(&ScanRequest::new(StageSelector::All))
        .await
        .unwrap();

    assert_eq!(report.total_failed, 5);
    assert_eq!(report.retriable, 2);
    assert_eq!(report.not_retriable.permanent, 1);
    assert_eq!(report.not_retriable.attempts_exhausted, 1);
    assert_eq!(report.not_retriable.dependency_not_satisfied, 1);
    assert_eq!(report.processed, 0);
    assert_eq!(report.per_stage.len(), 10);
}

#[tokio::test(start_paused = true)]
async fn test_run_report_is_balanced() {
    let fixture = mixed_ledger().await;
    let executor = Arc::new(
        ScriptedExecutor::new()
            .script("p1", "biography", [ExecutionOutcome::success(None)])
            .script("p5", "attributions", [ExecutionOutcome::permanent("schema mismatch")]),
    );

    let report = fixture
        .scheduler(executor.clone())
        .run(&RunOptions::new(StageSelector::All).with_policy(policy(3, 10)))
        .await
        .unwrap();

    assert_eq!(report.retriable, 2);
    assert_eq!(report.processed, 2);
    assert_report_counts(&report, 1, 1, 0);
    assert_eq!(executor.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_succeeded_records_are_never_reattempted() {
    let fixture = LedgerFixture::persona_pipeline();
    fixture.succeeded_before("p1", "avatar").await.unwrap();
    let before = fixture.store().snapshot();

    let executor = Arc::new(ScriptedExecutor::new());
    let scheduler = fixture.scheduler(executor.clone());
    for _ in 0..3 {
        let report = scheduler
            .run(&RunOptions::new(StageSelector::All).with_policy(policy(3, 10)))
            .await
            .unwrap();
        assert_eq!(report.total_failed, 0);
        assert_eq!(report.processed, 0);
    }

    assert_eq!(executor.call_count(), 0);
    assert_eq!(fixture.store().snapshot(), before);
}

#[tokio::test(start_paused = true)]
async fn test_attempts_never_exceed_budget_across_runs() {
    let fixture = LedgerFixture::persona_pipeline();
    fixture.transient("p1", "biography", 2).await.unwrap();
    let executor = Arc::new(
        ScriptedExecutor::new().with_fallback(ExecutionOutcome::transient("rate limited")),
    );
    let scheduler = fixture.scheduler(executor.clone());
    let options = RunOptions::new(StageSelector::single("biography")).with_policy(policy(3, 10));

    let first = scheduler.run(&options).await.unwrap();
    assert_report_counts(&first, 0, 1, 0);
    // Two attempts were spent in earlier runs, so only one was left.
    assert_eq!(executor.call_count(), 1);
    assert_record(
        &fixture.store().get("p1", "biography").await.unwrap(),
        ExecutionStatus::PermanentFailure,
        3,
    );

    let second = scheduler.run(&options).await.unwrap();
    assert_eq!(second.retriable, 0);
    assert_eq!(executor.call_count(), 1);
}

#[tokio::test]
async fn test_report_only_leaves_ledger_untouched() {
    let fixture = mixed_ledger().await;
    let executor = Arc::new(ScriptedExecutor::new());
    let service = RecoveryService::new(fixture.registry(), fixture.store())
        .with_executor(executor.clone());
    let before = fixture.store().snapshot();

    let response = service
        .handle(&RetryRequest::new("acme", "ALL").report_only())
        .await;

    let report = response.data.unwrap();
    assert!(response.success);
    assert_eq!(
        (report.processed, report.successes, report.failures, report.skipped),
        (0, 0, 0, 0)
    );
    assert_eq!(executor.call_count(), 0);
    assert_eq!(fixture.store().snapshot(), before);
}

#[tokio::test]
async fn test_report_only_leaves_ledger_file_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.jsonl");
    {
        let store = FileExecutionStore::open(&path).await.unwrap();
        store
            .seed(crate::core::ExecutionRecord::failed(
                "p1",
                "biography",
                crate::core::FailureKind::Transient,
                "timeout",
                0,
            ))
            .await
            .unwrap();
    }
    let before = std::fs::read(&path).unwrap();

    let store = Arc::new(FileExecutionStore::open(&path).await.unwrap());
    let service = RecoveryService::new(Arc::new(StageRegistry::persona_pipeline()), store);
    let response = service
        .handle(&RetryRequest::new("", "biography").report_only())
        .await;

    assert!(response.success);
    assert_eq!(response.data.unwrap().retriable, 1);
    assert_eq!(std::fs::read(&path).unwrap(), before);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_scenario_through_service() {
    let registry = StageRegistry::builder().stage("a", "A").build().unwrap();
    let fixture = LedgerFixture::new(registry);
    fixture.transient("e1", "a", 1).await.unwrap();

    let executor = Arc::new(
        ScriptedExecutor::new().with_fallback(ExecutionOutcome::transient("upstream 503")),
    );
    let service = RecoveryService::new(fixture.registry(), fixture.store())
        .with_executor(executor.clone());

    let response = service
        .handle(&RetryRequest::new("", "a").with_policy(3, 100, 2.0))
        .await;

    assert!(response.success);
    let calls: Vec<Duration> = executor.calls().iter().map(|c| c.at).collect();
    assert_eq!(calls, vec![Duration::from_millis(100), Duration::from_millis(300)]);
    assert_record(
        &fixture.store().get("e1", "a").await.unwrap(),
        ExecutionStatus::PermanentFailure,
        3,
    );
}

#[tokio::test]
async fn test_unsatisfied_dependency_is_not_retriable() {
    let registry = StageRegistry::builder()
        .stage("a", "A")
        .stage("b", "B")
        .after("a")
        .build()
        .unwrap();
    let fixture = LedgerFixture::new(registry);
    fixture.transient("e2", "b", 0).await.unwrap();

    let report = fixture
        .scanner()
        .scan(&ScanRequest::new(StageSelector::single("b")))
        .await
        .unwrap();

    assert_eq!(report.total_failed, 1);
    assert_eq!(report.retriable, 0);
    assert_eq!(report.not_retriable.dependency_not_satisfied, 1);
}

#[tokio::test]
async fn test_all_equals_sum_of_stages() {
    let fixture = mixed_ledger().await;
    let scanner = fixture.scanner();

    let all = scanner.scan(&ScanRequest::new(StageSelector::All)).await.unwrap();

    let mut summed = RetryReport::default();
    for stage in fixture.registry().all() {
        let single = scanner
            .scan(&ScanRequest::new(StageSelector::single(stage.code.as_str())))
            .await
            .unwrap();
        summed = summed.combine(&single);
    }

    assert_same_scan(&all, &summed);
    let codes = |r: &RetryReport| r.per_stage.iter().map(|s| s.code.clone()).collect::<Vec<_>>();
    assert_eq!(codes(&all), codes(&summed));
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_leaves_no_ambiguous_state() {
    let fixture = LedgerFixture::persona_pipeline();
    for entity in ["p1", "p2", "p3", "p4"] {
        fixture.transient(entity, "biography", 0).await.unwrap();
    }
    let executor = Arc::new(
        ScriptedExecutor::new()
            .with_latency(Duration::from_millis(30))
            .with_fallback(ExecutionOutcome::transient("busy")),
    );
    let token = Arc::new(CancellationToken::new());

    let scheduler = fixture.scheduler(executor);
    let options = RunOptions::new(StageSelector::single("biography"))
        .with_policy(policy(3, 100))
        .with_concurrency(2)
        .with_cancellation(token.clone());

    let cancel = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            token.cancel("operator stop");
        })
    };
    let report = scheduler.run(&options).await.unwrap();
    cancel.await.unwrap();

    assert!(report.cancelled);
    assert_eq!(report.processed, report.retriable);
    assert!(report.successes + report.failures < report.retriable);
    assert_report_balanced(&report);

    for entity in ["p1", "p2", "p3", "p4"] {
        let history = fixture.store().history(entity, "biography").await.unwrap();
        let latest = history.last().unwrap();
        assert!(latest.status.is_failure() || latest.status.is_success());
        assert!(history.windows(2).all(|w| w[0].version < w[1].version));
        assert!(latest.attempts <= 3);
    }
}

#[tokio::test(start_paused = true)]
async fn test_force_mode_skips_unsupported_stage() {
    let fixture = LedgerFixture::persona_pipeline();
    fixture.succeeded_before("p1", "ml-models").await.unwrap();
    fixture.permanent("p1", "ml-models").await.unwrap();

    let executor = Arc::new(ScriptedExecutor::new());
    let scheduler = fixture.scheduler(executor.clone());

    let report = scheduler
        .run(
            &RunOptions::new(StageSelector::single("supervision-setup"))
                .with_policy(policy(3, 10))
                .with_force(true),
        )
        .await
        .unwrap();
    assert_eq!(report.retriable, 0);
    assert_eq!(executor.call_count(), 0);

    let report = scheduler
        .run(
            &RunOptions::new(StageSelector::single("ml-models"))
                .with_policy(policy(3, 10))
                .with_force(true),
        )
        .await
        .unwrap();
    assert_report_counts(&report, 1, 0, 0);
    assert!(executor.calls_for("p1", "ml-models")[0].force);

    let statuses: Vec<ExecutionStatus> = fixture
        .store()
        .history("p1", "ml-models")
        .await
        .unwrap()
        .iter()
        .map(|r| r.status)
        .collect();
    assert_eq!(
        statuses,
        vec![
            ExecutionStatus::PermanentFailure,
            ExecutionStatus::NeverRun,
            ExecutionStatus::Success
        ]
    );
}

fn two_stage_chain() -> StageRegistry {
    StageRegistry::builder()
        .stage("a", "A")
        .stage("b", "B")
        .after("a")
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_forced_run_skips_successor_of_failed_predecessor() {
    let fixture = LedgerFixture::new(two_stage_chain());
    fixture.succeeded("e1", "a").await.unwrap();
    fixture.succeeded("e1", "b").await.unwrap();

    let executor = Arc::new(
        ScriptedExecutor::new().script("e1", "a", [ExecutionOutcome::permanent("persona rejected")]),
    );
    let scheduler = fixture.scheduler(executor.clone());

    let report = scheduler
        .run(
            &RunOptions::new(StageSelector::All)
                .with_policy(policy(3, 10))
                .with_force(true),
        )
        .await
        .unwrap();

    assert_eq!(report.retriable, 2);
    assert_report_counts(&report, 0, 1, 1);
    assert_eq!(report.per_stage[1].skipped, 1);
    assert!(executor.calls_for("e1", "b").is_empty());
    assert_record(
        &fixture.store().get("e1", "a").await.unwrap(),
        ExecutionStatus::PermanentFailure,
        1,
    );
    assert_eq!(fixture.store().history("e1", "b").await.unwrap().len(), 1);

    // Forcing the successor alone still bypasses the failed predecessor.
    let report = scheduler
        .run(
            &RunOptions::new(StageSelector::single("b"))
                .with_policy(policy(3, 10))
                .with_force(true),
        )
        .await
        .unwrap();

    assert_report_counts(&report, 1, 0, 0);
    assert!(executor.calls_for("e1", "b")[0].force);
}

/// Writes a permanent failure for `e1` on stage `a` after the first
/// successful write to stage `a`.
struct RevokingStore {
    inner: Arc<InMemoryExecutionStore>,
    revoked: AtomicBool,
}

#[async_trait]
impl ExecutionStatusStore for RevokingStore {
    async fn get(&self, entity_id: &str, stage_code: &str) -> Result<ExecutionRecord, StorageError> {
        self.inner.get(entity_id, stage_code).await
    }

    async fn list_failed(
        &self,
        stage_codes: &[String],
        scope: &EntityScope,
    ) -> Result<Vec<ExecutionRecord>, StorageError> {
        self.inner.list_failed(stage_codes, scope).await
    }

    async fn list(
        &self,
        stage_code: &str,
        scope: &EntityScope,
    ) -> Result<Vec<ExecutionRecord>, StorageError> {
        self.inner.list(stage_code, scope).await
    }

    async fn record(
        &self,
        entity_id: &str,
        stage_code: &str,
        outcome: &ExecutionOutcome,
        source: OutcomeSource,
    ) -> Result<ExecutionRecord, StorageError> {
        let recorded = self.inner.record(entity_id, stage_code, outcome, source).await?;
        if stage_code == "a" && !self.revoked.swap(true, Ordering::SeqCst) {
            self.inner
                .seed(ExecutionRecord::failed(
                    "e1",
                    "a",
                    FailureKind::Permanent,
                    "credentials revoked",
                    0,
                ))
                .await?;
        }
        Ok(recorded)
    }

    async fn reset(&self, entity_id: &str, stage_code: &str) -> Result<ExecutionRecord, StorageError> {
        self.inner.reset(entity_id, stage_code).await
    }

    async fn seed(&self, record: ExecutionRecord) -> Result<ExecutionRecord, StorageError> {
        self.inner.seed(record).await
    }

    async fn history(
        &self,
        entity_id: &str,
        stage_code: &str,
    ) -> Result<Vec<ExecutionRecord>, StorageError> {
        self.inner.history(entity_id, stage_code).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_predecessor_lost_mid_run_skips_entity() {
    let fixture = LedgerFixture::new(two_stage_chain());
    fixture.transient("e0", "a", 0).await.unwrap();
    fixture.succeeded("e1", "a").await.unwrap();
    fixture.transient("e1", "b", 0).await.unwrap();

    let store = Arc::new(RevokingStore {
        inner: fixture.store(),
        revoked: AtomicBool::new(false),
    });
    let executor = Arc::new(ScriptedExecutor::new());
    let scheduler = RetryScheduler::new(fixture.registry(), store, executor.clone());

    let report = scheduler
        .run(&RunOptions::new(StageSelector::All).with_policy(policy(3, 10)))
        .await
        .unwrap();

    assert_eq!(report.retriable, 2);
    assert_report_counts(&report, 1, 0, 1);
    assert_eq!(report.per_stage[1].code, "b");
    assert_eq!(report.per_stage[1].skipped, 1);
    assert!(!report.cancelled);
    assert!(executor.calls_for("e1", "b").is_empty());
    assert_record(
        &fixture.store().get("e1", "b").await.unwrap(),
        ExecutionStatus::TransientFailure,
        0,
    );
}
