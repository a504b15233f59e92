//! Request and response types of the retry panel boundary, and the
//! service that answers them.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::cancellation::CancellationToken;
use crate::config::RecoveryConfig;
use crate::core::RetryReport;
use crate::errors::{RecoveryError, Result};
use crate::events::{EventSink, NoOpEventSink};
use crate::executor::StageExecutor;
use crate::pipeline::{FailureScanner, RetryPolicy, RetryScheduler, RunOptions, ScanRequest};
use crate::registry::{StageRegistry, StageSelector};
use crate::store::{EntityScope, ExecutionStatusStore, FileExecutionStore, InMemoryExecutionStore};

/// A retry request from the UI.
///
/// Omitted policy fields fall back to the service configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryRequest {
    /// Company whose entities are considered. Blank means every entity.
    #[serde(default)]
    pub empresa_id: String,
    /// A stage code, or `ALL`.
    pub script: String,
    /// Scan and report without retrying.
    #[serde(default)]
    pub report_only: bool,
    /// Attempt budget per (entity, stage).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Initial backoff delay in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    /// Backoff multiplier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<f64>,
    /// Reset and re-run terminal records on stages that allow it.
    #[serde(default)]
    pub force_mode: bool,
    /// Entities retried at once within a stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
}

impl RetryRequest {
    /// Creates a request for `script` over every entity of `empresa_id`.
    #[must_use]
    pub fn new(empresa_id: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            empresa_id: empresa_id.into(),
            script: script.into(),
            report_only: false,
            max_retries: None,
            delay: None,
            backoff: None,
            force_mode: false,
            concurrency: None,
        }
    }

    /// Makes the request report-only.
    #[must_use]
    pub fn report_only(mut self) -> Self {
        self.report_only = true;
        self
    }

    /// Overrides the policy fields.
    #[must_use]
    pub fn with_policy(mut self, max_retries: u32, delay_ms: u64, backoff: f64) -> Self {
        self.max_retries = Some(max_retries);
        self.delay = Some(delay_ms);
        self.backoff = Some(backoff);
        self
    }

    /// Sets force mode.
    #[must_use]
    pub fn with_force(mut self, force: bool) -> Self {
        self.force_mode = force;
        self
    }

    /// Returns `base` with this request's overrides applied.
    #[must_use]
    pub fn policy(&self, base: &RetryPolicy) -> RetryPolicy {
        let mut policy = base.clone();
        if let Some(max_retries) = self.max_retries {
            policy.max_retries = max_retries;
        }
        if let Some(delay) = self.delay {
            policy.initial_delay_ms = delay;
        }
        if let Some(backoff) = self.backoff {
            policy.backoff_multiplier = backoff;
        }
        policy
    }
}

/// The response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryResponse {
    /// Whether the request completed.
    pub success: bool,
    /// The report. On an aborted run, the partial report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<RetryReport>,
    /// What went wrong.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RetryResponse {
    /// A successful response.
    #[must_use]
    pub fn ok(report: RetryReport) -> Self {
        Self {
            success: true,
            data: Some(report),
            error: None,
        }
    }

    /// A failed response.
    #[must_use]
    pub fn err(error: &RecoveryError) -> Self {
        Self {
            success: false,
            data: error.partial_report().cloned(),
            error: Some(error.to_string()),
        }
    }
}

impl From<Result<RetryReport>> for RetryResponse {
    fn from(result: Result<RetryReport>) -> Self {
        match result {
            Ok(report) => Self::ok(report),
            Err(e) => Self::err(&e),
        }
    }
}

/// Answers [`RetryRequest`]s against a registry and ledger.
#[derive(Clone)]
pub struct RecoveryService {
    registry: Arc<StageRegistry>,
    store: Arc<dyn ExecutionStatusStore>,
    executor: Option<Arc<dyn StageExecutor>>,
    events: Arc<dyn EventSink>,
    config: RecoveryConfig,
}

impl std::fmt::Debug for RecoveryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryService")
            .field("stages", &self.registry.len())
            .field("has_executor", &self.executor.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RecoveryService {
    /// Creates a report-only service with the default configuration.
    #[must_use]
    pub fn new(registry: Arc<StageRegistry>, store: Arc<dyn ExecutionStatusStore>) -> Self {
        Self {
            registry,
            store,
            executor: None,
            events: Arc::new(NoOpEventSink),
            config: RecoveryConfig::default(),
        }
    }

    /// Creates a service whose ledger follows `config.ledger_path`.
    pub async fn from_config(registry: Arc<StageRegistry>, config: RecoveryConfig) -> Result<Self> {
        config.validate()?;
        let store: Arc<dyn ExecutionStatusStore> = match &config.ledger_path {
            Some(path) => Arc::new(FileExecutionStore::open(path).await?),
            None => Arc::new(InMemoryExecutionStore::new()),
        };
        Ok(Self::new(registry, store).with_config(config))
    }

    /// Sets the executor. Without one, only report-only requests succeed.
    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn StageExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Sets the event sink used by runs.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sets the configuration.
    #[must_use]
    pub fn with_config(mut self, config: RecoveryConfig) -> Self {
        self.config = config;
        self
    }

    /// Returns the ledger.
    #[must_use]
    pub fn store(&self) -> Arc<dyn ExecutionStatusStore> {
        self.store.clone()
    }

    /// Returns the registry.
    #[must_use]
    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    /// Answers a request. Never fails: errors become `success: false`.
    pub async fn handle(&self, request: &RetryRequest) -> RetryResponse {
        self.execute(request, None).await.into()
    }

    /// Answers a request that `cancel` may stop early.
    pub async fn handle_with_cancel(
        &self,
        request: &RetryRequest,
        cancel: Arc<CancellationToken>,
    ) -> RetryResponse {
        self.execute(request, Some(cancel)).await.into()
    }

    /// Runs or scans per the request.
    pub async fn execute(
        &self,
        request: &RetryRequest,
        cancel: Option<Arc<CancellationToken>>,
    ) -> Result<RetryReport> {
        let selector: StageSelector = request.script.parse()?;
        let scope = EntityScope::owner(request.empresa_id.as_str());
        let policy = request.policy(&self.config.policy);
        policy.validate()?;

        info!(
            company = %request.empresa_id,
            script = %selector,
            report_only = request.report_only,
            force = request.force_mode,
            "Handling retry request"
        );

        if request.report_only {
            let scan = ScanRequest::new(selector)
                .with_scope(scope)
                .with_max_retries(policy.max_retries)
                .with_force(request.force_mode);
            return FailureScanner::new(self.registry.clone(), self.store.clone())
                .scan(&scan)
                .await;
        }

        let Some(executor) = self.executor.clone() else {
            warn!("Run requested without a stage executor");
            return Err(RecoveryError::invalid_request(
                "no stage executor configured; only reportOnly requests are accepted",
            ));
        };

        let mut options = RunOptions::new(selector)
            .with_scope(scope)
            .with_policy(policy)
            .with_force(request.force_mode)
            .with_concurrency(request.concurrency.unwrap_or(self.config.concurrency));

        if let Some(token) = self.run_token(cancel) {
            options = options.with_cancellation(token);
        }

        RetryScheduler::new(self.registry.clone(), self.store.clone(), executor)
            .with_event_sink(self.events.clone())
            .run(&options)
            .await
    }

    fn run_token(&self, cancel: Option<Arc<CancellationToken>>) -> Option<Arc<CancellationToken>> {
        match (cancel, self.config.deadline()) {
            (cancel, None) => cancel,
            (Some(parent), Some(deadline)) => {
                let token = parent.child();
                token.cancel_after(deadline);
                Some(token)
            }
            (None, Some(deadline)) => Some(CancellationToken::with_deadline(deadline)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ExecutionStatus;
    use crate::testing::{LedgerFixture, ScriptedExecutor};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_request_defaults_from_json() {
        let request: RetryRequest =
            serde_json::from_value(json!({"empresaId": "acme", "script": "ALL"})).unwrap();

        assert!(!request.report_only);
        assert!(!request.force_mode);
        let policy = request.policy(&RetryPolicy::default());
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.initial_delay_ms, 2000);
        assert!((policy.backoff_multiplier - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_response_shapes() {
        let ok = serde_json::to_value(RetryResponse::ok(RetryReport::default())).unwrap();
        assert_eq!(ok["success"], true);
        assert_eq!(ok["data"]["totalFailed"], 0);
        assert!(ok.get("error").is_none());

        let err = RetryResponse::err(&RecoveryError::StageNotFound("nope".to_string()));
        let err = serde_json::to_value(err).unwrap();
        assert_eq!(err, json!({"success": false, "error": "Stage not found: nope"}));
    }

    #[tokio::test]
    async fn test_report_only_without_executor() {
        let fixture = LedgerFixture::persona_pipeline().with_owner("acme");
        fixture.transient("p1", "biography", 0).await.unwrap();
        let service = RecoveryService::new(fixture.registry(), fixture.store());

        let response = service
            .handle(&RetryRequest::new("acme", "biography").report_only())
            .await;

        assert!(response.success);
        let report = response.data.unwrap();
        assert_eq!(report.total_failed, 1);
        assert_eq!(report.retriable, 1);
        assert_eq!(report.processed, 0);
    }

    #[tokio::test]
    async fn test_run_without_executor_fails() {
        let fixture = LedgerFixture::persona_pipeline();
        let service = RecoveryService::new(fixture.registry(), fixture.store());

        let response = service.handle(&RetryRequest::new("acme", "ALL")).await;
        assert!(!response.success);
        assert!(response.error.unwrap().contains("reportOnly"));
    }

    #[tokio::test]
    async fn test_unknown_script_fails() {
        let fixture = LedgerFixture::persona_pipeline();
        let service = RecoveryService::new(fixture.registry(), fixture.store());

        let response = service
            .handle(&RetryRequest::new("acme", "horoscope").report_only())
            .await;
        assert_eq!(response.error.as_deref(), Some("Stage not found: horoscope"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_scopes_to_company() {
        let acme = LedgerFixture::persona_pipeline().with_owner("acme");
        acme.transient("p1", "biography", 0).await.unwrap();
        let globex = acme.clone().with_owner("globex");
        globex.transient("p2", "biography", 0).await.unwrap();

        let executor = Arc::new(ScriptedExecutor::new());
        let service = RecoveryService::new(acme.registry(), acme.store()).with_executor(executor.clone());

        let response = service
            .handle(&RetryRequest::new("acme", "biography").with_policy(3, 10, 2.0))
            .await;

        assert!(response.success);
        assert_eq!(response.data.unwrap().successes, 1);
        assert_eq!(executor.call_count(), 1);
        assert_eq!(
            acme.store().get("p2", "biography").await.unwrap().status,
            ExecutionStatus::TransientFailure
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_deadline_cancels_run() {
        let fixture = LedgerFixture::persona_pipeline();
        fixture.transient("p1", "biography", 0).await.unwrap();

        let service = RecoveryService::new(fixture.registry(), fixture.store())
            .with_executor(Arc::new(ScriptedExecutor::new()))
            .with_config(RecoveryConfig::default().with_deadline_ms(50));

        let report = service
            .execute(&RetryRequest::new("", "biography").with_policy(3, 1000, 2.0), None)
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.processed, report.retriable);
    }

    #[tokio::test]
    async fn test_from_config_opens_file_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let config = RecoveryConfig::default().with_ledger_path(&path);

        let service = RecoveryService::from_config(Arc::new(StageRegistry::persona_pipeline()), config)
            .await
            .unwrap();
        service
            .store()
            .seed(crate::core::ExecutionRecord::succeeded("p1", "biography", None))
            .await
            .unwrap();

        assert!(path.exists());
    }
}
