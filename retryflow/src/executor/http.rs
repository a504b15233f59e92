//! Executor that triggers stage scripts on a remote generation backend.
//!
//! `POST {base_url}/scripts/{stage}/run` with `{ entityId, stage, force }`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::StageExecutor;
use crate::core::{ExecutionOutcome, FailureKind};
use crate::errors::{RecoveryError, Result};
use crate::pipeline::idempotency::fingerprint;
use crate::registry::Stage;

fn default_timeout_seconds() -> f64 {
    120.0
}

fn default_connect_timeout_seconds() -> f64 {
    5.0
}

/// Connection settings for [`HttpStageExecutor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpExecutorConfig {
    /// Backend root, e.g. `https://api.example.com/v1`.
    pub base_url: String,
    /// Whole-request timeout in seconds. Generation calls are slow.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: f64,
    /// Connect timeout in seconds.
    #[serde(default = "default_connect_timeout_seconds")]
    pub connect_timeout_seconds: f64,
}

impl HttpExecutorConfig {
    /// Creates a config with default timeouts.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout_seconds: default_timeout_seconds(),
            connect_timeout_seconds: default_connect_timeout_seconds(),
        }
    }

    /// Sets the request timeout.
    #[must_use]
    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    fn duration(seconds: f64) -> Result<Duration> {
        Duration::try_from_secs_f64(seconds)
            .map_err(|e| RecoveryError::invalid_request(format!("invalid timeout {seconds}: {e}")))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunScriptRequest<'a> {
    entity_id: &'a str,
    stage: &'a str,
    force: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RunScriptResponse {
    #[serde(default)]
    fingerprint: Option<String>,
}

/// Classifies a non-success HTTP status.
///
/// Timeouts, throttling, and server errors are worth retrying; any other
/// client error means the request itself is wrong.
#[must_use]
pub fn classify_status(status: u16) -> FailureKind {
    match status {
        408 | 425 | 429 => FailureKind::Transient,
        500..=599 => FailureKind::Transient,
        _ => FailureKind::Permanent,
    }
}

fn classify_transport(err: &reqwest::Error) -> FailureKind {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        FailureKind::Transient
    } else {
        FailureKind::Permanent
    }
}

fn outcome_for(kind: FailureKind, message: String) -> ExecutionOutcome {
    if kind.is_retriable() {
        ExecutionOutcome::transient(message)
    } else {
        ExecutionOutcome::permanent(message)
    }
}

/// [`StageExecutor`] backed by the generation backend's REST API.
#[derive(Debug, Clone)]
pub struct HttpStageExecutor {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStageExecutor {
    /// Builds the executor and its HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`RecoveryError::InvalidRequest`] for an unusable URL or timeout.
    pub fn new(config: &HttpExecutorConfig) -> Result<Self> {
        let base = reqwest::Url::parse(&config.base_url).map_err(|e| {
            RecoveryError::invalid_request(format!("invalid backend URL '{}': {e}", config.base_url))
        })?;

        let client = reqwest::Client::builder()
            .timeout(HttpExecutorConfig::duration(config.timeout_seconds)?)
            .connect_timeout(HttpExecutorConfig::duration(config.connect_timeout_seconds)?)
            .build()
            .map_err(|e| RecoveryError::invalid_request(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base.as_str().trim_end_matches('/').to_string(),
        })
    }

    /// Returns the endpoint that runs `stage_code`.
    #[must_use]
    pub fn endpoint(&self, stage_code: &str) -> String {
        format!("{}/scripts/{stage_code}/run", self.base_url)
    }
}

#[async_trait]
impl StageExecutor for HttpStageExecutor {
    async fn execute(&self, entity_id: &str, stage: &Stage, force: bool) -> ExecutionOutcome {
        let endpoint = self.endpoint(&stage.code);
        let request = RunScriptRequest {
            entity_id,
            stage: &stage.code,
            force,
        };

        debug!(entity_id, stage = %stage.code, force, %endpoint, "Calling stage backend");

        let response = match self.client.post(&endpoint).json(&request).send().await {
            Ok(response) => response,
            Err(err) => {
                let kind = classify_transport(&err);
                warn!(entity_id, stage = %stage.code, error = %err, %kind, "Stage request failed");
                return outcome_for(kind, format!("request to {endpoint} failed: {err}"));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let kind = classify_status(status.as_u16());
            return outcome_for(kind, format!("backend returned {status}: {body}"));
        }

        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(err) => {
                let kind = classify_transport(&err);
                return outcome_for(kind, format!("failed to read backend response: {err}"));
            }
        };

        let body: RunScriptResponse = if bytes.is_empty() {
            RunScriptResponse::default()
        } else {
            match serde_json::from_slice(&bytes) {
                Ok(body) => body,
                Err(err) => {
                    return ExecutionOutcome::permanent(format!("malformed backend response: {err}"));
                }
            }
        };

        let fingerprint = body.fingerprint.or_else(|| {
            Some(fingerprint(&serde_json::json!({
                "entityId": entity_id,
                "stage": stage.code,
            })))
        });

        ExecutionOutcome::success(fingerprint)
    }
}
