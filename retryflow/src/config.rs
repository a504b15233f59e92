//! Configuration for recovery runs.
//!
//! Values come from defaults, then an optional JSON file, then
//! `RETRYFLOW_*` environment variables, then explicit builder calls.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::errors::{RecoveryError, Result};
use crate::observability::LogFormat;
use crate::pipeline::{RetryPolicy, DEFAULT_CONCURRENCY};

#[cfg(feature = "http")]
use crate::executor::HttpExecutorConfig;

/// Environment variable overriding `policy.max_retries`.
pub const ENV_MAX_RETRIES: &str = "RETRYFLOW_MAX_RETRIES";
/// Environment variable overriding `policy.initial_delay_ms`.
pub const ENV_DELAY_MS: &str = "RETRYFLOW_DELAY_MS";
/// Environment variable overriding `policy.backoff_multiplier`.
pub const ENV_BACKOFF: &str = "RETRYFLOW_BACKOFF";
/// Environment variable overriding `concurrency`.
pub const ENV_CONCURRENCY: &str = "RETRYFLOW_CONCURRENCY";
/// Environment variable overriding `ledger_path`.
pub const ENV_LEDGER: &str = "RETRYFLOW_LEDGER";
/// Environment variable overriding `deadline_ms`.
pub const ENV_DEADLINE_MS: &str = "RETRYFLOW_DEADLINE_MS";
/// Environment variable overriding `log_format`.
pub const ENV_LOG_FORMAT: &str = "RETRYFLOW_LOG_FORMAT";
/// Environment variable setting the executor backend URL.
#[cfg(feature = "http")]
pub const ENV_BACKEND_URL: &str = "RETRYFLOW_BACKEND_URL";

/// Settings shared by every run of a recovery service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryConfig {
    /// Attempt budget and backoff.
    #[serde(default)]
    pub policy: RetryPolicy,
    /// Entities retried at once within a stage.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Ledger file. In-memory when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_path: Option<PathBuf>,
    /// Cooperative deadline for a run, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
    /// Backend that executes stages.
    #[cfg(feature = "http")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<HttpExecutorConfig>,
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::default(),
            concurrency: default_concurrency(),
            ledger_path: None,
            deadline_ms: None,
            log_format: LogFormat::default(),
            #[cfg(feature = "http")]
            executor: None,
        }
    }
}

impl RecoveryConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a JSON configuration file. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Builds a configuration from defaults and the process environment.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Applies `RETRYFLOW_*` overrides read through `lookup`.
    ///
    /// Blank values are ignored. Unparsable values are rejected.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(value) = get(ENV_MAX_RETRIES) {
            self.policy.max_retries = parse_env(ENV_MAX_RETRIES, &value)?;
        }
        if let Some(value) = get(ENV_DELAY_MS) {
            self.policy.initial_delay_ms = parse_env(ENV_DELAY_MS, &value)?;
        }
        if let Some(value) = get(ENV_BACKOFF) {
            self.policy.backoff_multiplier = parse_env(ENV_BACKOFF, &value)?;
        }
        if let Some(value) = get(ENV_CONCURRENCY) {
            self.concurrency = parse_env(ENV_CONCURRENCY, &value)?;
        }
        if let Some(value) = get(ENV_LEDGER) {
            self.ledger_path = Some(PathBuf::from(value.trim()));
        }
        if let Some(value) = get(ENV_DEADLINE_MS) {
            self.deadline_ms = Some(parse_env(ENV_DEADLINE_MS, &value)?);
        }
        if let Some(value) = get(ENV_LOG_FORMAT) {
            self.log_format = value.parse()?;
        }
        #[cfg(feature = "http")]
        if let Some(value) = get(ENV_BACKEND_URL) {
            self.executor = Some(HttpExecutorConfig::new(value.trim()));
        }

        self.validate()?;
        Ok(self)
    }

    /// Checks the policy.
    pub fn validate(&self) -> Result<()> {
        self.policy.validate()
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the concurrency bound.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Persists the ledger at `path`.
    #[must_use]
    pub fn with_ledger_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ledger_path = Some(path.into());
        self
    }

    /// Sets the run deadline.
    #[must_use]
    pub fn with_deadline_ms(mut self, deadline_ms: u64) -> Self {
        self.deadline_ms = Some(deadline_ms);
        self
    }

    /// Sets the log format.
    #[must_use]
    pub fn with_log_format(mut self, format: LogFormat) -> Self {
        self.log_format = format;
        self
    }

    /// Sets the executor backend.
    #[cfg(feature = "http")]
    #[must_use]
    pub fn with_executor(mut self, executor: HttpExecutorConfig) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Returns the concurrency bound, at least one.
    #[must_use]
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.max(1)
    }

    /// Returns the run deadline as a `Duration`.
    #[must_use]
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| RecoveryError::invalid_request(format!("{key}: cannot parse '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::io::Write;
    use tokio_test::{assert_err, assert_ok};

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RecoveryConfig::new();
        assert_eq!(config.policy.max_retries, 3);
        assert_eq!(config.policy.initial_delay_ms, 2000);
        assert_eq!(config.concurrency, 4);
        assert!(config.ledger_path.is_none());
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[test]
    fn test_env_overrides() {
        let config = assert_ok!(RecoveryConfig::default().with_env_overrides(env(&[
            (ENV_MAX_RETRIES, "5"),
            (ENV_DELAY_MS, "100"),
            (ENV_BACKOFF, "1.5"),
            (ENV_CONCURRENCY, "0"),
            (ENV_LEDGER, "/tmp/ledger.jsonl"),
            (ENV_LOG_FORMAT, "json"),
            (ENV_DEADLINE_MS, " "),
        ])));

        assert_eq!(config.policy.max_retries, 5);
        assert_eq!(config.policy.initial_delay_ms, 100);
        assert!((config.policy.backoff_multiplier - 1.5).abs() < f64::EPSILON);
        assert_eq!(config.effective_concurrency(), 1);
        assert_eq!(config.ledger_path, Some(PathBuf::from("/tmp/ledger.jsonl")));
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(config.deadline().is_none());
    }

    #[test]
    fn test_env_rejects_garbage() {
        let err = assert_err!(
            RecoveryConfig::default().with_env_overrides(env(&[(ENV_MAX_RETRIES, "many")]))
        );
        assert!(err.to_string().contains(ENV_MAX_RETRIES));

        let err = assert_err!(
            RecoveryConfig::default().with_env_overrides(env(&[(ENV_MAX_RETRIES, "0")]))
        );
        assert!(matches!(err, RecoveryError::InvalidRequest(_)));
    }

    #[test]
    fn test_from_json_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"policy": {{"maxRetries": 2}}, "deadlineMs": 5000, "logFormat": "json"}}"#
        )
        .unwrap();

        let config = RecoveryConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.policy.max_retries, 2);
        assert_eq!(config.policy.initial_delay_ms, 2000);
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.deadline(), Some(Duration::from_secs(5)));
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_from_json_file_missing() {
        let err = RecoveryConfig::from_json_file("/nonexistent/retryflow.json").unwrap_err();
        assert!(matches!(err, RecoveryError::Io(_)));
    }
}
