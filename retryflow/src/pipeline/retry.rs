//! Retry policy with exponential backoff and optional jitter.
//!
//! The n-th retry of an entity within one run waits
//! `initial_delay_ms * backoff_multiplier^(n-1)`, optionally capped and
//! jittered. The attempt budget itself is tracked in the ledger.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{RecoveryError, Result};

/// Jitter strategy to prevent thundering herd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// Exact delays.
    #[default]
    None,
    /// Random from 0 to delay.
    Full,
    /// Half fixed, half random.
    Equal,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    2000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

/// How many times to retry and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total retry attempts allowed per (entity, stage), across runs.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Growth factor between consecutive delays.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound on any single delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    /// Jitter applied on top of the computed delay.
    #[serde(default)]
    pub jitter: JitterStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: None,
            jitter: JitterStrategy::None,
        }
    }
}

impl RetryPolicy {
    /// Creates the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the attempt budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the first delay.
    #[must_use]
    pub fn with_initial_delay_ms(mut self, delay: u64) -> Self {
        self.initial_delay_ms = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Caps every delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = Some(delay);
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Rejects policies that cannot schedule anything sensible.
    ///
    /// # Errors
    ///
    /// Returns [`RecoveryError::InvalidRequest`] for a zero attempt budget or
    /// a negative or non-finite multiplier.
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(RecoveryError::invalid_request("maxRetries must be at least 1"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 0.0 {
            return Err(RecoveryError::invalid_request(format!(
                "backoff must be a finite, non-negative number, got {}",
                self.backoff_multiplier
            )));
        }
        Ok(())
    }

    /// Returns the un-jittered delay in milliseconds before attempt `n` (1-based).
    ///
    /// Attempt 0 is treated as attempt 1. Saturates at `u64::MAX`.
    #[must_use]
    pub fn base_delay_ms(&self, n: u32) -> u64 {
        let exponent = i32::try_from(n.saturating_sub(1)).unwrap_or(i32::MAX);
        let raw = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);

        let delay = if raw.is_nan() || raw <= 0.0 {
            0
        } else if raw >= u64::MAX as f64 {
            u64::MAX
        } else {
            raw.round() as u64
        };

        match self.max_delay_ms {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    /// Returns the delay before attempt `n`, jitter included.
    #[must_use]
    pub fn delay_for(&self, n: u32) -> Duration {
        let delay = self.base_delay_ms(n);

        let jittered = match self.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };

        Duration::from_millis(jittered)
    }

    /// Returns true if a record with `attempts` retries has budget left.
    #[must_use]
    pub fn has_budget(&self, attempts: u32) -> bool {
        attempts < self.max_retries
    }
}

/// One scheduled retry. Lives only for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryAttempt {
    /// Entity being retried.
    pub entity_id: String,
    /// Stage being retried.
    pub stage_code: String,
    /// 1-based attempt number within the run.
    pub attempt_number: u32,
    /// Wait before the executor is invoked.
    pub scheduled_delay: Duration,
}

impl RetryAttempt {
    /// Schedules attempt `attempt_number` under `policy`.
    #[must_use]
    pub fn schedule(
        entity_id: impl Into<String>,
        stage_code: impl Into<String>,
        attempt_number: u32,
        policy: &RetryPolicy,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            stage_code: stage_code.into(),
            attempt_number,
            scheduled_delay: policy.delay_for(attempt_number),
        }
    }

    /// Returns the scheduled delay in whole milliseconds.
    #[must_use]
    pub fn delay_ms(&self) -> u64 {
        u64::try_from(self.scheduled_delay.as_millis()).unwrap_or(u64::MAX)
    }
}
