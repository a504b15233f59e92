//! Content fingerprints and the guard that keeps successful work from
//! being repeated.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::{ExecutionRecord, ExecutionStatus};

/// Length of a fingerprint in hex characters.
pub const FINGERPRINT_LEN: usize = 32;

/// Hashes the inputs that produced a piece of content.
///
/// Object keys are hashed in sorted order, so equal inputs always give the
/// same fingerprint regardless of how they were built.
#[must_use]
pub fn fingerprint(inputs: &serde_json::Value) -> String {
    fingerprint_fields(inputs, None)
}

/// Hashes only the listed top-level fields of `inputs`.
#[must_use]
pub fn fingerprint_fields(inputs: &serde_json::Value, fields: Option<&[String]>) -> String {
    let to_hash = match fields {
        Some(fields) => {
            let mut filtered = serde_json::Map::new();
            if let Some(obj) = inputs.as_object() {
                for field in fields {
                    if let Some(value) = obj.get(field) {
                        filtered.insert(field.clone(), value.clone());
                    }
                }
            }
            serde_json::Value::Object(filtered)
        }
        None => inputs.clone(),
    };

    let json = serde_json::to_string(&to_hash).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..FINGERPRINT_LEN].to_string()
}

/// What the guard decided for one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum IdempotencyDecision {
    /// The stage may run.
    Execute,
    /// The record already succeeded; running again would duplicate content.
    AlreadySucceeded {
        /// Fingerprint of the inputs behind the existing content.
        fingerprint: Option<String>,
    },
}

impl IdempotencyDecision {
    /// Returns true if the stage may run.
    #[must_use]
    pub fn should_execute(&self) -> bool {
        matches!(self, Self::Execute)
    }
}

/// Refuses to re-run successful records unless force mode is on.
///
/// Success is terminal: without force, only a record outside the success
/// state can be executed again.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdempotencyGuard;

impl IdempotencyGuard {
    /// Decides whether `record` may be executed.
    #[must_use]
    pub fn check(record: &ExecutionRecord, force: bool) -> IdempotencyDecision {
        if record.status == ExecutionStatus::Success && !force {
            IdempotencyDecision::AlreadySucceeded {
                fingerprint: record.content_fingerprint.clone(),
            }
        } else {
            IdempotencyDecision::Execute
        }
    }
}
