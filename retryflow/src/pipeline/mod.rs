//! Failure recovery.
//!
//! This module provides:
//! - Retry policy and backoff schedule
//! - Idempotency checks on execution records
//! - Failure scanning and classification
//! - The retry scheduler

pub mod idempotency;
pub mod retry;
pub mod scanner;
pub mod scheduler;

#[cfg(test)]
mod integration_tests;

pub use idempotency::{fingerprint, IdempotencyDecision, IdempotencyGuard};
pub use retry::{JitterStrategy, RetryAttempt, RetryPolicy};
pub use scanner::{classify, Classification, FailureScanner, ScanEntry, ScanPlan, ScanRequest, StageScan};
pub use scheduler::{RetryScheduler, RunOptions, DEFAULT_CONCURRENCY};
