//! Core domain model types for retryflow.
//!
//! This module contains the value types shared by every component:
//! - Execution status and failure classification enums
//! - Ledger records and executor outcomes
//! - Retry reports and their accumulator

mod record;
mod report;
mod status;

pub use record::{ExecutionOutcome, ExecutionRecord, LastError, OutcomeSource, RecordKey};
pub use report::{
    NotRetriableBreakdown, NotRetriableReason, ReportAccumulator, Resolution, RetryReport,
    SkipReason, StageReport,
};
pub use status::{ExecutionStatus, FailureKind};
