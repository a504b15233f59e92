//! Testing utilities for recovery runs.
//!
//! This module provides:
//! - A scripted executor with call timing
//! - A store wrapper that injects ledger failures
//! - Ledger fixtures and report assertions

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{
    assert_record, assert_report_balanced, assert_report_counts, assert_same_scan,
};
pub use fixtures::LedgerFixture;
pub use mocks::{ExecutorCall, FailingStore, ScriptedExecutor};
