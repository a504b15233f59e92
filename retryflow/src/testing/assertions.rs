//! Test assertions for recovery reports and ledger records.

use crate::core::{ExecutionRecord, ExecutionStatus, RetryReport};

/// Asserts that `processed` equals `successes + failures + skipped`.
pub fn assert_report_balanced(report: &RetryReport) {
    assert!(
        report.is_balanced(),
        "Unbalanced report: processed={} successes={} failures={} skipped={}",
        report.processed,
        report.successes,
        report.failures,
        report.skipped
    );
}

/// Asserts the outcome counts of a report, and that it balances.
pub fn assert_report_counts(report: &RetryReport, successes: usize, failures: usize, skipped: usize) {
    assert_eq!(
        (report.successes, report.failures, report.skipped),
        (successes, failures, skipped),
        "Expected (successes, failures, skipped) = ({successes}, {failures}, {skipped}), got {report}"
    );
    assert_report_balanced(report);
}

/// Asserts that the scan halves of two reports agree.
pub fn assert_same_scan(left: &RetryReport, right: &RetryReport) {
    assert_eq!(
        (left.total_failed, left.retriable, left.not_retriable),
        (right.total_failed, right.retriable, right.not_retriable),
        "Scan counts differ: {left} vs {right}"
    );
}

/// Asserts the status and attempt count of a record.
pub fn assert_record(record: &ExecutionRecord, status: ExecutionStatus, attempts: u32) {
    assert_eq!(
        (record.status, record.attempts),
        (status, attempts),
        "Unexpected state for {}",
        record.key()
    );
}
