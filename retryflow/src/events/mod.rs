//! Lifecycle events emitted by recovery runs.
//!
//! Events complement `tracing` output: they carry the same structured
//! fields as JSON payloads so that callers can observe a run without
//! installing a subscriber.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Names of the events emitted by the scheduler.
pub mod event_types {
    /// A run started; carries the scan counts.
    pub const RUN_STARTED: &str = "recovery.run.started";
    /// A retry was scheduled; carries the attempt number and delay.
    pub const ATTEMPT_SCHEDULED: &str = "recovery.attempt.scheduled";
    /// The executor returned for an attempt.
    pub const ATTEMPT_COMPLETED: &str = "recovery.attempt.completed";
    /// An entity reached its final resolution for the run.
    pub const ENTITY_RESOLVED: &str = "recovery.entity.resolved";
    /// A run finished normally.
    pub const RUN_COMPLETED: &str = "recovery.run.completed";
    /// A run stopped early on cancellation.
    pub const RUN_CANCELLED: &str = "recovery.run.cancelled";
    /// A run stopped on a ledger failure.
    pub const RUN_ABORTED: &str = "recovery.run.aborted";
}
