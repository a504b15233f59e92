//! Run spans and timing.

use tokio::time::Instant;
use tracing::Span;

use crate::registry::StageSelector;

/// Creates the span that wraps one recovery run.
#[must_use]
pub fn run_span(run_id: &str, selector: &StageSelector, force: bool) -> Span {
    tracing::info_span!("recovery_run", run_id = %run_id, script = %selector, force)
}

/// Measures the wall-clock duration of a run.
///
/// Uses the Tokio clock, so paused-time tests see simulated durations.
#[derive(Debug, Clone, Copy)]
pub struct RunTimer {
    start: Instant,
}

impl RunTimer {
    /// Starts timing.
    #[must_use]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Returns the elapsed time in whole milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}
