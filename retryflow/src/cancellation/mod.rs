//! Cooperative cancellation for recovery runs.

mod token;

pub use token::{CancelCallback, CancellationToken};
