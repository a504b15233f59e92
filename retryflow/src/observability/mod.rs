//! Logging setup and run instrumentation.

mod logging;
mod tracing;

pub use self::logging::{init_logging, LogFormat};
pub use self::tracing::{run_span, RunTimer};
