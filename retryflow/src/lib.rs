//! # Retryflow
//!
//! Failure recovery for dependency-ordered generation pipelines.
//!
//! Every (entity, stage) pair has an execution record in a ledger. Retryflow
//! finds the records that failed, decides which of them may be retried, and
//! retries them with exponential backoff while respecting:
//!
//! - **Stage dependencies**: a stage is only retried once its predecessor succeeded
//! - **Attempt budgets**: attempts are persistent and cumulative across runs
//! - **Idempotency**: a succeeded record is never re-run unless forced
//! - **Bounded concurrency**: the executor backend is a shared, rate-limited resource
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use retryflow::prelude::*;
//!
//! let service = RecoveryService::new(Arc::new(StageRegistry::persona_pipeline()), store)
//!     .with_executor(executor);
//!
//! let response = service
//!     .handle(&RetryRequest::new("acme", "ALL").with_policy(3, 2000, 2.0))
//!     .await;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod api;
pub mod cancellation;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod executor;
pub mod observability;
pub mod pipeline;
pub mod registry;
pub mod store;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::api::{RecoveryService, RetryRequest, RetryResponse};
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::RecoveryConfig;
    pub use crate::core::{
        ExecutionOutcome, ExecutionRecord, ExecutionStatus, FailureKind, OutcomeSource,
        RetryReport, StageReport,
    };
    pub use crate::errors::{RecoveryError, RegistryError, StorageError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::executor::StageExecutor;
    #[cfg(feature = "http")]
    pub use crate::executor::{HttpExecutorConfig, HttpStageExecutor};
    pub use crate::observability::{init_logging, LogFormat};
    pub use crate::pipeline::{
        FailureScanner, RetryPolicy, RetryScheduler, RunOptions, ScanRequest,
    };
    pub use crate::registry::{Stage, StageRegistry, StageSelector};
    pub use crate::store::{
        EntityScope, ExecutionStatusStore, FileExecutionStore, InMemoryExecutionStore,
    };
}
