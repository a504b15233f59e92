//! The boundary to the code that actually generates stage content.
//!
//! Executors never fail with an error: every problem is classified into an
//! [`ExecutionOutcome`] and recorded in the ledger by the caller.

#[cfg(feature = "http")]
mod http;

#[cfg(feature = "http")]
pub use http::{classify_status, HttpExecutorConfig, HttpStageExecutor};

use async_trait::async_trait;

use crate::core::ExecutionOutcome;
use crate::registry::Stage;

/// Performs the generation work of one stage for one entity.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Runs `stage` for `entity_id`. `force` asks the backend to regenerate
    /// content even if it believes it already has it.
    async fn execute(&self, entity_id: &str, stage: &Stage, force: bool) -> ExecutionOutcome;
}
