//! The execution ledger.
//!
//! Every (entity, stage) pair has a history of [`ExecutionRecord`]
//! snapshots. Readers see the latest snapshot; nothing is ever deleted.

mod file;
mod memory;

pub use file::FileExecutionStore;
pub use memory::InMemoryExecutionStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::core::{ExecutionOutcome, ExecutionRecord, ExecutionStatus, OutcomeSource};
use crate::errors::StorageError;
use crate::registry::Stage;

/// Which entities an operation covers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "value", rename_all = "snake_case")]
pub enum EntityScope {
    /// Every entity in the ledger.
    #[default]
    All,
    /// Entities owned by one company.
    Owner(String),
    /// An explicit set of entity ids.
    Entities(BTreeSet<String>),
}

impl EntityScope {
    /// Scopes to a company, or to everything when `owner_id` is blank.
    #[must_use]
    pub fn owner(owner_id: impl Into<String>) -> Self {
        let owner_id = owner_id.into();
        if owner_id.trim().is_empty() {
            Self::All
        } else {
            Self::Owner(owner_id)
        }
    }

    /// Scopes to the given entity ids.
    #[must_use]
    pub fn entities<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Entities(ids.into_iter().map(Into::into).collect())
    }

    /// Returns true if `record` falls inside the scope.
    #[must_use]
    pub fn matches(&self, record: &ExecutionRecord) -> bool {
        match self {
            Self::All => true,
            Self::Owner(owner) => record.owner_id.as_deref() == Some(owner.as_str()),
            Self::Entities(ids) => ids.contains(&record.entity_id),
        }
    }
}

/// Persisted ledger of execution outcomes.
///
/// Implementations must isolate writes per (entity, stage) key: writes to
/// disjoint keys may run concurrently. Any read or write problem is
/// reported as a [`StorageError`].
#[async_trait]
pub trait ExecutionStatusStore: Send + Sync {
    /// Returns the latest snapshot, or a never-run placeholder.
    async fn get(&self, entity_id: &str, stage_code: &str) -> Result<ExecutionRecord, StorageError>;

    /// Returns latest snapshots in a failure state for the given stages,
    /// ordered by stage (as given) then entity id.
    async fn list_failed(
        &self,
        stage_codes: &[String],
        scope: &EntityScope,
    ) -> Result<Vec<ExecutionRecord>, StorageError>;

    /// Returns every latest snapshot of a stage within scope, ordered by entity id.
    async fn list(
        &self,
        stage_code: &str,
        scope: &EntityScope,
    ) -> Result<Vec<ExecutionRecord>, StorageError>;

    /// Appends the snapshot that follows `outcome` and returns it.
    async fn record(
        &self,
        entity_id: &str,
        stage_code: &str,
        outcome: &ExecutionOutcome,
        source: OutcomeSource,
    ) -> Result<ExecutionRecord, StorageError>;

    /// Appends a force reset snapshot (back to never-run, attempts 0).
    async fn reset(&self, entity_id: &str, stage_code: &str) -> Result<ExecutionRecord, StorageError>;

    /// Appends a ready-made snapshot, typically from an original execution.
    ///
    /// The version is assigned by the store.
    async fn seed(&self, record: ExecutionRecord) -> Result<ExecutionRecord, StorageError>;

    /// Returns every snapshot of the pair, oldest first.
    async fn history(
        &self,
        entity_id: &str,
        stage_code: &str,
    ) -> Result<Vec<ExecutionRecord>, StorageError>;

    /// Returns true if `stage` has no predecessor or the predecessor
    /// succeeded for the entity.
    async fn is_predecessor_satisfied(
        &self,
        entity_id: &str,
        stage: &Stage,
    ) -> Result<bool, StorageError> {
        match stage.predecessor.as_deref() {
            None => Ok(true),
            Some(predecessor) => Ok(self.get(entity_id, predecessor).await?.status
                == ExecutionStatus::Success),
        }
    }
}
