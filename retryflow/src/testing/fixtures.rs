//! Ledger fixtures for recovery tests.

use std::sync::Arc;

use crate::core::{ExecutionRecord, FailureKind};
use crate::errors::StorageError;
use crate::executor::StageExecutor;
use crate::pipeline::{FailureScanner, RetryScheduler};
use crate::registry::StageRegistry;
use crate::store::{ExecutionStatusStore, InMemoryExecutionStore};

/// An in-memory ledger paired with a registry, with shortcuts for seeding.
#[derive(Debug, Clone)]
pub struct LedgerFixture {
    registry: Arc<StageRegistry>,
    store: Arc<InMemoryExecutionStore>,
    owner: Option<String>,
}

impl Default for LedgerFixture {
    fn default() -> Self {
        Self::persona_pipeline()
    }
}

impl LedgerFixture {
    /// Creates an empty ledger over `registry`.
    #[must_use]
    pub fn new(registry: StageRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            store: Arc::new(InMemoryExecutionStore::new()),
            owner: None,
        }
    }

    /// Creates an empty ledger over the persona pipeline.
    #[must_use]
    pub fn persona_pipeline() -> Self {
        Self::new(StageRegistry::persona_pipeline())
    }

    /// Tags every record seeded afterwards with `owner_id`.
    #[must_use]
    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner = Some(owner_id.into());
        self
    }

    /// Returns the registry.
    #[must_use]
    pub fn registry(&self) -> Arc<StageRegistry> {
        self.registry.clone()
    }

    /// Returns the ledger.
    #[must_use]
    pub fn store(&self) -> Arc<InMemoryExecutionStore> {
        self.store.clone()
    }

    /// Returns a scanner over this ledger.
    #[must_use]
    pub fn scanner(&self) -> FailureScanner {
        FailureScanner::new(self.registry.clone(), self.store.clone())
    }

    /// Returns a scheduler over this ledger.
    #[must_use]
    pub fn scheduler(&self, executor: Arc<dyn StageExecutor>) -> RetryScheduler {
        RetryScheduler::new(self.registry.clone(), self.store.clone(), executor)
    }

    /// Seeds a successful original execution.
    pub async fn succeeded(&self, entity_id: &str, stage_code: &str) -> Result<ExecutionRecord, StorageError> {
        let fingerprint = format!("{entity_id}:{stage_code}");
        self.seed(ExecutionRecord::succeeded(entity_id, stage_code, Some(fingerprint)))
            .await
    }

    /// Seeds a transient failure that already used `attempts` retries.
    pub async fn transient(
        &self,
        entity_id: &str,
        stage_code: &str,
        attempts: u32,
    ) -> Result<ExecutionRecord, StorageError> {
        self.seed(ExecutionRecord::failed(
            entity_id,
            stage_code,
            FailureKind::Transient,
            "upstream timeout",
            attempts,
        ))
        .await
    }

    /// Seeds a permanent failure.
    pub async fn permanent(&self, entity_id: &str, stage_code: &str) -> Result<ExecutionRecord, StorageError> {
        self.seed(ExecutionRecord::failed(
            entity_id,
            stage_code,
            FailureKind::Permanent,
            "invalid persona data",
            0,
        ))
        .await
    }

    /// Seeds success for every predecessor of `stage_code`, root first.
    pub async fn succeeded_before(&self, entity_id: &str, stage_code: &str) -> Result<(), StorageError> {
        let chain: Vec<String> = self
            .registry
            .chain_up_to(stage_code)
            .map_err(|e| StorageError::new("seed", e.to_string()))?
            .iter()
            .map(|stage| stage.code.clone())
            .collect();

        for code in chain.iter().take(chain.len().saturating_sub(1)) {
            self.succeeded(entity_id, code).await?;
        }
        Ok(())
    }

    async fn seed(&self, record: ExecutionRecord) -> Result<ExecutionRecord, StorageError> {
        let record = match &self.owner {
            Some(owner) => record.with_owner(owner.clone()),
            None => record,
        };
        self.store.seed(record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ExecutionStatus;

    #[tokio::test]
    async fn test_succeeded_before_seeds_predecessors() {
        let fixture = LedgerFixture::persona_pipeline().with_owner("acme");
        fixture.succeeded_before("p1", "avatar").await.unwrap();

        let store = fixture.store();
        for code in ["biography", "attributions", "competencies"] {
            let record = store.get("p1", code).await.unwrap();
            assert_eq!(record.status, ExecutionStatus::Success);
            assert_eq!(record.owner_id.as_deref(), Some("acme"));
        }
        assert_eq!(store.get("p1", "avatar").await.unwrap().status, ExecutionStatus::NeverRun);
    }
}
