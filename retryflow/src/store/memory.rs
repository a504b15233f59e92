//! In-memory ledger backed by a concurrent map.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::BTreeMap;

use super::{EntityScope, ExecutionStatusStore};
use crate::core::{ExecutionOutcome, ExecutionRecord, OutcomeSource, RecordKey};
use crate::errors::StorageError;

/// Ledger held in a [`DashMap`], one snapshot history per key.
///
/// Each key's history is updated under its shard lock, so writes to the
/// same pair are serialized and writes to different pairs never wait on
/// each other's history.
#[derive(Debug, Default)]
pub struct InMemoryExecutionStore {
    records: DashMap<RecordKey, Vec<ExecutionRecord>>,
}

impl InMemoryExecutionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of (entity, stage) pairs with at least one snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if nothing was ever recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Returns a sorted copy of every history, for comparing ledger states.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<RecordKey, Vec<ExecutionRecord>> {
        self.records
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub(crate) fn latest(&self, entity_id: &str, stage_code: &str) -> ExecutionRecord {
        self.records
            .get(&RecordKey::new(entity_id, stage_code))
            .and_then(|history| history.last().cloned())
            .unwrap_or_else(|| ExecutionRecord::never_run(entity_id, stage_code))
    }

    /// Appends the snapshot produced by `next` from the current latest one.
    pub(crate) fn append_with<F>(&self, entity_id: &str, stage_code: &str, next: F) -> ExecutionRecord
    where
        F: FnOnce(&ExecutionRecord) -> ExecutionRecord,
    {
        let mut history = self
            .records
            .entry(RecordKey::new(entity_id, stage_code))
            .or_default();

        let record = match history.last() {
            Some(latest) => next(latest),
            None => next(&ExecutionRecord::never_run(entity_id, stage_code)),
        };
        history.push(record.clone());
        record
    }

    /// Appends an already versioned snapshot, as read back from disk.
    pub(crate) fn push(&self, record: ExecutionRecord) {
        self.records.entry(record.key()).or_default().push(record);
    }

    fn latest_matching<P>(&self, predicate: P) -> Vec<ExecutionRecord>
    where
        P: Fn(&ExecutionRecord) -> bool,
    {
        self.records
            .iter()
            .filter_map(|entry| entry.value().last().filter(|r| predicate(r)).cloned())
            .collect()
    }
}

/// Returns the snapshot that `seed` appends on top of `latest`.
pub(crate) fn seeded(latest: &ExecutionRecord, mut record: ExecutionRecord) -> ExecutionRecord {
    record.version = latest.version + 1;
    if record.owner_id.is_none() {
        record.owner_id.clone_from(&latest.owner_id);
    }
    record
}

fn sort_by_stage_then_entity(records: &mut [ExecutionRecord], stage_codes: &[String]) {
    let rank = |code: &str| stage_codes.iter().position(|c| c == code).unwrap_or(usize::MAX);
    records.sort_by(|a, b| {
        rank(&a.stage_code)
            .cmp(&rank(&b.stage_code))
            .then_with(|| a.entity_id.cmp(&b.entity_id))
    });
}

#[async_trait]
impl ExecutionStatusStore for InMemoryExecutionStore {
    async fn get(&self, entity_id: &str, stage_code: &str) -> Result<ExecutionRecord, StorageError> {
        Ok(self.latest(entity_id, stage_code))
    }

    async fn list_failed(
        &self,
        stage_codes: &[String],
        scope: &EntityScope,
    ) -> Result<Vec<ExecutionRecord>, StorageError> {
        let mut failed = self.latest_matching(|r| {
            r.status.is_failure() && stage_codes.contains(&r.stage_code) && scope.matches(r)
        });
        sort_by_stage_then_entity(&mut failed, stage_codes);
        Ok(failed)
    }

    async fn list(
        &self,
        stage_code: &str,
        scope: &EntityScope,
    ) -> Result<Vec<ExecutionRecord>, StorageError> {
        let mut records = self.latest_matching(|r| r.stage_code == stage_code && scope.matches(r));
        records.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        Ok(records)
    }

    async fn record(
        &self,
        entity_id: &str,
        stage_code: &str,
        outcome: &ExecutionOutcome,
        source: OutcomeSource,
    ) -> Result<ExecutionRecord, StorageError> {
        let at = Utc::now();
        Ok(self.append_with(entity_id, stage_code, |latest| latest.apply(outcome, source, at)))
    }

    async fn reset(&self, entity_id: &str, stage_code: &str) -> Result<ExecutionRecord, StorageError> {
        let at = Utc::now();
        Ok(self.append_with(entity_id, stage_code, |latest| latest.reset(at)))
    }

    async fn seed(&self, record: ExecutionRecord) -> Result<ExecutionRecord, StorageError> {
        let entity_id = record.entity_id.clone();
        let stage_code = record.stage_code.clone();
        Ok(self.append_with(&entity_id, &stage_code, |latest| seeded(latest, record)))
    }

    async fn history(
        &self,
        entity_id: &str,
        stage_code: &str,
    ) -> Result<Vec<ExecutionRecord>, StorageError> {
        Ok(self
            .records
            .get(&RecordKey::new(entity_id, stage_code))
            .map(|history| history.value().clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ExecutionStatus, FailureKind};
    use pretty_assertions::assert_eq;

    fn codes(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test]
    async fn test_get_missing_is_never_run() {
        let store = InMemoryExecutionStore::new();
        let record = store.get("p1", "avatar").await.unwrap();

        assert_eq!(record.status, ExecutionStatus::NeverRun);
        assert_eq!(record.version, 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_record_appends_history() {
        let store = InMemoryExecutionStore::new();
        store
            .record("p1", "avatar", &ExecutionOutcome::transient("429"), OutcomeSource::Original)
            .await
            .unwrap();
        store
            .record("p1", "avatar", &ExecutionOutcome::transient("429"), OutcomeSource::Retry)
            .await
            .unwrap();
        let last = store
            .record("p1", "avatar", &ExecutionOutcome::success(None), OutcomeSource::Retry)
            .await
            .unwrap();

        assert_eq!(last.attempts, 2);
        assert_eq!(last.version, 3);

        let history = store.history("p1", "avatar").await.unwrap();
        let statuses: Vec<_> = history.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                ExecutionStatus::TransientFailure,
                ExecutionStatus::TransientFailure,
                ExecutionStatus::Success,
            ]
        );
        assert_eq!(store.get("p1", "avatar").await.unwrap(), last);
    }

    #[tokio::test]
    async fn test_list_failed_filters_and_orders() {
        let store = InMemoryExecutionStore::new();
        for record in [
            ExecutionRecord::failed("p2", "avatar", FailureKind::Transient, "t", 0).with_owner("acme"),
            ExecutionRecord::failed("p1", "avatar", FailureKind::Permanent, "p", 0).with_owner("acme"),
            ExecutionRecord::failed("p3", "biography", FailureKind::Transient, "t", 0).with_owner("acme"),
            ExecutionRecord::succeeded("p4", "avatar", None).with_owner("acme"),
            ExecutionRecord::failed("p5", "avatar", FailureKind::Transient, "t", 0).with_owner("globex"),
        ] {
            store.seed(record).await.unwrap();
        }

        let failed = store
            .list_failed(&codes(&["biography", "avatar"]), &EntityScope::owner("acme"))
            .await
            .unwrap();
        let keys: Vec<String> = failed.iter().map(|r| r.key().to_string()).collect();

        assert_eq!(keys, vec!["p3/biography", "p1/avatar", "p2/avatar"]);
    }

    #[tokio::test]
    async fn test_list_failed_uses_latest_snapshot() {
        let store = InMemoryExecutionStore::new();
        store
            .seed(ExecutionRecord::failed("p1", "avatar", FailureKind::Transient, "t", 0))
            .await
            .unwrap();
        store
            .record("p1", "avatar", &ExecutionOutcome::success(None), OutcomeSource::Retry)
            .await
            .unwrap();

        let failed = store
            .list_failed(&codes(&["avatar"]), &EntityScope::All)
            .await
            .unwrap();
        assert!(failed.is_empty());
    }

    #[tokio::test]
    async fn test_reset_keeps_audit_trail() {
        let store = InMemoryExecutionStore::new();
        store
            .seed(ExecutionRecord::succeeded("p1", "audit", Some("fp".to_string())).with_owner("acme"))
            .await
            .unwrap();

        let reset = store.reset("p1", "audit").await.unwrap();

        assert_eq!(reset.status, ExecutionStatus::NeverRun);
        assert_eq!(reset.owner_id.as_deref(), Some("acme"));
        assert_eq!(store.history("p1", "audit").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_seed_assigns_next_version() {
        let store = InMemoryExecutionStore::new();
        let first = store
            .seed(ExecutionRecord::failed("p1", "avatar", FailureKind::Transient, "t", 1).with_owner("acme"))
            .await
            .unwrap();
        let second = store
            .seed(ExecutionRecord::succeeded("p1", "avatar", None))
            .await
            .unwrap();

        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert_eq!(second.owner_id.as_deref(), Some("acme"));
    }

    #[tokio::test]
    async fn test_list_stage_sorted() {
        let store = InMemoryExecutionStore::new();
        store.seed(ExecutionRecord::succeeded("b", "avatar", None)).await.unwrap();
        store.seed(ExecutionRecord::succeeded("a", "avatar", None)).await.unwrap();
        store.seed(ExecutionRecord::succeeded("a", "audit", None)).await.unwrap();

        let listed = store.list("avatar", &EntityScope::All).await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|r| r.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_concurrent_writes_to_disjoint_keys() {
        let store = std::sync::Arc::new(InMemoryExecutionStore::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let entity = format!("p{i}");
                for _ in 0..5 {
                    store
                        .record(&entity, "avatar", &ExecutionOutcome::transient("t"), OutcomeSource::Retry)
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.len(), 16);
        for i in 0..16 {
            let record = store.get(&format!("p{i}"), "avatar").await.unwrap();
            assert_eq!(record.attempts, 5);
            assert_eq!(record.version, 5);
        }
    }
}
