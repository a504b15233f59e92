//! Scripted executors and faulty stores for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::core::{ExecutionOutcome, ExecutionRecord, OutcomeSource, RecordKey};
use crate::errors::StorageError;
use crate::executor::StageExecutor;
use crate::registry::Stage;
use crate::store::{EntityScope, ExecutionStatusStore};

/// One call observed by a [`ScriptedExecutor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorCall {
    /// The entity passed in.
    pub entity_id: String,
    /// The stage code passed in.
    pub stage_code: String,
    /// The force flag passed in.
    pub force: bool,
    /// When the call started, relative to executor creation.
    pub at: Duration,
}

/// An executor that replays scripted outcomes per (entity, stage).
///
/// Once a pair's script is used up, the fallback outcome is returned.
/// Timestamps come from `tokio::time`, so paused-clock tests see exact offsets.
#[derive(Debug)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<RecordKey, VecDeque<ExecutionOutcome>>>,
    fallback: ExecutionOutcome,
    latency: Duration,
    calls: Mutex<Vec<ExecutorCall>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    created: Instant,
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedExecutor {
    /// Creates an executor that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            fallback: ExecutionOutcome::success(None),
            latency: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            created: Instant::now(),
        }
    }

    /// Sets the outcome returned when no script applies.
    #[must_use]
    pub fn with_fallback(mut self, outcome: ExecutionOutcome) -> Self {
        self.fallback = outcome;
        self
    }

    /// Makes every call take `latency`.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queues outcomes for one pair, returned in order.
    #[must_use]
    pub fn script(
        self,
        entity_id: &str,
        stage_code: &str,
        outcomes: impl IntoIterator<Item = ExecutionOutcome>,
    ) -> Self {
        self.scripts
            .lock()
            .entry(RecordKey::new(entity_id, stage_code))
            .or_default()
            .extend(outcomes);
        self
    }

    /// Returns every call in start order.
    #[must_use]
    pub fn calls(&self) -> Vec<ExecutorCall> {
        self.calls.lock().clone()
    }

    /// Returns the calls made for one pair.
    #[must_use]
    pub fn calls_for(&self, entity_id: &str, stage_code: &str) -> Vec<ExecutorCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.entity_id == entity_id && c.stage_code == stage_code)
            .cloned()
            .collect()
    }

    /// Returns the number of calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Returns the highest number of calls that were in progress at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_outcome(&self, key: &RecordKey) -> ExecutionOutcome {
        self.scripts
            .lock()
            .get_mut(key)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl StageExecutor for ScriptedExecutor {
    async fn execute(&self, entity_id: &str, stage: &Stage, force: bool) -> ExecutionOutcome {
        self.calls.lock().push(ExecutorCall {
            entity_id: entity_id.to_string(),
            stage_code: stage.code.clone(),
            force,
            at: self.created.elapsed(),
        });

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.next_outcome(&RecordKey::new(entity_id, &stage.code))
    }
}

/// A store wrapper that starts failing after a number of writes.
///
/// Reads pass through unless [`fail_reads`](Self::fail_reads) is set.
pub struct FailingStore {
    inner: Arc<dyn ExecutionStatusStore>,
    writes_allowed: Option<usize>,
    fail_reads: bool,
    writes: AtomicUsize,
}

impl std::fmt::Debug for FailingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailingStore")
            .field("writes_allowed", &self.writes_allowed)
            .field("fail_reads", &self.fail_reads)
            .finish_non_exhaustive()
    }
}

impl FailingStore {
    /// Wraps `inner` without injecting any failure.
    #[must_use]
    pub fn new(inner: Arc<dyn ExecutionStatusStore>) -> Self {
        Self {
            inner,
            writes_allowed: None,
            fail_reads: false,
            writes: AtomicUsize::new(0),
        }
    }

    /// Lets `allowed` writes through, then fails every write.
    #[must_use]
    pub fn fail_writes_after(mut self, allowed: usize) -> Self {
        self.writes_allowed = Some(allowed);
        self
    }

    /// Fails every read.
    #[must_use]
    pub fn fail_reads(mut self) -> Self {
        self.fail_reads = true;
        self
    }

    /// Returns the number of writes that reached the inner store.
    #[must_use]
    pub fn successful_writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_read(&self, operation: &str) -> Result<(), StorageError> {
        if self.fail_reads {
            return Err(StorageError::new(operation, "injected read failure"));
        }
        Ok(())
    }

    fn check_write(&self, operation: &str) -> Result<(), StorageError> {
        if let Some(allowed) = self.writes_allowed {
            if self.writes.load(Ordering::SeqCst) >= allowed {
                return Err(StorageError::new(operation, "injected write failure"));
            }
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl ExecutionStatusStore for FailingStore {
    async fn get(&self, entity_id: &str, stage_code: &str) -> Result<ExecutionRecord, StorageError> {
        self.check_read("get")?;
        self.inner.get(entity_id, stage_code).await
    }

    async fn list_failed(
        &self,
        stage_codes: &[String],
        scope: &EntityScope,
    ) -> Result<Vec<ExecutionRecord>, StorageError> {
        self.check_read("list_failed")?;
        self.inner.list_failed(stage_codes, scope).await
    }

    async fn list(
        &self,
        stage_code: &str,
        scope: &EntityScope,
    ) -> Result<Vec<ExecutionRecord>, StorageError> {
        self.check_read("list")?;
        self.inner.list(stage_code, scope).await
    }

    async fn record(
        &self,
        entity_id: &str,
        stage_code: &str,
        outcome: &ExecutionOutcome,
        source: OutcomeSource,
    ) -> Result<ExecutionRecord, StorageError> {
        self.check_write("record")?;
        self.inner.record(entity_id, stage_code, outcome, source).await
    }

    async fn reset(&self, entity_id: &str, stage_code: &str) -> Result<ExecutionRecord, StorageError> {
        self.check_write("reset")?;
        self.inner.reset(entity_id, stage_code).await
    }

    async fn seed(&self, record: ExecutionRecord) -> Result<ExecutionRecord, StorageError> {
        self.check_write("seed")?;
        self.inner.seed(record).await
    }

    async fn history(
        &self,
        entity_id: &str,
        stage_code: &str,
    ) -> Result<Vec<ExecutionRecord>, StorageError> {
        self.check_read("history")?;
        self.inner.history(entity_id, stage_code).await
    }
}
