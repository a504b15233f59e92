//! Append-only JSON-lines ledger on disk.
//!
//! One line per snapshot. The whole file is replayed into memory on open
//! and every later write appends a line before the in-memory index changes.
//! A failed append is truncated back to the last complete line. A torn
//! final line left by a crash is dropped on open.

use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::memory::seeded;
use super::{EntityScope, ExecutionStatusStore, InMemoryExecutionStore};
use crate::core::{ExecutionOutcome, ExecutionRecord, OutcomeSource};
use crate::errors::StorageError;

/// Ledger persisted as JSON lines.
#[derive(Debug)]
pub struct FileExecutionStore {
    path: PathBuf,
    index: InMemoryExecutionStore,
    writer: Mutex<File>,
}

impl FileExecutionStore {
    /// Opens (or creates) the ledger at `path` and replays it.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] if the file cannot be read or created, or
    /// if a complete line is not a valid record.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::new("open", format!("{}: {e}", parent.display())))?;
        }

        let index = InMemoryExecutionStore::new();
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(StorageError::new("open", format!("{}: {e}", path.display())));
            }
        };

        let mut replayed = 0usize;
        let mut torn_at = None;
        let mut offset = 0usize;
        for (number, line) in content.split_inclusive('\n').enumerate() {
            let start = offset;
            offset += line.len();
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ExecutionRecord>(line) {
                Ok(record) => {
                    index.push(record);
                    replayed += 1;
                }
                Err(e) if !line.ends_with('\n') => {
                    warn!(path = %path.display(), line = number + 1, error = %e, "Dropping torn ledger line");
                    torn_at = Some(start as u64);
                }
                Err(e) => {
                    return Err(StorageError::new(
                        "open",
                        format!("{} line {}: {e}", path.display(), number + 1),
                    ));
                }
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StorageError::new("open", format!("{}: {e}", path.display())))?;

        let repair = match torn_at {
            Some(len) => file.set_len(len).await,
            None if !content.is_empty() && !content.ends_with('\n') => write_line(&mut file, b"\n").await,
            None => Ok(()),
        };
        repair.map_err(|e| StorageError::new("open", format!("{}: {e}", path.display())))?;

        info!(path = %path.display(), snapshots = replayed, "Opened execution ledger");

        Ok(Self {
            path,
            index,
            writer: Mutex::new(file),
        })
    }

    /// Returns the ledger file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append<F>(
        &self,
        operation: &str,
        entity_id: &str,
        stage_code: &str,
        next: F,
    ) -> Result<ExecutionRecord, StorageError>
    where
        F: FnOnce(&ExecutionRecord) -> ExecutionRecord,
    {
        let mut file = self.writer.lock().await;

        let record = next(&self.index.latest(entity_id, stage_code));
        let mut line = serde_json::to_string(&record)
            .map_err(|e| StorageError::new(operation, e.to_string()))?;
        line.push('\n');

        let committed = file
            .metadata()
            .await
            .map_err(|e| StorageError::new(operation, e.to_string()))?
            .len();

        if let Err(e) = write_line(&mut file, line.as_bytes()).await {
            if let Err(rollback) = file.set_len(committed).await {
                warn!(path = %self.path.display(), error = %rollback, "Failed to truncate partial ledger line");
            }
            return Err(StorageError::new(operation, e.to_string()));
        }

        debug!(
            key = %record.key(),
            version = record.version,
            status = %record.status,
            "Appended ledger snapshot"
        );
        self.index.push(record.clone());
        Ok(record)
    }
}

async fn write_line(file: &mut File, line: &[u8]) -> std::io::Result<()> {
    file.write_all(line).await?;
    file.flush().await?;
    file.sync_data().await
}

#[async_trait]
impl ExecutionStatusStore for FileExecutionStore {
    async fn get(&self, entity_id: &str, stage_code: &str) -> Result<ExecutionRecord, StorageError> {
        Ok(self.index.latest(entity_id, stage_code))
    }

    async fn list_failed(
        &self,
        stage_codes: &[String],
        scope: &EntityScope,
    ) -> Result<Vec<ExecutionRecord>, StorageError> {
        self.index.list_failed(stage_codes, scope).await
    }

    async fn list(
        &self,
        stage_code: &str,
        scope: &EntityScope,
    ) -> Result<Vec<ExecutionRecord>, StorageError> {
        self.index.list(stage_code, scope).await
    }

    async fn record(
        &self,
        entity_id: &str,
        stage_code: &str,
        outcome: &ExecutionOutcome,
        source: OutcomeSource,
    ) -> Result<ExecutionRecord, StorageError> {
        let at = Utc::now();
        self.append("record", entity_id, stage_code, |latest| {
            latest.apply(outcome, source, at)
        })
        .await
    }

    async fn reset(&self, entity_id: &str, stage_code: &str) -> Result<ExecutionRecord, StorageError> {
        let at = Utc::now();
        self.append("reset", entity_id, stage_code, |latest| latest.reset(at))
            .await
    }

    async fn seed(&self, record: ExecutionRecord) -> Result<ExecutionRecord, StorageError> {
        let entity_id = record.entity_id.clone();
        let stage_code = record.stage_code.clone();
        self.append("seed", &entity_id, &stage_code, |latest| seeded(latest, record))
            .await
    }

    async fn history(
        &self,
        entity_id: &str,
        stage_code: &str,
    ) -> Result<Vec<ExecutionRecord>, StorageError> {
        self.index.history(entity_id, stage_code).await
    }
}
