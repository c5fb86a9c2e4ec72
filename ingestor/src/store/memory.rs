use super::{is_identifier, AuditLog, ControlChannel, DownloadQueue, ProgressStore, RecordSink};
use crate::model::{
    AuditLogEntry, DownloadStatus, DownloadTask, MappedRecord, ProgressRecord, TaskKey,
};
use async_trait::async_trait;
use ingestor_core::{Error, Result};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Default)]
struct State {
    tables: HashMap<String, BTreeMap<String, Map<String, Value>>>,
    progress: HashMap<TaskKey, ProgressRecord>,
    leases: HashMap<TaskKey, (Uuid, Instant)>,
    stop_flags: HashSet<TaskKey>,
    downloads: Vec<DownloadTask>,
    audit: Vec<AuditLogEntry>,
}

/// In-process implementation of every store trait.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("memory store lock poisoned".into()))
    }

    pub fn row(&self, table: &str, key: &str) -> Option<Map<String, Value>> {
        let state = self.state().ok()?;
        state.tables.get(table)?.get(key).cloned()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.state()
            .map(|state| state.tables.get(table).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    pub fn downloads(&self) -> Vec<DownloadTask> {
        self.state()
            .map(|state| state.downloads.clone())
            .unwrap_or_default()
    }

    pub fn audit_entries(&self) -> Vec<AuditLogEntry> {
        self.state()
            .map(|state| state.audit.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RecordSink for MemoryStore {
    async fn upsert(&self, table: &str, key_column: &str, record: &MappedRecord) -> Result<()> {
        if !is_identifier(table) || !is_identifier(key_column) {
            return Err(Error::InvalidInput(format!(
                "refusing to write to {table}.{key_column}"
            )));
        }

        let mut state = self.state()?;
        let row = state
            .tables
            .entry(table.to_string())
            .or_default()
            .entry(record.natural_key.clone())
            .or_default();

        row.insert(key_column.to_string(), Value::String(record.natural_key.clone()));
        for (column, value) in &record.fields {
            if !value.is_null() {
                row.insert(column.clone(), value.clone());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ProgressStore for MemoryStore {
    async fn load(&self, task: &TaskKey) -> Result<Option<ProgressRecord>> {
        Ok(self.state()?.progress.get(task).cloned())
    }

    async fn save(&self, record: &ProgressRecord) -> Result<()> {
        self.state()?.progress.insert(record.task, record.clone());
        Ok(())
    }

    async fn reset(&self, task: &TaskKey) -> Result<ProgressRecord> {
        let record = ProgressRecord::new(*task);
        self.state()?.progress.insert(*task, record.clone());
        Ok(record)
    }

    async fn try_acquire_lease(&self, task: &TaskKey, owner: Uuid, ttl: Duration) -> Result<bool> {
        let mut state = self.state()?;
        let now = Instant::now();
        match state.leases.get(task) {
            Some((holder, expires)) if *holder != owner && *expires > now => Ok(false),
            _ => {
                state.leases.insert(*task, (owner, now + ttl));
                Ok(true)
            }
        }
    }

    async fn release_lease(&self, task: &TaskKey, owner: Uuid) -> Result<()> {
        let mut state = self.state()?;
        if matches!(state.leases.get(task), Some((holder, _)) if *holder == owner) {
            state.leases.remove(task);
        }
        Ok(())
    }
}

#[async_trait]
impl ControlChannel for MemoryStore {
    async fn should_stop(&self, task: &TaskKey) -> Result<bool> {
        Ok(self.state()?.stop_flags.contains(task))
    }

    async fn request_stop(&self, task: &TaskKey) -> Result<()> {
        self.state()?.stop_flags.insert(*task);
        Ok(())
    }

    async fn clear_stop(&self, task: &TaskKey) -> Result<()> {
        self.state()?.stop_flags.remove(task);
        Ok(())
    }
}

#[async_trait]
impl DownloadQueue for MemoryStore {
    async fn enqueue(&self, task: &DownloadTask) -> Result<()> {
        let mut state = self.state()?;
        let existing = state.downloads.iter().position(|queued| {
            queued.owning_table == task.owning_table
                && queued.owning_record_id == task.owning_record_id
                && queued.file_url == task.file_url
        });

        match existing {
            Some(index) => {
                let queued = &mut state.downloads[index];
                if queued.status == DownloadStatus::Pending {
                    queued.bucket = task.bucket.clone();
                    queued.storage_path = task.storage_path.clone();
                    queued.owning_column = task.owning_column.clone();
                }
            }
            None => state.downloads.push(task.clone()),
        }
        Ok(())
    }
}

#[async_trait]
impl AuditLog for MemoryStore {
    async fn append(&self, entry: &AuditLogEntry) -> Result<()> {
        self.state()?.audit.push(entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataType, Source};
    use serde_json::json;

    fn record(key: &str, fields: Value) -> MappedRecord {
        MappedRecord {
            natural_key: key.to_string(),
            fields: fields.as_object().cloned().unwrap_or_default(),
            attachments: Vec::new(),
        }
    }

    #[tokio::test]
    async fn upsert_merges_without_erasing_fields() {
        let store = MemoryStore::new();

        store
            .upsert("documents", "dok_id", &record("H1", json!({"titel": "Budget", "organ": "FiU"})))
            .await
            .unwrap();
        store
            .upsert("documents", "dok_id", &record("H1", json!({"titel": "Budget 2024", "organ": null})))
            .await
            .unwrap();

        let row = store.row("documents", "H1").unwrap();
        assert_eq!(store.row_count("documents"), 1);
        assert_eq!(row["titel"], "Budget 2024");
        assert_eq!(row["organ"], "FiU");
        assert_eq!(row["dok_id"], "H1");
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_released() {
        let store = MemoryStore::new();
        let task = TaskKey::new(Source::Riksdagen, DataType::Documents);
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        let ttl = Duration::from_secs(60);

        assert!(store.try_acquire_lease(&task, first, ttl).await.unwrap());
        assert!(!store.try_acquire_lease(&task, second, ttl).await.unwrap());

        store.release_lease(&task, second).await.unwrap();
        assert!(!store.try_acquire_lease(&task, second, ttl).await.unwrap());

        store.release_lease(&task, first).await.unwrap();
        assert!(store.try_acquire_lease(&task, second, ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let store = MemoryStore::new();
        let task = TaskKey::new(Source::Riksdagen, DataType::Votes);

        assert!(store
            .try_acquire_lease(&task, Uuid::new_v4(), Duration::ZERO)
            .await
            .unwrap());
        assert!(store
            .try_acquire_lease(&task, Uuid::new_v4(), Duration::from_secs(60))
            .await
            .unwrap());
    }
}
