//! Persistence seams of the engine.
//!
//! The orchestrator only sees these traits. [`PgStore`] implements all of
//! them over Postgres; [`MemoryStore`] implements them in process for tests
//! and dry runs.

pub mod memory;
pub mod postgres;

use crate::model::{AuditLogEntry, DownloadTask, MappedRecord, ProgressRecord, TaskKey};
use async_trait::async_trait;
use ingestor_core::Result;
use std::time::Duration;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Idempotent upsert by natural key. Fields absent or null in `record` keep
/// their stored value; present fields overwrite.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn upsert(&self, table: &str, key_column: &str, record: &MappedRecord) -> Result<()>;
}

#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn load(&self, task: &TaskKey) -> Result<Option<ProgressRecord>>;

    async fn save(&self, record: &ProgressRecord) -> Result<()>;

    /// Back to pending at page 1 with zero counts and no cursor.
    async fn reset(&self, task: &TaskKey) -> Result<ProgressRecord>;

    /// Takes the task's lease unless another owner holds an unexpired one.
    async fn try_acquire_lease(&self, task: &TaskKey, owner: Uuid, ttl: Duration) -> Result<bool>;

    async fn release_lease(&self, task: &TaskKey, owner: Uuid) -> Result<()>;
}

#[async_trait]
pub trait ControlChannel: Send + Sync {
    async fn should_stop(&self, task: &TaskKey) -> Result<bool>;

    async fn request_stop(&self, task: &TaskKey) -> Result<()>;

    async fn clear_stop(&self, task: &TaskKey) -> Result<()>;
}

/// Producer side of the download queue. Re-enqueueing the same
/// (table, record, url) is a no-op once the worker has picked the task up.
#[async_trait]
pub trait DownloadQueue: Send + Sync {
    async fn enqueue(&self, task: &DownloadTask) -> Result<()>;
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, entry: &AuditLogEntry) -> Result<()>;
}

/// Table and column names reach SQL unquoted, so only plain identifiers pass.
pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
