use super::{is_identifier, AuditLog, ControlChannel, DownloadQueue, ProgressStore, RecordSink};
use crate::model::{AuditLogEntry, DownloadTask, MappedRecord, ProgressRecord, TaskKey};
use async_trait::async_trait;
use ingestor_core::{Error, Result};
use metrics::counter;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn progress_from_row(task: TaskKey, row: &PgRow) -> Result<ProgressRecord> {
        let status: String = row.try_get("status")?;
        Ok(ProgressRecord {
            task,
            status: status.parse()?,
            current_page: row.try_get("current_page")?,
            total_pages: row.try_get("total_pages")?,
            items_fetched: row.try_get("items_fetched")?,
            total_items: row.try_get("total_items")?,
            next_page_cursor: row.try_get("next_page_cursor")?,
            error_message: row.try_get("error_message")?,
            last_fetched_at: row.try_get("last_fetched_at")?,
        })
    }
}

#[async_trait]
impl RecordSink for PgStore {
    #[instrument(skip(self, record), fields(key = %record.natural_key))]
    async fn upsert(&self, table: &str, key_column: &str, record: &MappedRecord) -> Result<()> {
        if !is_identifier(table) || !is_identifier(key_column) {
            return Err(Error::InvalidInput(format!(
                "refusing to write to {table}.{key_column}"
            )));
        }

        // jsonb_strip_nulls keeps a sparse payload from blanking stored fields.
        let query = format!(
            r#"
            INSERT INTO {table} ({key_column}, data, updated_at)
            VALUES ($1, jsonb_strip_nulls($2), NOW())
            ON CONFLICT ({key_column}) DO UPDATE SET
                data = {table}.data || jsonb_strip_nulls(EXCLUDED.data),
                updated_at = NOW()
            "#
        );

        sqlx::query(&query)
            .bind(&record.natural_key)
            .bind(Value::Object(record.fields.clone()))
            .execute(&self.pool)
            .await?;

        counter!("ingestor_rows_upserted", "table" => table.to_string()).increment(1);
        Ok(())
    }
}

#[async_trait]
impl ProgressStore for PgStore {
    #[instrument(skip(self))]
    async fn load(&self, task: &TaskKey) -> Result<Option<ProgressRecord>> {
        let row = sqlx::query(
            r#"
            SELECT status, current_page, total_pages, items_fetched, total_items,
                   next_page_cursor, error_message, last_fetched_at
            FROM ingest_progress
            WHERE source = $1 AND data_type = $2
            "#,
        )
        .bind(task.source.as_str())
        .bind(task.data_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| Self::progress_from_row(*task, &row)).transpose()
    }

    #[instrument(skip(self, record), fields(task = %record.task))]
    async fn save(&self, record: &ProgressRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ingest_progress (
                source, data_type, status, current_page, total_pages, items_fetched,
                total_items, next_page_cursor, error_message, last_fetched_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
            ON CONFLICT (source, data_type) DO UPDATE SET
                status = EXCLUDED.status,
                current_page = EXCLUDED.current_page,
                total_pages = EXCLUDED.total_pages,
                items_fetched = EXCLUDED.items_fetched,
                total_items = EXCLUDED.total_items,
                next_page_cursor = EXCLUDED.next_page_cursor,
                error_message = EXCLUDED.error_message,
                last_fetched_at = EXCLUDED.last_fetched_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(record.task.source.as_str())
        .bind(record.task.data_type.as_str())
        .bind(record.status.as_str())
        .bind(record.current_page)
        .bind(record.total_pages)
        .bind(record.items_fetched)
        .bind(record.total_items)
        .bind(&record.next_page_cursor)
        .bind(&record.error_message)
        .bind(record.last_fetched_at)
        .execute(&self.pool)
        .await?;

        counter!("ingestor_checkpoints_saved").increment(1);

        debug!(
            status = %record.status,
            page = record.current_page,
            items = record.items_fetched,
            "Saved progress"
        );

        Ok(())
    }

    #[instrument(skip(self))]
    async fn reset(&self, task: &TaskKey) -> Result<ProgressRecord> {
        let record = ProgressRecord::new(*task);
        self.save(&record).await?;
        Ok(record)
    }

    #[instrument(skip(self))]
    async fn try_acquire_lease(&self, task: &TaskKey, owner: Uuid, ttl: Duration) -> Result<bool> {
        let acquired = sqlx::query(
            r#"
            INSERT INTO ingest_progress (source, data_type, status, lease_owner, lease_expires_at)
            VALUES ($1, $2, 'pending', $3, NOW() + make_interval(secs => $4))
            ON CONFLICT (source, data_type) DO UPDATE SET
                lease_owner = EXCLUDED.lease_owner,
                lease_expires_at = EXCLUDED.lease_expires_at
            WHERE ingest_progress.lease_owner IS NULL
               OR ingest_progress.lease_owner = EXCLUDED.lease_owner
               OR ingest_progress.lease_expires_at < NOW()
            RETURNING lease_owner
            "#,
        )
        .bind(task.source.as_str())
        .bind(task.data_type.as_str())
        .bind(owner)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(acquired.is_some())
    }

    #[instrument(skip(self))]
    async fn release_lease(&self, task: &TaskKey, owner: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE ingest_progress
            SET lease_owner = NULL, lease_expires_at = NULL
            WHERE source = $1 AND data_type = $2 AND lease_owner = $3
            "#,
        )
        .bind(task.source.as_str())
        .bind(task.data_type.as_str())
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ControlChannel for PgStore {
    async fn should_stop(&self, task: &TaskKey) -> Result<bool> {
        let should_stop: Option<bool> = sqlx::query_scalar(
            "SELECT should_stop FROM ingest_control WHERE source = $1 AND data_type = $2",
        )
        .bind(task.source.as_str())
        .bind(task.data_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(should_stop.unwrap_or(false))
    }

    #[instrument(skip(self))]
    async fn request_stop(&self, task: &TaskKey) -> Result<()> {
        self.set_stop(task, true).await
    }

    #[instrument(skip(self))]
    async fn clear_stop(&self, task: &TaskKey) -> Result<()> {
        self.set_stop(task, false).await
    }
}

impl PgStore {
    async fn set_stop(&self, task: &TaskKey, should_stop: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ingest_control (source, data_type, should_stop, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (source, data_type) DO UPDATE SET
                should_stop = EXCLUDED.should_stop,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(task.source.as_str())
        .bind(task.data_type.as_str())
        .bind(should_stop)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl DownloadQueue for PgStore {
    #[instrument(skip(self, task), fields(url = %task.file_url))]
    async fn enqueue(&self, task: &DownloadTask) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO download_queue (
                file_url, bucket, storage_path, owning_table, owning_record_id,
                owning_column, status, attempts, max_attempts
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (owning_table, owning_record_id, file_url) DO UPDATE SET
                bucket = EXCLUDED.bucket,
                storage_path = EXCLUDED.storage_path,
                owning_column = EXCLUDED.owning_column,
                updated_at = NOW()
            WHERE download_queue.status = 'pending'
            "#,
        )
        .bind(&task.file_url)
        .bind(&task.bucket)
        .bind(&task.storage_path)
        .bind(&task.owning_table)
        .bind(&task.owning_record_id)
        .bind(&task.owning_column)
        .bind(task.status.as_str())
        .bind(task.attempts)
        .bind(task.max_attempts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AuditLog for PgStore {
    async fn append(&self, entry: &AuditLogEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ingest_audit_log (endpoint, status, inserted_count, error_message, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&entry.endpoint)
        .bind(entry.status.as_str())
        .bind(entry.inserted_count)
        .bind(&entry.error_message)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
