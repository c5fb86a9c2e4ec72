use chrono::{DateTime, NaiveDate, Utc};
use ingestor_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Remote system a task pulls from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Riksdagen,
    Regeringen,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Riksdagen => "riksdagen",
            Source::Regeringen => "regeringen",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "riksdagen" => Ok(Source::Riksdagen),
            "regeringen" => Ok(Source::Regeringen),
            other => Err(Error::InvalidInput(format!("unknown source: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Documents,
    Members,
    Speeches,
    Votes,
    PressReleases,
    CategorizedDocuments,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Documents => "documents",
            DataType::Members => "members",
            DataType::Speeches => "speeches",
            DataType::Votes => "votes",
            DataType::PressReleases => "press_releases",
            DataType::CategorizedDocuments => "categorized_documents",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "documents" => Ok(DataType::Documents),
            "members" => Ok(DataType::Members),
            "speeches" => Ok(DataType::Speeches),
            "votes" => Ok(DataType::Votes),
            "press_releases" => Ok(DataType::PressReleases),
            "categorized_documents" => Ok(DataType::CategorizedDocuments),
            other => Err(Error::InvalidInput(format!("unknown data type: {other}"))),
        }
    }
}

/// Identity of an ingestion task; every progress, control and audit row is
/// addressed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    pub source: Source,
    pub data_type: DataType,
}

impl TaskKey {
    pub fn new(source: Source, data_type: DataType) -> Self {
        Self { source, data_type }
    }

    pub fn parse(source: &str, data_type: &str) -> Result<Self> {
        Ok(Self::new(source.parse()?, data_type.parse()?))
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source, self.data_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Pending,
    InProgress,
    Partial,
    Stopped,
    Failed,
    Completed,
}

impl ProgressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStatus::Pending => "pending",
            ProgressStatus::InProgress => "in_progress",
            ProgressStatus::Partial => "partial",
            ProgressStatus::Stopped => "stopped",
            ProgressStatus::Failed => "failed",
            ProgressStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProgressStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ProgressStatus::Pending),
            "in_progress" => Ok(ProgressStatus::InProgress),
            "partial" => Ok(ProgressStatus::Partial),
            "stopped" => Ok(ProgressStatus::Stopped),
            "failed" => Ok(ProgressStatus::Failed),
            "completed" => Ok(ProgressStatus::Completed),
            other => Err(Error::Internal(format!("unknown progress status: {other}"))),
        }
    }
}

/// Durable checkpoint of one task. `current_page` is the page that
/// `next_page_cursor` points at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub task: TaskKey,
    pub status: ProgressStatus,
    pub current_page: i64,
    pub total_pages: i64,
    pub items_fetched: i64,
    pub total_items: i64,
    pub next_page_cursor: Option<String>,
    pub error_message: Option<String>,
    pub last_fetched_at: Option<DateTime<Utc>>,
}

impl ProgressRecord {
    pub fn new(task: TaskKey) -> Self {
        Self {
            task,
            status: ProgressStatus::Pending,
            current_page: 1,
            total_pages: 0,
            items_fetched: 0,
            total_items: 0,
            next_page_cursor: None,
            error_message: None,
            last_fetched_at: None,
        }
    }

    /// Whether a Start should continue from `next_page_cursor` instead of
    /// beginning a new chain at page 1.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self.status,
            ProgressStatus::InProgress
                | ProgressStatus::Partial
                | ProgressStatus::Stopped
                | ProgressStatus::Failed
        ) && self.next_page_cursor.is_some()
    }
}

/// Caller-supplied filters. Which ones apply depends on the endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filters {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub search: Option<String>,
    pub party: Option<String>,
    pub committee: Option<String>,
    pub member_id: Option<String>,
    pub doc_type: Option<String>,
    pub riksmote: Option<String>,
    pub category: Option<String>,
    pub page_size: Option<u32>,
}

/// One item as delivered by a source, in the source's own vocabulary.
pub type RawItem = Value;

/// A binary file referenced by a record, fetched later by the download worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub url: String,
    pub file_name: String,
    pub column: &'static str,
}

/// Upsert-ready record keyed by its natural id.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedRecord {
    pub natural_key: String,
    pub fields: Map<String, Value>,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Processing => "processing",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadTask {
    pub file_url: String,
    pub bucket: String,
    pub storage_path: String,
    pub owning_table: String,
    pub owning_record_id: String,
    pub owning_column: String,
    pub status: DownloadStatus,
    pub attempts: i32,
    pub max_attempts: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub endpoint: String,
    pub status: ProgressStatus,
    pub inserted_count: i64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of one Start invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub success: bool,
    pub status: ProgressStatus,
    pub inserted: i64,
    pub errors: i64,
    pub pages_processed: u32,
    pub complete: bool,
    pub message: String,
    pub last_item_error: Option<String>,
}
