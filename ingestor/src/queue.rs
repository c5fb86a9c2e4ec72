use crate::model::{Attachment, DownloadStatus, DownloadTask, Source, TaskKey};
use crate::store::DownloadQueue;
use ingestor_core::config::{DownloadsConfig, SourcesConfig};
use ingestor_core::{Error, Result};
use metrics::counter;
use reqwest::Url;
use std::sync::Arc;
use tracing::debug;

/// Replaces characters object stores and the download worker choke on,
/// collapses repeated separators and trims separators at both ends.
/// `.` and `..` segments are dropped.
pub fn sanitize_storage_path(path: &str) -> String {
    let replaced: String = path
        .chars()
        .map(|c| match c {
            '\\' => '/',
            ':' | '"' | '\'' | '*' | '?' | '<' | '>' | '|' => '_',
            c if c.is_whitespace() || c.is_control() => '_',
            c => c,
        })
        .collect();

    replaced
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != "." && *segment != "..")
        .collect::<Vec<_>>()
        .join("/")
}

/// Absolute http(s) URL for `href`, resolving relative links against `base`.
pub fn resolve_url(base: &str, href: &str) -> Result<String> {
    let href = href.trim();
    // join leaves absolute links untouched
    let resolved = Url::parse(base)
        .and_then(|base| base.join(href))
        .map_err(|e| Error::InvalidInput(format!("cannot resolve '{href}' against '{base}': {e}")))?;

    match resolved.scheme() {
        "http" | "https" => Ok(resolved.to_string()),
        scheme => Err(Error::InvalidInput(format!(
            "unsupported attachment scheme '{scheme}' in '{href}'"
        ))),
    }
}

/// Builds download tasks for attachments and hands them to the queue. The
/// transfer itself belongs to the download worker.
#[derive(Clone)]
pub struct DownloadProducer {
    queue: Arc<dyn DownloadQueue>,
    sources: SourcesConfig,
    downloads: DownloadsConfig,
}

impl DownloadProducer {
    pub fn new(queue: Arc<dyn DownloadQueue>, sources: SourcesConfig, downloads: DownloadsConfig) -> Self {
        Self {
            queue,
            sources,
            downloads,
        }
    }

    fn bucket(&self, source: Source) -> &str {
        match source {
            Source::Riksdagen => &self.downloads.riksdagen_bucket,
            Source::Regeringen => &self.downloads.regeringen_bucket,
        }
    }

    fn site_base_url(&self, source: Source) -> &str {
        match source {
            Source::Riksdagen => &self.sources.riksdagen.site_base_url,
            Source::Regeringen => &self.sources.regeringen.site_base_url,
        }
    }

    pub async fn enqueue(
        &self,
        url: &str,
        bucket: &str,
        storage_path: &str,
        owning_table: &str,
        owning_record_id: &str,
        owning_column: &str,
    ) -> Result<DownloadTask> {
        let task = DownloadTask {
            file_url: url.to_string(),
            bucket: bucket.to_string(),
            storage_path: sanitize_storage_path(storage_path),
            owning_table: owning_table.to_string(),
            owning_record_id: owning_record_id.to_string(),
            owning_column: owning_column.to_string(),
            status: DownloadStatus::Pending,
            attempts: 0,
            max_attempts: self.downloads.max_attempts,
        };

        if task.storage_path.is_empty() {
            return Err(Error::InvalidInput(format!(
                "empty storage path for {owning_table}/{owning_record_id}"
            )));
        }

        self.queue.enqueue(&task).await?;
        counter!("ingestor_downloads_enqueued", "table" => owning_table.to_string()).increment(1);
        debug!(url = %task.file_url, path = %task.storage_path, "Queued download");
        Ok(task)
    }

    /// Resolves the attachment link and derives `<data type>/<record>/<file>`
    /// as its storage path.
    pub async fn enqueue_attachment(
        &self,
        task: &TaskKey,
        owning_table: &str,
        record_id: &str,
        attachment: &Attachment,
    ) -> Result<DownloadTask> {
        let url = resolve_url(self.site_base_url(task.source), &attachment.url)?;
        let storage_path = format!("{}/{}/{}", task.data_type, record_id, attachment.file_name);

        self.enqueue(
            &url,
            self.bucket(task.source),
            &storage_path,
            owning_table,
            record_id,
            attachment.column,
        )
        .await
    }
}
