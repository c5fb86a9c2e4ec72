use crate::control::StopToken;
use crate::endpoint::Endpoint;
use crate::mapper::{mapper_for, MapFn};
use crate::model::{AuditLogEntry, ProgressRecord, ProgressStatus, RawItem, RunResult};
use crate::queue::DownloadProducer;
use crate::source::{pagination, SourceAdapter};
use crate::store::{AuditLog, ProgressStore, RecordSink};
use chrono::Utc;
use ingestor_core::backoff::{retry_with_hints, RetryPolicy};
use ingestor_core::config::FetchConfig;
use ingestor_core::{Error, Result};
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const STOPPED_BY_OPERATOR: &str = "stopped by operator";

/// Per-invocation knobs of a Start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunPlan {
    /// `false` processes exactly one page and completes the task.
    pub paginate: bool,
    pub max_pages: u32,
}

/// Counters of the invocation in flight.
#[derive(Debug, Default)]
struct RunTally {
    inserted: i64,
    errors: i64,
    pages: u32,
    last_item_error: Option<String>,
}

impl RunTally {
    fn item_failed(&mut self, message: String) {
        self.errors += 1;
        self.last_item_error = Some(message);
    }
}

/// Why a page loop ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    /// No cursor left.
    Drained,
    /// Page budget spent with pages left.
    Budget,
    Stopped,
    /// Another invoker holds the lease now.
    LeaseLost,
}

/// Lease identity of one invocation.
#[derive(Debug, Clone, Copy)]
struct Lease {
    owner: Uuid,
    ttl: Duration,
}

pub struct Pipeline {
    sink: Arc<dyn RecordSink>,
    progress: Arc<dyn ProgressStore>,
    audit: Arc<dyn AuditLog>,
    downloads: DownloadProducer,
    config: FetchConfig,
}

impl Pipeline {
    pub fn new(
        sink: Arc<dyn RecordSink>,
        progress: Arc<dyn ProgressStore>,
        audit: Arc<dyn AuditLog>,
        downloads: DownloadProducer,
        config: FetchConfig,
    ) -> Self {
        Self {
            sink,
            progress,
            audit,
            downloads,
            config,
        }
    }

    /// Runs one bounded invocation of the task behind `endpoint`.
    ///
    /// The task's lease is held for the whole page loop and renewed at every
    /// checkpoint. A second invoker gets [`Error::Conflict`] instead of
    /// interleaving checkpoints, and so does a run whose lease was taken over.
    #[instrument(skip_all, fields(task = %endpoint.task, max_pages = plan.max_pages))]
    pub async fn run(
        &self,
        endpoint: &'static Endpoint,
        adapter: &dyn SourceAdapter,
        stop: &StopToken,
        plan: RunPlan,
    ) -> Result<RunResult> {
        let task = endpoint.task;
        let lease = Lease {
            owner: Uuid::new_v4(),
            ttl: Duration::from_secs(self.config.lease_ttl_secs),
        };

        if !self.progress.try_acquire_lease(&task, lease.owner, lease.ttl).await? {
            return Err(Error::Conflict(format!("{task} is already running")));
        }

        let result = self.run_locked(endpoint, adapter, stop, plan, lease).await;

        if let Err(e) = self.progress.release_lease(&task, lease.owner).await {
            warn!(task = %task, error = %e, "Failed to release lease");
        }

        result
    }

    async fn run_locked(
        &self,
        endpoint: &'static Endpoint,
        adapter: &dyn SourceAdapter,
        stop: &StopToken,
        plan: RunPlan,
        lease: Lease,
    ) -> Result<RunResult> {
        let task = endpoint.task;
        let mut record = self
            .progress
            .load(&task)
            .await?
            .unwrap_or_else(|| ProgressRecord::new(task));

        // A completed chain starts over; items_fetched keeps counting.
        let resuming = record.is_resumable();
        if !resuming {
            record.current_page = 1;
            record.total_pages = 0;
            record.total_items = 0;
            record.next_page_cursor = Some(adapter.initial_cursor().to_string());
        }

        info!(
            task = %task,
            resuming,
            page = record.current_page,
            items = record.items_fetched,
            "Starting ingestion"
        );

        record.status = ProgressStatus::InProgress;
        record.error_message = None;
        self.progress.save(&record).await?;

        let mut tally = RunTally::default();
        let exit = self
            .page_loop(endpoint, adapter, stop, plan, lease, &mut record, &mut tally)
            .await;

        match exit {
            Ok(LoopExit::Drained) => {
                let message = format!("completed at page {}", record.current_page);
                self.finish(record, ProgressStatus::Completed, tally, message).await
            }
            Ok(LoopExit::Budget) => {
                let message = format!(
                    "processed {} pages this run; continuing from page {}",
                    tally.pages, record.current_page
                );
                self.finish(record, ProgressStatus::Partial, tally, message).await
            }
            Ok(LoopExit::Stopped) => {
                record.error_message = Some(STOPPED_BY_OPERATOR.to_string());
                self.finish(record, ProgressStatus::Stopped, tally, STOPPED_BY_OPERATOR.to_string())
                    .await
            }
            Ok(LoopExit::LeaseLost) => {
                warn!(task = %task, pages = tally.pages, "Lease taken over, abandoning run");
                Err(Error::Conflict(format!("lease on {task} was taken over")))
            }
            Err(e) => {
                let message = format!("page {} failed: {e}", record.current_page);
                record.error_message = Some(e.to_string());
                self.finish(record, ProgressStatus::Failed, tally, message).await
            }
        }
    }

    /// Fetches and checkpoints pages until the loop has a reason to end.
    /// `record` only ever holds a state that was saved, so on error it is
    /// the checkpoint to fail with.
    async fn page_loop(
        &self,
        endpoint: &'static Endpoint,
        adapter: &dyn SourceAdapter,
        stop: &StopToken,
        plan: RunPlan,
        lease: Lease,
        record: &mut ProgressRecord,
        tally: &mut RunTally,
    ) -> Result<LoopExit> {
        let task = endpoint.task;
        let map = mapper_for(task.data_type);
        let policy = RetryPolicy::from(&self.config);

        loop {
            let Some(cursor) = record.next_page_cursor.clone() else {
                return Ok(LoopExit::Drained);
            };

            if tally.pages >= plan.max_pages {
                return Ok(LoopExit::Budget);
            }

            if stop.is_stop_requested().await? {
                return Ok(LoopExit::Stopped);
            }

            if tally.pages > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.inter_page_delay_ms)).await;
            }

            let page = retry_with_hints(
                || adapter.fetch_page(&cursor),
                &policy,
                "fetch_page",
                Error::is_retryable,
                Error::retry_after,
            )
            .await?;

            let mut next = record.clone();
            let page_number = next.current_page;
            counter!("ingestor_pages_fetched", "task" => task.to_string()).increment(1);

            // A fresh chain starts with zero totals, so its first page sets them.
            if next.total_pages == 0 {
                next.total_items = page.total_items.unwrap_or(next.total_items);
                next.total_pages = page.total_pages.unwrap_or(next.total_pages);
            }

            let inserted = self.process_items(endpoint, map, &page.items, tally).await;
            next.items_fetched += inserted;
            tally.inserted += inserted;
            tally.pages += 1;

            let next_cursor = if plan.paginate {
                let total_pages = page.total_pages.unwrap_or(next.total_pages);
                pagination::next_cursor(&cursor, &page, adapter.page_param(), page_number, total_pages)?
            } else {
                None
            };

            debug!(
                task = %task,
                page = page_number,
                items = page.items.len(),
                inserted,
                next = ?next_cursor,
                "Processed page"
            );

            if next_cursor.is_some() {
                next.current_page = page_number + 1;
            }
            next.next_page_cursor = next_cursor;
            next.last_fetched_at = Some(Utc::now());

            if !self.progress.try_acquire_lease(&task, lease.owner, lease.ttl).await? {
                return Ok(LoopExit::LeaseLost);
            }
            self.progress.save(&next).await?;
            *record = next;
        }
    }

    /// Maps and upserts every item of a page, returning how many landed.
    /// Failures are counted in `tally` and never abort the page.
    async fn process_items(
        &self,
        endpoint: &'static Endpoint,
        map: MapFn,
        items: &[RawItem],
        tally: &mut RunTally,
    ) -> i64 {
        let task = endpoint.task;
        let mut inserted = 0;

        for item in items {
            let record = match map(item) {
                Ok(record) => record,
                Err(e) => {
                    warn!(task = %task, error = %e, "Skipping unmappable item");
                    counter!("ingestor_item_errors", "task" => task.to_string()).increment(1);
                    tally.item_failed(e.to_string());
                    continue;
                }
            };

            if let Err(e) = self.sink.upsert(endpoint.table, endpoint.natural_key, &record).await {
                warn!(task = %task, key = %record.natural_key, error = %e, "Upsert failed");
                counter!("ingestor_item_errors", "task" => task.to_string()).increment(1);
                tally.item_failed(format!("{}: {e}", record.natural_key));
                continue;
            }

            inserted += 1;
            counter!("ingestor_items_upserted", "task" => task.to_string()).increment(1);

            for attachment in &record.attachments {
                if let Err(e) = self
                    .downloads
                    .enqueue_attachment(&task, endpoint.table, &record.natural_key, attachment)
                    .await
                {
                    warn!(
                        task = %task,
                        key = %record.natural_key,
                        url = %attachment.url,
                        error = %e,
                        "Failed to queue attachment"
                    );
                    counter!("ingestor_item_errors", "task" => task.to_string()).increment(1);
                    tally.item_failed(format!("{}: {e}", record.natural_key));
                }
            }
        }

        inserted
    }

    async fn finish(
        &self,
        mut record: ProgressRecord,
        status: ProgressStatus,
        tally: RunTally,
        message: String,
    ) -> Result<RunResult> {
        record.status = status;
        if record.error_message.is_none() {
            record.error_message = tally
                .last_item_error
                .as_ref()
                .map(|last| format!("{} item errors, last: {last}", tally.errors));
        }
        self.progress.save(&record).await?;

        self.audit
            .append(&AuditLogEntry {
                endpoint: record.task.data_type.to_string(),
                status,
                inserted_count: tally.inserted,
                error_message: record.error_message.clone(),
                created_at: Utc::now(),
            })
            .await?;

        counter!("ingestor_runs_finished", "status" => status.as_str()).increment(1);
        info!(
            task = %record.task,
            status = %status,
            inserted = tally.inserted,
            errors = tally.errors,
            pages = tally.pages,
            items = record.items_fetched,
            "Ingestion run finished"
        );

        Ok(RunResult {
            success: status != ProgressStatus::Failed,
            status,
            inserted: tally.inserted,
            errors: tally.errors,
            pages_processed: tally.pages,
            complete: status == ProgressStatus::Completed,
            message,
            last_item_error: tally.last_item_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataType, Source, TaskKey};
    use crate::source::NormalizedPage;
    use crate::store::{ControlChannel, MemoryStore};
    use async_trait::async_trait;
    use ingestor_core::Config;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    const BASE: &str = "https://data.riksdagen.se/dokumentlista/?utformat=json&sz=500&p=1";

    fn documents() -> &'static Endpoint {
        Endpoint::resolve(TaskKey::new(Source::Riksdagen, DataType::Documents)).unwrap()
    }

    fn page_number(cursor: &str) -> i64 {
        reqwest::Url::parse(cursor)
            .unwrap()
            .query_pairs()
            .find(|(key, _)| key == "p")
            .and_then(|(_, value)| value.parse().ok())
            .unwrap()
    }

    /// Side effect a served page has on the store.
    enum Hook {
        RaiseStop,
        StealLease,
    }

    /// Serves `total` documents in pages of `page_size`, numbering them from
    /// the `p` parameter of the cursor. Never emits a next link, so paging
    /// relies on the page-number fallback.
    struct ScriptedSource {
        total: i64,
        page_size: i64,
        failures: Mutex<HashMap<i64, u32>>,
        failure: fn(i64) -> Error,
        fetched: Mutex<Vec<i64>>,
        on_fetch: Option<(Hook, Arc<MemoryStore>)>,
        item: fn(i64) -> RawItem,
    }

    impl ScriptedSource {
        fn new(total: i64, page_size: i64) -> Self {
            Self {
                total,
                page_size,
                failures: Mutex::new(HashMap::new()),
                failure: |page| Error::Ingest {
                    source_name: "scripted".into(),
                    details: format!("HTTP 503 for page {page}"),
                },
                fetched: Mutex::new(Vec::new()),
                on_fetch: None,
                item: |n| json!({"dok_id": format!("H{n}"), "titel": format!("Dokument {n}")}),
            }
        }

        /// Page `page` fails `times` times before it is served.
        fn failing(self, page: i64, times: u32) -> Self {
            self.failures.lock().unwrap().insert(page, times);
            self
        }

        /// Raises the stop flag on `store` as soon as the first page is served.
        fn stopping(mut self, store: Arc<MemoryStore>) -> Self {
            self.on_fetch = Some((Hook::RaiseStop, store));
            self
        }

        /// Hands the task's lease to another owner while the first page is served.
        fn stealing_lease(mut self, store: Arc<MemoryStore>) -> Self {
            self.on_fetch = Some((Hook::StealLease, store));
            self
        }

        fn fetched(&self) -> Vec<i64> {
            self.fetched.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SourceAdapter for ScriptedSource {
        async fn fetch_page(&self, cursor: &str) -> Result<NormalizedPage> {
            let page = page_number(cursor);
            self.fetched.lock().unwrap().push(page);

            if let Some(remaining) = self.failures.lock().unwrap().get_mut(&page) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err((self.failure)(page));
                }
            }

            match &self.on_fetch {
                Some((Hook::RaiseStop, store)) => store.request_stop(&documents().task).await?,
                Some((Hook::StealLease, store)) => {
                    let thief = Uuid::new_v4();
                    store
                        .try_acquire_lease(&documents().task, thief, Duration::from_secs(60))
                        .await?;
                }
                None => {}
            }

            let first = (page - 1) * self.page_size;
            let last = (first + self.page_size).min(self.total);
            Ok(NormalizedPage {
                items: (first..last).map(self.item).collect(),
                total_items: Some(self.total),
                total_pages: Some((self.total + self.page_size - 1) / self.page_size),
                next_cursor: None,
            })
        }

        fn initial_cursor(&self) -> &str {
            BASE
        }

        fn page_param(&self) -> &str {
            "p"
        }

        fn source_id(&self) -> &str {
            "scripted"
        }
    }

    fn pipeline(store: &Arc<MemoryStore>) -> Pipeline {
        pipeline_with(store, Config::default())
    }

    fn pipeline_with(store: &Arc<MemoryStore>, config: Config) -> Pipeline {
        let downloads = DownloadProducer::new(store.clone(), config.sources, config.downloads);
        Pipeline::new(store.clone(), store.clone(), store.clone(), downloads, config.fetch)
    }

    /// Stop flag whose `fail_on`-th read errors.
    struct FlakyControl {
        reads: AtomicU32,
        fail_on: u32,
    }

    #[async_trait]
    impl ControlChannel for FlakyControl {
        async fn should_stop(&self, _task: &TaskKey) -> Result<bool> {
            let read = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
            if read == self.fail_on {
                return Err(Error::Internal("control table unavailable".into()));
            }
            Ok(false)
        }

        async fn request_stop(&self, _task: &TaskKey) -> Result<()> {
            Ok(())
        }

        async fn clear_stop(&self, _task: &TaskKey) -> Result<()> {
            Ok(())
        }
    }

    fn stop_token(store: &Arc<MemoryStore>) -> StopToken {
        StopToken::new(store.clone(), documents().task)
    }

    fn plan(max_pages: u32) -> RunPlan {
        RunPlan {
            paginate: true,
            max_pages,
        }
    }

    async fn progress(store: &MemoryStore) -> ProgressRecord {
        store.load(&documents().task).await.unwrap().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn budget_exhaustion_then_resume_completes() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(&store);
        let source = ScriptedSource::new(1200, 500);

        let first = pipeline
            .run(documents(), &source, &stop_token(&store), plan(2))
            .await
            .unwrap();

        assert_eq!(first.status, ProgressStatus::Partial);
        assert_eq!(first.pages_processed, 2);
        assert_eq!(first.inserted, 1000);
        assert!(first.success);
        assert!(!first.complete);

        let record = progress(&store).await;
        assert_eq!(record.items_fetched, 1000);
        assert_eq!(record.total_items, 1200);
        assert_eq!(record.total_pages, 3);
        assert_eq!(record.current_page, 3);
        assert_eq!(page_number(record.next_page_cursor.as_deref().unwrap()), 3);

        let second = pipeline
            .run(documents(), &source, &stop_token(&store), plan(2))
            .await
            .unwrap();

        assert_eq!(second.status, ProgressStatus::Completed);
        assert_eq!(second.pages_processed, 1);
        assert_eq!(second.inserted, 200);
        assert!(second.complete);

        let record = progress(&store).await;
        assert_eq!(record.items_fetched, 1200);
        assert_eq!(record.next_page_cursor, None);
        assert_eq!(source.fetched(), vec![1, 2, 3]);
        assert_eq!(store.row_count("documents"), 1200);

        let audit: Vec<_> = store.audit_entries().iter().map(|e| (e.status, e.inserted_count)).collect();
        assert_eq!(
            audit,
            vec![(ProgressStatus::Partial, 1000), (ProgressStatus::Completed, 200)]
        );
        assert!(store.audit_entries().iter().all(|e| e.endpoint == "documents"));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_request_ends_run_before_next_fetch() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(&store);
        let source = ScriptedSource::new(1200, 500).stopping(store.clone());

        let result = pipeline
            .run(documents(), &source, &stop_token(&store), plan(10))
            .await
            .unwrap();

        assert_eq!(result.status, ProgressStatus::Stopped);
        assert_eq!(result.pages_processed, 1);
        assert!(!result.complete);
        assert_eq!(source.fetched(), vec![1]);

        let record = progress(&store).await;
        assert_eq!(record.status, ProgressStatus::Stopped);
        assert_eq!(record.items_fetched, 500);
        assert_eq!(record.error_message.as_deref(), Some(STOPPED_BY_OPERATOR));
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_task_resumes_after_flag_is_cleared() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(&store);
        let source = ScriptedSource::new(1200, 500);

        store.request_stop(&documents().task).await.unwrap();
        let stopped = pipeline
            .run(documents(), &source, &stop_token(&store), plan(1))
            .await
            .unwrap();
        assert_eq!(stopped.status, ProgressStatus::Stopped);
        assert!(source.fetched().is_empty());

        store.clear_stop(&documents().task).await.unwrap();
        let mut seen = Vec::new();
        loop {
            let result = pipeline
                .run(documents(), &source, &stop_token(&store), plan(1))
                .await
                .unwrap();
            seen.push(progress(&store).await.items_fetched);
            if result.complete {
                break;
            }
        }

        assert_eq!(seen, vec![500, 1000, 1200]);
        assert_eq!(source.fetched(), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_runs_do_not_duplicate_rows() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(&store);
        let source = ScriptedSource::new(300, 100);

        pipeline
            .run(documents(), &source, &stop_token(&store), plan(10))
            .await
            .unwrap();
        let again = pipeline
            .run(documents(), &source, &stop_token(&store), plan(10))
            .await
            .unwrap();

        assert_eq!(again.inserted, 300);
        assert_eq!(store.row_count("documents"), 300);
        assert_eq!(source.fetched(), vec![1, 2, 3, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn completed_task_starts_a_fresh_chain() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(&store);
        let source = ScriptedSource::new(100, 100);

        pipeline
            .run(documents(), &source, &stop_token(&store), plan(10))
            .await
            .unwrap();
        let again = pipeline
            .run(documents(), &source, &stop_token(&store), plan(10))
            .await
            .unwrap();

        assert!(again.complete);
        assert_eq!(again.status, ProgressStatus::Completed);
        assert_eq!(again.pages_processed, 1);
        assert_eq!(source.fetched(), vec![1, 1]);
        assert_eq!(store.row_count("documents"), 100);

        let record = progress(&store).await;
        assert_eq!(record.current_page, 1);
        assert_eq!(record.total_items, 100);
        assert_eq!(record.items_fetched, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_inside_the_page_loop_fail_from_the_last_checkpoint() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(&store);
        let source = ScriptedSource::new(1200, 500);
        let control = FlakyControl {
            reads: AtomicU32::new(0),
            fail_on: 2,
        };
        let stop = StopToken::new(Arc::new(control), documents().task);

        let result = pipeline.run(documents(), &source, &stop, plan(5)).await.unwrap();

        assert_eq!(result.status, ProgressStatus::Failed);
        assert!(!result.success);
        assert_eq!(result.pages_processed, 1);
        assert_eq!(source.fetched(), vec![1]);

        let record = progress(&store).await;
        assert_eq!(record.status, ProgressStatus::Failed);
        assert_eq!(record.items_fetched, 500);
        assert_eq!(page_number(record.next_page_cursor.as_deref().unwrap()), 2);
        assert!(record.error_message.unwrap().contains("control table unavailable"));

        let audit = store.audit_entries();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].status, ProgressStatus::Failed);

        let resumed = pipeline
            .run(documents(), &source, &stop_token(&store), plan(5))
            .await
            .unwrap();
        assert_eq!(resumed.status, ProgressStatus::Completed);
        assert_eq!(source.fetched(), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_lease_abandons_the_run_without_a_checkpoint() {
        let store = Arc::new(MemoryStore::new());
        let mut config = Config::default();
        config.fetch.lease_ttl_secs = 0;
        let pipeline = pipeline_with(&store, config);
        let source = ScriptedSource::new(1200, 500).stealing_lease(store.clone());

        let result = pipeline
            .run(documents(), &source, &stop_token(&store), plan(5))
            .await;

        assert!(matches!(result, Err(Error::Conflict(_))));
        assert_eq!(source.fetched(), vec![1]);

        let record = progress(&store).await;
        assert_eq!(record.status, ProgressStatus::InProgress);
        assert_eq!(record.items_fetched, 0);
        assert!(store.audit_entries().is_empty());

        let blocked = pipeline
            .run(documents(), &ScriptedSource::new(1200, 500), &stop_token(&store), plan(5))
            .await;
        assert!(matches!(blocked, Err(Error::Conflict(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_pages_wait_at_least_retry_after() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(&store);
        let mut source = ScriptedSource::new(100, 100).failing(1, 1);
        source.failure = |_| Error::RateLimit { retry_after_secs: 30 };
        let started = tokio::time::Instant::now();

        let result = pipeline
            .run(documents(), &source, &stop_token(&store), plan(1))
            .await
            .unwrap();

        assert_eq!(result.status, ProgressStatus::Completed);
        assert_eq!(source.fetched(), vec![1, 1]);
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_with_backoff() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(&store);
        let source = ScriptedSource::new(100, 100).failing(1, 2);
        let started = tokio::time::Instant::now();

        let result = pipeline
            .run(documents(), &source, &stop_token(&store), plan(1))
            .await
            .unwrap();

        assert_eq!(result.status, ProgressStatus::Completed);
        assert_eq!(source.fetched(), vec![1, 1, 1]);
        assert!(started.elapsed() >= Duration::from_millis(1_000 + 2_000));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_and_keep_the_checkpoint() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(&store);
        let source = ScriptedSource::new(1200, 500).failing(2, 3);

        let result = pipeline
            .run(documents(), &source, &stop_token(&store), plan(5))
            .await
            .unwrap();

        assert_eq!(result.status, ProgressStatus::Failed);
        assert!(!result.success);
        assert_eq!(result.pages_processed, 1);
        assert_eq!(source.fetched(), vec![1, 2, 2, 2]);

        let record = progress(&store).await;
        assert_eq!(record.status, ProgressStatus::Failed);
        assert_eq!(record.items_fetched, 500);
        assert_eq!(page_number(record.next_page_cursor.as_deref().unwrap()), 2);
        assert!(record.error_message.unwrap().contains("HTTP 503"));

        let resumed = pipeline
            .run(documents(), &source, &stop_token(&store), plan(5))
            .await
            .unwrap();
        assert_eq!(resumed.status, ProgressStatus::Completed);
        assert_eq!(progress(&store).await.items_fetched, 1200);
    }

    #[tokio::test(start_paused = true)]
    async fn bad_items_are_counted_and_skipped() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(&store);
        let mut source = ScriptedSource::new(10, 10);
        source.item = |n| {
            if n % 5 == 0 {
                json!({"titel": "utan id"})
            } else {
                json!({"dok_id": format!("H{n}")})
            }
        };

        let result = pipeline
            .run(documents(), &source, &stop_token(&store), plan(1))
            .await
            .unwrap();

        assert_eq!(result.status, ProgressStatus::Completed);
        assert_eq!(result.inserted, 8);
        assert_eq!(result.errors, 2);
        assert!(result.last_item_error.unwrap().contains("dok_id"));
        assert_eq!(store.row_count("documents"), 8);
        assert!(store.audit_entries()[0].error_message.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn unpaginated_run_processes_one_page() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(&store);
        let source = ScriptedSource::new(1200, 500);

        let result = pipeline
            .run(
                documents(),
                &source,
                &stop_token(&store),
                RunPlan {
                    paginate: false,
                    max_pages: 10,
                },
            )
            .await
            .unwrap();

        assert!(result.complete);
        assert_eq!(result.pages_processed, 1);
        assert_eq!(source.fetched(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn pages_are_paced_by_the_inter_page_delay() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(&store);
        let source = ScriptedSource::new(300, 100);
        let started = tokio::time::Instant::now();

        pipeline
            .run(documents(), &source, &stop_token(&store), plan(3))
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(2 * 500));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_start_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(&store);
        let source = ScriptedSource::new(100, 100);
        let task = documents().task;

        assert!(store
            .try_acquire_lease(&task, Uuid::new_v4(), Duration::from_secs(60))
            .await
            .unwrap());

        let result = pipeline
            .run(documents(), &source, &stop_token(&store), plan(1))
            .await;

        assert!(matches!(result, Err(Error::Conflict(_))));
        assert!(source.fetched().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn attachments_are_queued_for_download() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(&store);
        let mut source = ScriptedSource::new(2, 10);
        source.item = |n| {
            json!({
                "dok_id": format!("H{n}"),
                "filbilaga": {"fil": {"url": format!("https://data.riksdagen.se/fil/H{n}.pdf"), "namn": "bilaga 1.pdf"}}
            })
        };

        pipeline
            .run(documents(), &source, &stop_token(&store), plan(1))
            .await
            .unwrap();

        let mut paths: Vec<_> = store.downloads().into_iter().map(|d| d.storage_path).collect();
        paths.sort();
        assert_eq!(paths, vec!["documents/H0/bilaga_1.pdf", "documents/H1/bilaga_1.pdf"]);
    }
}
