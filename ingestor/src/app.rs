use crate::control::StopToken;
use crate::endpoint::Endpoint;
use crate::model::{Filters, ProgressRecord, RunResult, Source, TaskKey};
use crate::pipeline::{Pipeline, RunPlan};
use crate::queue::DownloadProducer;
use crate::source::{HttpSource, SourceAdapter};
use crate::store::{AuditLog, ControlChannel, DownloadQueue, ProgressStore, RecordSink};
use ingestor_core::{Config, Error, Result};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

/// Arguments of a Start, as received from the caller.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub source: String,
    pub data_type: String,
    pub filters: Filters,
    pub paginate: bool,
    pub max_pages_per_invocation: Option<u32>,
}

/// A Start that passed validation.
#[derive(Debug, Clone)]
struct PreparedRun {
    endpoint: &'static Endpoint,
    page_size: u32,
    plan: RunPlan,
}

/// Entry points of the engine: Start, Stop, Reset and GetProgress.
pub struct App {
    config: Config,
    client: Client,
    progress: Arc<dyn ProgressStore>,
    control: Arc<dyn ControlChannel>,
    pipeline: Pipeline,
}

impl App {
    #[instrument(skip_all)]
    pub fn new<S>(config: Config, store: Arc<S>) -> Result<Self>
    where
        S: RecordSink + ProgressStore + ControlChannel + DownloadQueue + AuditLog + 'static,
    {
        info!("Initializing application");

        let client = Client::builder()
            .timeout(Duration::from_secs(config.sources.http_timeout_secs))
            .user_agent(config.sources.user_agent.clone())
            .build()?;

        let downloads = DownloadProducer::new(
            store.clone(),
            config.sources.clone(),
            config.downloads.clone(),
        );

        let pipeline = Pipeline::new(
            store.clone(),
            store.clone(),
            store.clone(),
            downloads,
            config.fetch.clone(),
        );

        Ok(Self {
            config,
            client,
            progress: store.clone(),
            control: store,
            pipeline,
        })
    }

    fn api_base_url(&self, source: Source) -> &str {
        match source {
            Source::Riksdagen => &self.config.sources.riksdagen.api_base_url,
            Source::Regeringen => &self.config.sources.regeringen.api_base_url,
        }
    }

    /// Everything that can be rejected without touching the network.
    fn prepare(&self, request: &StartRequest) -> Result<PreparedRun> {
        let task = TaskKey::parse(&request.source, &request.data_type)?;
        let endpoint = Endpoint::resolve(task)?;
        endpoint.validate(&request.filters, self.config.fetch.max_page_size)?;

        let max_pages = request
            .max_pages_per_invocation
            .unwrap_or(self.config.fetch.default_max_pages_per_invocation);
        if max_pages == 0 {
            return Err(Error::InvalidInput(
                "max pages per invocation must be greater than 0".into(),
            ));
        }

        Ok(PreparedRun {
            endpoint,
            page_size: request
                .filters
                .page_size
                .unwrap_or(self.config.fetch.default_page_size),
            plan: RunPlan {
                paginate: request.paginate,
                max_pages,
            },
        })
    }

    #[instrument(skip(self), fields(source = %request.source, data_type = %request.data_type))]
    pub async fn start(&self, request: &StartRequest) -> Result<RunResult> {
        let prepared = self.prepare(request)?;
        let task = prepared.endpoint.task;

        let adapter = HttpSource::new(
            self.client.clone(),
            prepared.endpoint,
            self.api_base_url(task.source),
            &request.filters,
            prepared.page_size,
        )?;

        self.run_prepared(&prepared, &adapter).await
    }

    async fn run_prepared(&self, prepared: &PreparedRun, adapter: &dyn SourceAdapter) -> Result<RunResult> {
        let stop = StopToken::new(self.control.clone(), prepared.endpoint.task);
        self.pipeline
            .run(prepared.endpoint, adapter, &stop, prepared.plan)
            .await
    }

    #[instrument(skip(self))]
    pub async fn stop(&self, source: &str, data_type: &str) -> Result<()> {
        let task = TaskKey::parse(source, data_type)?;
        self.control.request_stop(&task).await?;
        info!(task = %task, "Stop requested");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn reset(&self, source: &str, data_type: &str) -> Result<ProgressRecord> {
        let task = TaskKey::parse(source, data_type)?;
        self.control.clear_stop(&task).await?;
        let record = self.progress.reset(&task).await?;
        info!(task = %task, "Progress reset");
        Ok(record)
    }

    /// Snapshot as of the last page boundary; never-started tasks read as pending.
    pub async fn progress(&self, source: &str, data_type: &str) -> Result<ProgressRecord> {
        let task = TaskKey::parse(source, data_type)?;
        Ok(self
            .progress
            .load(&task)
            .await?
            .unwrap_or_else(|| ProgressRecord::new(task)))
    }
}
