use super::{NormalizedPage, SourceAdapter};
use crate::endpoint::Endpoint;
use crate::model::Filters;
use async_trait::async_trait;
use bytes::Bytes;
use ingestor_core::{Error, Result};
use metrics::histogram;
use reqwest::header::{HeaderValue, RETRY_AFTER};
use reqwest::{Client, StatusCode, Url};
use std::time::Instant;
use tracing::{debug, instrument};

/// Longest Retry-After honoured from a 429.
const MAX_RETRY_AFTER_SECS: u64 = 120;

/// Fetches list pages over HTTP and normalises them with the endpoint's
/// wire format.
pub struct HttpSource {
    client: Client,
    endpoint: &'static Endpoint,
    initial_cursor: String,
    page_size: u32,
    source_id: String,
}

impl HttpSource {
    pub fn new(
        client: Client,
        endpoint: &'static Endpoint,
        api_base_url: &str,
        filters: &Filters,
        page_size: u32,
    ) -> Result<Self> {
        let initial_cursor = endpoint.first_page_url(api_base_url, filters, page_size)?;

        Ok(Self {
            client,
            endpoint,
            initial_cursor,
            page_size,
            source_id: endpoint.task.to_string(),
        })
    }

    async fn fetch_body(&self, url: Url) -> Result<Bytes> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = retry_after_secs(response.headers().get(RETRY_AFTER));
            return Err(Error::RateLimit { retry_after_secs });
        }

        if !status.is_success() {
            return Err(Error::Ingest {
                source_name: self.source_id.clone(),
                details: format!("HTTP {status} for {url}"),
            });
        }

        Ok(response.bytes().await?)
    }
}

/// Delay-seconds form only; HTTP dates and garbage fall back to one second.
fn retry_after_secs(header: Option<&HeaderValue>) -> u64 {
    header
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(1)
        .min(MAX_RETRY_AFTER_SECS)
}

/// Fills in what the wire format leaves implicit: relative next links become
/// absolute, the page count is derived from the item total, and endpoints
/// that return everything at once report a single page.
pub fn normalize(
    mut page: NormalizedPage,
    current: &Url,
    page_size: u32,
    paginated: bool,
) -> NormalizedPage {
    if !paginated {
        page.total_pages = Some(1);
        page.next_cursor = None;
        return page;
    }

    page.next_cursor = page
        .next_cursor
        .and_then(|next| current.join(&next).ok())
        .map(|url| url.to_string());

    if page.total_pages.is_none() && page_size > 0 {
        page.total_pages = page
            .total_items
            .map(|total| (total + i64::from(page_size) - 1) / i64::from(page_size));
    }

    page
}

#[async_trait]
impl SourceAdapter for HttpSource {
    #[instrument(skip(self), fields(source = %self.source_id))]
    async fn fetch_page(&self, cursor: &str) -> Result<NormalizedPage> {
        let url = Url::parse(cursor)
            .map_err(|e| Error::InvalidInput(format!("invalid page cursor '{cursor}': {e}")))?;

        let started = Instant::now();
        let body = self.fetch_body(url.clone()).await?;
        let format = self.endpoint.format.parser();
        let page = format.parse(&body)?;
        let page = normalize(page, &url, self.page_size, self.endpoint.paginated);

        histogram!("ingestor_fetch_duration_ms", "source" => self.source_id.clone())
            .record(started.elapsed().as_millis() as f64);

        debug!(
            format = format.name(),
            bytes = body.len(),
            items = page.items.len(),
            total_items = ?page.total_items,
            total_pages = ?page.total_pages,
            next = ?page.next_cursor,
            "Fetched page"
        );

        Ok(page)
    }

    fn initial_cursor(&self) -> &str {
        &self.initial_cursor
    }

    fn page_param(&self) -> &str {
        self.endpoint.page_param
    }

    fn source_id(&self) -> &str {
        &self.source_id
    }
}
