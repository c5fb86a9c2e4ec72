pub mod http;
pub mod json;
pub mod pagination;
pub mod xml;

use crate::model::RawItem;
use async_trait::async_trait;
use ingestor_core::Result;
use serde_json::Value;

pub use http::HttpSource;
pub use json::JsonFormat;
pub use xml::XmlFormat;

/// One page in the shape every wire format is normalised to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedPage {
    pub items: Vec<RawItem>,
    pub total_items: Option<i64>,
    pub total_pages: Option<i64>,
    pub next_cursor: Option<String>,
}

/// Turns a fetched response body into a [`NormalizedPage`].
pub trait SourceFormat: Send + Sync {
    fn name(&self) -> &'static str;

    fn parse(&self, body: &[u8]) -> Result<NormalizedPage>;
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Fetch and normalise the page the cursor points at
    async fn fetch_page(&self, cursor: &str) -> Result<NormalizedPage>;

    /// Cursor of page 1 for the caller's filters
    fn initial_cursor(&self) -> &str;

    /// Query parameter carrying the page number, used to build a next cursor
    /// when the server does not supply one
    fn page_param(&self) -> &str;

    fn source_id(&self) -> &str;
}

/// Remote APIs report counts as numbers or as numeric strings.
pub(crate) fn parse_count(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
