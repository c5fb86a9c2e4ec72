//! Cursor advancement shared by every source.
//!
//! A server-supplied next link always wins. When it is absent but the task's
//! page total says more pages exist, the next cursor is rebuilt from the
//! current URL by setting the page-number parameter to `current_page + 1`.
//! Some list endpoints never emit a next link, so this fallback is what keeps
//! them moving.

use super::NormalizedPage;
use ingestor_core::{Error, Result};
use reqwest::Url;

/// `cursor` with `page_param` set to `page`; other query pairs keep their order.
pub fn page_url(cursor: &str, page_param: &str, page: i64) -> Result<String> {
    let mut url = Url::parse(cursor)
        .map_err(|e| Error::InvalidInput(format!("invalid page cursor '{cursor}': {e}")))?;

    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != page_param)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    url.query_pairs_mut()
        .clear()
        .extend_pairs(pairs)
        .append_pair(page_param, &page.to_string());

    Ok(url.to_string())
}

/// Cursor for the page after `page`, or `None` when pagination is finished.
///
/// `current_page` is the number of the page just processed and
/// `total_pages` the best known page count (0 when unknown).
pub fn next_cursor(
    current: &str,
    page: &NormalizedPage,
    page_param: &str,
    current_page: i64,
    total_pages: i64,
) -> Result<Option<String>> {
    if page.items.is_empty() {
        return Ok(None);
    }

    match page.next_cursor.as_deref() {
        Some(next) if next == current => Ok(None),
        Some(next) => Ok(Some(next.to_string())),
        None if total_pages > current_page => {
            page_url(current, page_param, current_page + 1).map(Some)
        }
        None => Ok(None),
    }
}
