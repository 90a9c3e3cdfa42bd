//! # contract: capability interface every connector implements
//!
//! A connector turns one kind of source (a directory of mboxes, a JIRA
//! instance, a StackExchange site) into raw pages and raw items. The
//! [`crate::backend::Backend`] composes a connector with the replay cache, the
//! archive and the record enricher; connectors never touch those directly.
//!
//! ## Two-stage fetch
//! - [`Connector::fetch_pages`] opens a [`PageSource`], the source client that
//!   yields raw pages one at a time. Pagination, authentication and backoff
//!   belong to the page source.
//! - [`Connector::parse_page`] turns one raw page into raw items. It must be a
//!   pure function of the page so replays from the cache or an archive give
//!   the same items as the live fetch.
//!
//! ## Metadata
//! - [`Connector::metadata_id`] returns the item's natural key; it feeds the
//!   identity hasher and must be non-empty.
//! - [`Connector::metadata_updated_on`] returns a UNIX timestamp.
//! - [`Connector::metadata_category`] returns the item-type tag.
//!
//! ## Mocking & Testing
//! Both traits are annotated for `mockall` (feature `test-export-mocks`), so
//! downstream crates can script page sequences and metadata failures.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mockall::automock;

use crate::error::{SourceError, ValidationError};

/// A raw item produced by a connector. Opaque to the core.
pub type Item = serde_json::Value;

/// One unparsed chunk of source data, the unit of cache durability.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct RawPage(Vec<u8>);

impl RawPage {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        RawPage(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The page content as text, replacing invalid UTF-8 sequences.
    pub fn to_text(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

impl fmt::Debug for RawPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawPage").field("len", &self.0.len()).finish()
    }
}

impl From<Vec<u8>> for RawPage {
    fn from(bytes: Vec<u8>) -> Self {
        RawPage(bytes)
    }
}

impl From<String> for RawPage {
    fn from(text: String) -> Self {
        RawPage(text.into_bytes())
    }
}

impl From<&str> for RawPage {
    fn from(text: &str) -> Self {
        RawPage(text.as_bytes().to_vec())
    }
}

/// Source client yielding raw pages in order.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait PageSource: Send {
    /// Next raw page, or `None` once the source signals there are no more.
    ///
    /// A recoverable error (see [`SourceError::is_recoverable`]) only affects
    /// the current page/file; callers may keep pulling afterwards.
    async fn next_page(&mut self) -> Result<Option<RawPage>, SourceError>;
}

/// Source-specific half of a backend.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Backend name reported in every record.
    fn name(&self) -> &'static str;

    /// Backend schema version, distinct from the framework version.
    fn version(&self) -> &'static str;

    /// Whether raw pages can be stored in and replayed from a cache.
    fn has_caching(&self) -> bool;

    /// Whether an interrupted fetch can be resumed with a later `from_date`.
    fn has_resuming(&self) -> bool;

    /// Open the source client for items updated at or after `from_date`.
    async fn fetch_pages(
        &self,
        from_date: DateTime<Utc>,
    ) -> Result<Box<dyn PageSource>, SourceError>;

    /// Split a raw page into raw items.
    fn parse_page(&self, page: &RawPage) -> Result<Vec<Item>, SourceError>;

    fn metadata_id(&self, item: &Item) -> Result<String, ValidationError>;

    fn metadata_updated_on(&self, item: &Item) -> Result<f64, ValidationError>;

    fn metadata_category(&self, item: &Item) -> String;
}

/// A page source over a fixed list of pages, for replays and tests.
pub struct StaticPages {
    pages: std::collections::VecDeque<Result<RawPage, SourceError>>,
}

impl StaticPages {
    pub fn new(pages: impl IntoIterator<Item = Result<RawPage, SourceError>>) -> Self {
        StaticPages {
            pages: pages.into_iter().collect(),
        }
    }
}

#[async_trait]
impl PageSource for StaticPages {
    async fn next_page(&mut self) -> Result<Option<RawPage>, SourceError> {
        self.pages.pop_front().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_pages_yield_in_order_then_none() {
        let mut source = StaticPages::new(vec![
            Ok(RawPage::from("first")),
            Err(SourceError::MalformedPage("broken".into())),
            Ok(RawPage::from("second")),
        ]);

        assert_eq!(
            source.next_page().await.unwrap(),
            Some(RawPage::from("first"))
        );
        assert!(source.next_page().await.is_err());
        assert_eq!(
            source.next_page().await.unwrap(),
            Some(RawPage::from("second"))
        );
        assert_eq!(source.next_page().await.unwrap(), None);
    }

    #[test]
    fn raw_page_debug_hides_content() {
        let page = RawPage::from("secret token");
        assert_eq!(format!("{page:?}"), "RawPage { len: 12 }");
    }
}
