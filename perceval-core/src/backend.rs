//! # backend: fetch sessions over a connector
//!
//! [`Backend`] binds a [`Connector`] to an origin, an optional tag, an
//! optional replay [`Cache`] and an optional [`Archive`]. Each call to
//! [`Backend::fetch`], [`Backend::fetch_from_cache`] or
//! [`Backend::fetch_from_archive`] starts a [`Fetch`] session: a pull cursor
//! that yields one [`Record`] at a time.
//!
//! ## Session steps
//! 1. Init: the cache is purged of stale pending pages and the archive, if
//!    any, is stamped with the session metadata.
//! 2. Sourcing: the connector's page source is opened on the first pull.
//! 3. Durability: each live page is pushed and flushed to the cache and
//!    stored in the archive before it is parsed.
//! 4. Parse and enrich: items are yielded as soon as they are enriched.
//!
//! ## Failures
//! Invalid items and recoverable page errors are logged and skipped, and they
//! show up in [`FetchSummary`]. Everything else ends the session with a
//! [`FetchError`]; the cursor returns `None` afterwards.
//!
//! Dropping a [`Fetch`] stops sourcing; no page is requested until the next
//! pull.

use std::collections::VecDeque;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::archive::Archive;
use crate::cache::Cache;
use crate::contract::{Connector, Item, PageSource, RawPage};
use crate::dates::{datetime_to_timestamp, default_datetime};
use crate::error::{ArchiveError, CacheError, EnrichError, FetchError, Result};
use crate::pagelog::PageReader;
use crate::record::{Enricher, Record, UpdatedOnFn};

pub struct Backend {
    connector: Box<dyn Connector>,
    origin: String,
    tag: Option<String>,
    cache: Option<Cache>,
    archive: Option<Archive>,
    updated_on: Option<UpdatedOnFn>,
}

impl Backend {
    /// Bind `connector` to `origin`. The origin must not be empty.
    pub fn new(origin: impl Into<String>, connector: Box<dyn Connector>) -> Result<Self> {
        let origin = origin.into();
        if origin.is_empty() {
            return Err(FetchError::Configuration(
                "backend origin cannot be empty".to_string(),
            ));
        }
        Ok(Backend {
            connector,
            origin,
            tag: None,
            cache: None,
            archive: None,
            updated_on: None,
        })
    }

    /// Label records with `tag` instead of the origin.
    pub fn with_tag(mut self, tag: Option<String>) -> Self {
        self.tag = tag;
        self
    }

    pub fn with_cache(mut self, cache: Cache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_archive(mut self, archive: Archive) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Replace the connector's `metadata_updated_on` for every record.
    pub fn with_updated_on(mut self, updated_on: UpdatedOnFn) -> Self {
        self.updated_on = Some(updated_on);
        self
    }

    pub fn set_archive(&mut self, archive: Option<Archive>) {
        self.archive = archive;
    }

    pub fn take_cache(&mut self) -> Option<Cache> {
        self.cache.take()
    }

    pub fn take_archive(&mut self) -> Option<Archive> {
        self.archive.take()
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// The tag, which defaults to the origin.
    pub fn tag(&self) -> &str {
        self.tag.as_deref().unwrap_or(&self.origin)
    }

    pub fn name(&self) -> &'static str {
        self.connector.name()
    }

    pub fn version(&self) -> &'static str {
        self.connector.version()
    }

    pub fn has_caching(&self) -> bool {
        self.connector.has_caching()
    }

    pub fn has_resuming(&self) -> bool {
        self.connector.has_resuming()
    }

    pub fn cache(&self) -> Option<&Cache> {
        self.cache.as_ref()
    }

    pub fn cache_mut(&mut self) -> Option<&mut Cache> {
        self.cache.as_mut()
    }

    pub fn archive(&self) -> Option<&Archive> {
        self.archive.as_ref()
    }

    /// Start a live session for items updated at or after `from_date`
    /// (`None` means all history).
    pub fn fetch(&mut self, from_date: Option<DateTime<Utc>>) -> Result<Fetch<'_>> {
        let from_date = from_date.unwrap_or_else(default_datetime);

        if self.cache.is_some() && !self.connector.has_caching() {
            return Err(FetchError::Configuration(format!(
                "{} backend does not support items cache",
                self.connector.name()
            )));
        }
        if let Some(cache) = self.cache.as_mut() {
            cache.purge();
        }
        if let Some(archive) = self.archive.as_mut() {
            if !archive.metadata().is_initialized() {
                let params = json!({
                    "origin": self.origin,
                    "tag": self.tag.as_deref().unwrap_or(&self.origin),
                    "from_date": from_date.to_rfc3339(),
                });
                archive.init_metadata(
                    &self.origin,
                    self.connector.name(),
                    self.connector.version(),
                    params,
                )?;
            }
        }

        info!(
            origin = %self.origin,
            backend = self.connector.name(),
            from_date = %from_date,
            "Fetching items"
        );

        let span = self.session_span("live");
        let enricher = self.enricher();
        Ok(Fetch {
            connector: self.connector.as_ref(),
            cache: self.cache.as_mut(),
            archive: self.archive.as_mut(),
            enricher,
            feed: Feed::Pending(from_date),
            from_ts: Some(datetime_to_timestamp(&from_date)),
            items: VecDeque::new(),
            summary: FetchSummary::default(),
            finished: false,
            span,
        })
    }

    /// Replay the pages committed to the cache. Nothing is filtered or stored.
    pub fn fetch_from_cache(&mut self) -> Result<Fetch<'_>> {
        if !self.connector.has_caching() {
            return Err(FetchError::Configuration(format!(
                "{} backend does not support items cache",
                self.connector.name()
            )));
        }
        let Some(cache) = self.cache.as_ref() else {
            return Err(FetchError::Configuration("cache was not provided".to_string()));
        };

        info!(origin = %self.origin, path = %cache.path().display(), "Retrieving cached items");
        let reader = cache.retrieve()?;
        let source = ReplaySource::Cache(cache.log_path().to_path_buf());
        Ok(self.replay(reader, source))
    }

    /// Replay the pages stored in the attached archive.
    pub fn fetch_from_archive(&mut self) -> Result<Fetch<'_>> {
        let Some(archive) = self.archive.as_ref() else {
            return Err(FetchError::Configuration(
                "archive was not provided".to_string(),
            ));
        };

        info!(origin = %self.origin, path = %archive.path().display(), "Retrieving archived items");
        let reader = archive.retrieve()?;
        let source = ReplaySource::Archive(archive.path().to_path_buf());
        Ok(self.replay(reader, source))
    }

    fn replay(&self, reader: PageReader, source: ReplaySource) -> Fetch<'_> {
        let span = self.session_span(source.label());
        Fetch {
            connector: self.connector.as_ref(),
            cache: None,
            archive: None,
            enricher: self.enricher(),
            feed: Feed::Replay { reader, source },
            from_ts: None,
            items: VecDeque::new(),
            summary: FetchSummary::default(),
            finished: false,
            span,
        }
    }

    fn enricher(&self) -> Enricher {
        Enricher::new(
            self.origin.clone(),
            self.tag().to_string(),
            self.connector.name(),
            self.connector.version(),
        )
        .with_updated_on(self.updated_on.clone())
    }

    fn session_span(&self, mode: &'static str) -> Span {
        info_span!(
            "fetch",
            origin = %self.origin,
            backend = self.connector.name(),
            mode
        )
    }
}

/// Counters of one fetch session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchSummary {
    /// Pages obtained from the source.
    pub pages: usize,
    /// Pages skipped because they could not be read or parsed.
    pub skipped_pages: usize,
    /// Items parsed out of the pages.
    pub seen: usize,
    /// Records yielded.
    pub fetched: usize,
    /// Items skipped because their metadata was invalid.
    pub ignored: usize,
    /// Items dropped for being older than `from_date`.
    pub filtered: usize,
}

enum ReplaySource {
    Cache(PathBuf),
    Archive(PathBuf),
}

impl ReplaySource {
    fn label(&self) -> &'static str {
        match self {
            ReplaySource::Cache(_) => "cache",
            ReplaySource::Archive(_) => "archive",
        }
    }

    fn read_error(&self, e: std::io::Error) -> FetchError {
        match self {
            ReplaySource::Cache(path) => CacheError::io(path, e).into(),
            ReplaySource::Archive(path) => ArchiveError::io(path, e).into(),
        }
    }
}

enum Feed {
    Pending(DateTime<Utc>),
    Live(Box<dyn PageSource>),
    Replay {
        reader: PageReader,
        source: ReplaySource,
    },
    Done,
}

/// A fetch session. Pull records with [`Fetch::next_record`] or turn it into
/// a stream with [`Fetch::into_stream`].
pub struct Fetch<'a> {
    connector: &'a dyn Connector,
    cache: Option<&'a mut Cache>,
    archive: Option<&'a mut Archive>,
    enricher: Enricher,
    feed: Feed,
    from_ts: Option<f64>,
    items: VecDeque<Item>,
    summary: FetchSummary,
    finished: bool,
    span: Span,
}

impl<'a> Fetch<'a> {
    /// Next record, or `None` when the session is over.
    pub async fn next_record(&mut self) -> Result<Option<Record>> {
        let span = self.span.clone();
        let result = self.advance().instrument(span).await;
        if let Err(e) = &result {
            let _enter = self.span.enter();
            warn!(error = %e, "Fetch session aborted");
            self.feed = Feed::Done;
            self.items.clear();
            self.finished = true;
        }
        result
    }

    pub fn summary(&self) -> &FetchSummary {
        &self.summary
    }

    /// The session as a stream. The stream ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Record>> + 'a {
        futures::stream::unfold(Some(self), |state| async move {
            let mut fetch = state?;
            match fetch.next_record().await {
                Ok(Some(record)) => Some((Ok(record), Some(fetch))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    async fn advance(&mut self) -> Result<Option<Record>> {
        loop {
            if let Some(item) = self.items.pop_front() {
                match self.enricher.enrich(item, self.connector) {
                    Ok(record) => {
                        if let Some(from_ts) = self.from_ts {
                            if record.updated_on < from_ts {
                                self.summary.filtered += 1;
                                debug!(uuid = %record.uuid, "Filtering item older than from_date");
                                continue;
                            }
                        }
                        self.summary.fetched += 1;
                        return Ok(Some(record));
                    }
                    Err(EnrichError::Invalid(e)) => {
                        self.summary.ignored += 1;
                        warn!(error = %e, "Skipping invalid item");
                        continue;
                    }
                    Err(EnrichError::Identity(e)) => return Err(e.into()),
                }
            }

            let Some(page) = self.next_page().await? else {
                self.finish();
                return Ok(None);
            };

            match self.connector.parse_page(&page) {
                Ok(items) => {
                    self.summary.seen += items.len();
                    self.items.extend(items);
                }
                Err(e) if e.is_recoverable() => {
                    self.summary.skipped_pages += 1;
                    warn!(error = %e, "Skipping page that could not be parsed");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn next_page(&mut self) -> Result<Option<RawPage>> {
        loop {
            let (page, live) = match &mut self.feed {
                Feed::Pending(from_date) => {
                    let from_date = *from_date;
                    let source = self.connector.fetch_pages(from_date).await?;
                    self.feed = Feed::Live(source);
                    continue;
                }
                Feed::Live(source) => match source.next_page().await {
                    Ok(Some(page)) => (page, true),
                    Ok(None) => return Ok(None),
                    Err(e) if e.is_recoverable() => {
                        self.summary.skipped_pages += 1;
                        warn!(error = %e, "Skipping unreadable page");
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                },
                Feed::Replay { reader, source } => match reader.next() {
                    Some(Ok(page)) => (page, false),
                    Some(Err(e)) => return Err(source.read_error(e)),
                    None => return Ok(None),
                },
                Feed::Done => return Ok(None),
            };

            if live {
                self.persist(&page)?;
            }
            self.summary.pages += 1;
            return Ok(Some(page));
        }
    }

    fn persist(&mut self, page: &RawPage) -> Result<()> {
        if let Some(cache) = self.cache.as_deref_mut() {
            cache.push(page.clone());
            cache.flush()?;
        }
        if let Some(archive) = self.archive.as_deref_mut() {
            archive.store(page)?;
        }
        Ok(())
    }

    fn finish(&mut self) {
        self.feed = Feed::Done;
        if self.finished {
            return;
        }
        self.finished = true;
        let s = &self.summary;
        info!(
            pages = s.pages,
            skipped_pages = s.skipped_pages,
            "Done. {}/{} items fetched; {} ignored",
            s.fetched,
            s.seen - s.filtered,
            s.ignored
        );
    }
}
