//! # StackExchange connector
//!
//! Fetches the questions of a StackExchange site, most recently active first,
//! through `GET {api}/2.2/questions`. Each API response page is one raw page.
//! When the API asks clients to back off, the next request waits that many
//! seconds.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use tracing::{debug, info};

use crate::contract::{Connector, Item, PageSource, RawPage};
use crate::error::{SourceError, ValidationError};

use super::{identifier, required};

/// Questions requested per page unless configured otherwise.
pub const MAX_QUESTIONS: u32 = 100;

pub const STACKEXCHANGE_API_URL: &str = "https://api.stackexchange.com";

const VERSION_API: &str = "2.2";

/// Immutable, non-expiring API filter that includes answers and comments.
const QUESTIONS_FILTER: &str = "Bf*y*ByQD_upZqozgU6lXL_62USGOoV3)MFNgiHqHpmO_Y-jHR";

#[derive(Debug, Clone)]
pub struct StackExchange {
    site: String,
    tagged: Option<String>,
    token: Option<String>,
    max_questions: u32,
    api_url: String,
}

impl StackExchange {
    pub fn new(site: impl Into<String>) -> Self {
        StackExchange {
            site: site.into(),
            tagged: None,
            token: None,
            max_questions: MAX_QUESTIONS,
            api_url: STACKEXCHANGE_API_URL.to_string(),
        }
    }

    /// Only fetch questions with this tag.
    pub fn with_tagged(mut self, tagged: Option<String>) -> Self {
        self.tagged = tagged;
        self
    }

    /// API key sent as the `key` parameter.
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_max_questions(mut self, max_questions: u32) -> Self {
        self.max_questions = max_questions.max(1);
        self
    }

    /// Talk to another API server, e.g. a local mock.
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    fn questions_url(&self) -> String {
        format!(
            "{}/{}/questions",
            self.api_url.trim_end_matches('/'),
            VERSION_API
        )
    }

    fn params(&self, from_date: DateTime<Utc>) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("pagesize", self.max_questions.to_string()),
            ("order", "desc".to_string()),
            ("sort", "activity".to_string()),
        ];
        if let Some(tagged) = &self.tagged {
            params.push(("tagged", tagged.clone()));
        }
        params.push(("site", self.site.clone()));
        if let Some(token) = &self.token {
            params.push(("key", token.clone()));
        }
        params.push(("filter", QUESTIONS_FILTER.to_string()));
        params.push(("min", from_date.timestamp().to_string()));
        params
    }
}

#[async_trait]
impl Connector for StackExchange {
    fn name(&self) -> &'static str {
        "StackExchange"
    }

    fn version(&self) -> &'static str {
        "0.4.0"
    }

    fn has_caching(&self) -> bool {
        true
    }

    fn has_resuming(&self) -> bool {
        true
    }

    async fn fetch_pages(
        &self,
        from_date: DateTime<Utc>,
    ) -> Result<Box<dyn PageSource>, SourceError> {
        info!(
            site = %self.site,
            tagged = self.tagged.as_deref().unwrap_or("<any>"),
            from_date = %from_date,
            "Looking for questions"
        );
        Ok(Box::new(QuestionPages {
            client: Client::new(),
            url: self.questions_url(),
            params: self.params(from_date),
            page: 1,
            fetched: 0,
            backoff: None,
            done: false,
        }))
    }

    fn parse_page(&self, page: &RawPage) -> Result<Vec<Item>, SourceError> {
        let mut data: Item = serde_json::from_slice(page.as_bytes()).map_err(|e| {
            SourceError::MalformedPage(format!("invalid StackExchange page: {e}"))
        })?;
        match data.get_mut("items").map(Item::take) {
            Some(Item::Array(questions)) => Ok(questions),
            _ => Err(SourceError::MalformedPage(
                "StackExchange page has no 'items' list".to_string(),
            )),
        }
    }

    fn metadata_id(&self, item: &Item) -> Result<String, ValidationError> {
        identifier(item, "question_id")
    }

    fn metadata_updated_on(&self, item: &Item) -> Result<f64, ValidationError> {
        required(item, "last_activity_date")?
            .as_f64()
            .ok_or_else(|| ValidationError::unexpected_type("last_activity_date"))
    }

    fn metadata_category(&self, _item: &Item) -> String {
        "question".to_string()
    }
}

struct QuestionPages {
    client: Client,
    url: String,
    params: Vec<(&'static str, String)>,
    page: u64,
    fetched: u64,
    backoff: Option<Duration>,
    done: bool,
}

impl QuestionPages {
    fn http(&self, source: reqwest::Error) -> SourceError {
        SourceError::Http {
            url: self.url.clone(),
            source,
        }
    }

    fn protocol(&self, reason: impl Into<String>) -> SourceError {
        SourceError::Protocol {
            url: self.url.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl PageSource for QuestionPages {
    async fn next_page(&mut self) -> Result<Option<RawPage>, SourceError> {
        if self.done {
            return Ok(None);
        }
        if let Some(backoff) = self.backoff.take() {
            debug!(seconds = backoff.as_secs_f64(), "Expensive query. Waiting before the next request");
            tokio::time::sleep(backoff).await;
        }

        let page = self.page.to_string();
        let response = self
            .client
            .get(&self.url)
            .query(&[("page", page.as_str())])
            .query(&self.params)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| self.http(e))?;
        let body = response.text().await.map_err(|e| self.http(e))?;

        let data: Item = serde_json::from_str(&body)
            .map_err(|e| self.protocol(format!("invalid JSON: {e}")))?;
        let has_more = data
            .get("has_more")
            .and_then(Item::as_bool)
            .ok_or_else(|| self.protocol("missing 'has_more'"))?;
        let received = data
            .get("items")
            .and_then(Item::as_array)
            .map(Vec::len)
            .unwrap_or_default() as u64;

        debug!(
            quota_remaining = ?data.get("quota_remaining").and_then(Item::as_u64),
            quota_max = ?data.get("quota_max").and_then(Item::as_u64),
            "Rate limit"
        );
        self.fetched += received;
        match data.get("total").and_then(Item::as_u64) {
            Some(0) => info!("No questions were found."),
            Some(total) => info!("Fetching questions: {}/{}", self.fetched, total),
            None => info!("Fetching questions: {}", self.fetched),
        }

        let backoff = match data.get("backoff").and_then(Item::as_f64) {
            Some(secs) if secs > 0.0 => Some(
                Duration::try_from_secs_f64(secs)
                    .map_err(|_| self.protocol(format!("invalid 'backoff': {secs}")))?,
            ),
            _ => None,
        };

        self.page += 1;
        self.done = !has_more;
        self.backoff = backoff;

        Ok(Some(RawPage::from(body)))
    }
}
