//! # JIRA connector
//!
//! Fetches the issues of a JIRA server through `GET {url}/rest/api/2/search`,
//! one search result page per raw page. Issues updated after `from_date` are
//! selected with JQL, optionally restricted to one project.
//!
//! Pagination follows `startAt`/`maxResults`/`total`. HTTP failures and
//! responses that cannot be paginated end the session; a page whose issues
//! cannot be parsed is skipped.

use std::cmp::min;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use tracing::{debug, info};

use crate::contract::{Connector, Item, PageSource, RawPage};
use crate::dates::{datetime_to_timestamp, str_to_datetime};
use crate::error::{SourceError, ValidationError};

use super::{identifier, required};

/// Issues requested per search page unless configured otherwise.
pub const MAX_ISSUES: u32 = 100;

const EXPAND: &str = "renderedFields,transitions,operations,changelog";
const SEARCH_RESOURCE: &str = "rest/api/2/search";

#[derive(Debug, Clone)]
pub struct Jira {
    url: String,
    project: Option<String>,
    credentials: Option<(String, String)>,
    verify: bool,
    max_issues: u32,
}

impl Jira {
    pub fn new(url: impl Into<String>) -> Self {
        Jira {
            url: url.into(),
            project: None,
            credentials: None,
            verify: true,
            max_issues: MAX_ISSUES,
        }
    }

    pub fn with_project(mut self, project: Option<String>) -> Self {
        self.project = project;
        self
    }

    /// Authenticate every request with HTTP basic auth.
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((user.into(), password.into()));
        self
    }

    /// `false` accepts any TLS certificate.
    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn with_max_issues(mut self, max_issues: u32) -> Self {
        self.max_issues = max_issues.max(1);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn search_url(&self) -> String {
        format!("{}/{}", self.url.trim_end_matches('/'), SEARCH_RESOURCE)
    }

    fn jql(&self, from_date: DateTime<Utc>) -> String {
        let date = from_date.format("%Y-%m-%d %H:%M");
        match &self.project {
            Some(project) => format!("project = {project} AND updated > \"{date}\""),
            None => format!("updated > \"{date}\""),
        }
    }
}

#[async_trait]
impl Connector for Jira {
    fn name(&self) -> &'static str {
        "Jira"
    }

    fn version(&self) -> &'static str {
        "0.1.0"
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
        let search_url = self.search_url();
        let client = Client::builder()
            .danger_accept_invalid_certs(!self.verify)
            .build()
            .map_err(|source| SourceError::Http {
                url: search_url.clone(),
                source,
            })?;

        info!(
            url = %self.url,
            project = self.project.as_deref().unwrap_or("<all>"),
            from_date = %from_date,
            "Looking for issues"
        );
        Ok(Box::new(JiraPages {
            client,
            jql: self.jql(from_date),
            search_url,
            credentials: self.credentials.clone(),
            max_issues: self.max_issues,
            start_at: 0,
            done: false,
        }))
    }

    fn parse_page(&self, page: &RawPage) -> Result<Vec<Item>, SourceError> {
        let mut data: Item = serde_json::from_slice(page.as_bytes())
            .map_err(|e| SourceError::MalformedPage(format!("invalid JIRA search page: {e}")))?;
        match data.get_mut("issues").map(Item::take) {
            Some(Item::Array(issues)) => Ok(issues),
            _ => Err(SourceError::MalformedPage(
                "JIRA search page has no 'issues' list".to_string(),
            )),
        }
    }

    fn metadata_id(&self, item: &Item) -> Result<String, ValidationError> {
        identifier(item, "id")
    }

    fn metadata_updated_on(&self, item: &Item) -> Result<f64, ValidationError> {
        let updated = required(required(item, "fields")?, "updated")?
            .as_str()
            .ok_or_else(|| ValidationError::unexpected_type("updated"))?;
        Ok(datetime_to_timestamp(&str_to_datetime(updated)?))
    }

    fn metadata_category(&self, _item: &Item) -> String {
        "issue".to_string()
    }
}

struct JiraPages {
    client: Client,
    search_url: String,
    jql: String,
    credentials: Option<(String, String)>,
    max_issues: u32,
    start_at: u64,
    done: bool,
}

impl JiraPages {
    fn http(&self, source: reqwest::Error) -> SourceError {
        SourceError::Http {
            url: self.search_url.clone(),
            source,
        }
    }

    fn protocol(&self, reason: impl Into<String>) -> SourceError {
        SourceError::Protocol {
            url: self.search_url.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl PageSource for JiraPages {
    async fn next_page(&mut self) -> Result<Option<RawPage>, SourceError> {
        if self.done {
            return Ok(None);
        }

        let start_at = self.start_at.to_string();
        let max_results = self.max_issues.to_string();
        let mut request = self.client.get(&self.search_url).query(&[
            ("jql", self.jql.as_str()),
            ("startAt", start_at.as_str()),
            ("expand", EXPAND),
            ("maxResults", max_results.as_str()),
        ]);
        if let Some((user, password)) = &self.credentials {
            request = request.basic_auth(user, Some(password));
        }

        debug!(url = %self.search_url, start_at = self.start_at, "Requesting JIRA issues");
        let response = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| self.http(e))?;
        let body = response.text().await.map_err(|e| self.http(e))?;

        let data: Item = serde_json::from_str(&body)
            .map_err(|e| self.protocol(format!("invalid JSON: {e}")))?;
        let total = data
            .get("total")
            .and_then(Item::as_u64)
            .ok_or_else(|| self.protocol("missing 'total'"))?;
        let received = data
            .get("issues")
            .and_then(Item::as_array)
            .map(Vec::len)
            .ok_or_else(|| self.protocol("missing 'issues'"))? as u64;
        let start = data
            .get("startAt")
            .and_then(Item::as_u64)
            .unwrap_or(self.start_at);

        self.start_at = start + received;
        if received == 0 || self.start_at >= total {
            self.done = true;
        }

        if total == 0 {
            info!("No issues were found.");
        } else {
            info!("Fetching issues: {}/{}", min(self.start_at, total), total);
        }
        Ok(Some(RawPage::from(body)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn jql_filters_by_date_and_project() {
        let from_date = str_to_datetime("2015-01-01 10:30:59").unwrap();
        let jira = Jira::new("http://example.com/");
        assert_eq!(jira.jql(from_date), "updated > \"2015-01-01 10:30\"");

        let jira = jira.with_project(Some("PERCEVAL".to_string()));
        assert_eq!(
            jira.jql(from_date),
            "project = PERCEVAL AND updated > \"2015-01-01 10:30\""
        );
        assert_eq!(jira.search_url(), "http://example.com/rest/api/2/search");
    }

    #[test]
    fn parses_issues_and_metadata() {
        let jira = Jira::new("http://example.com");
        let page = json!({
            "startAt": 0,
            "maxResults": 50,
            "total": 2,
            "issues": [
                {"id": "1", "key": "P-1", "fields": {"updated": "2015-06-25T10:52:12.000+0200"}},
                {"id": "2", "key": "P-2", "fields": {}}
            ]
        })
        .to_string();

        let issues = jira.parse_page(&RawPage::from(page)).unwrap();
        assert_eq!(issues.len(), 2);
        assert_eq!(jira.metadata_id(&issues[0]).unwrap(), "1");
        assert_eq!(jira.metadata_updated_on(&issues[0]).unwrap(), 1435222332.0);
        assert_eq!(jira.metadata_category(&issues[0]), "issue");
        assert_eq!(
            jira.metadata_updated_on(&issues[1]),
            Err(ValidationError::missing("updated"))
        );
    }

    #[test]
    fn malformed_pages_are_recoverable() {
        let jira = Jira::new("http://example.com");
        for page in ["not json", "{\"total\": 0}"] {
            let err = jira.parse_page(&RawPage::from(page)).unwrap_err();
            assert!(err.is_recoverable(), "{err}");
        }
    }
}
