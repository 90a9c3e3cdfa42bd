//! Enriched records and the enrichment stage that produces them.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::contract::{Connector, Item};
use crate::dates::datetime_to_timestamp;
use crate::error::{EnrichError, ValidationError};
use crate::identity;

/// Framework version reported in every record.
pub const PERCEVAL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Caller-supplied replacement for [`Connector::metadata_updated_on`].
pub type UpdatedOnFn = Arc<dyn Fn(&Item) -> Result<f64, ValidationError> + Send + Sync>;

/// The unit the framework emits: one raw item plus provenance metadata.
///
/// Field order is the serialisation order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub data: Item,
    pub uuid: String,
    pub origin: String,
    pub updated_on: f64,
    pub timestamp: f64,
    pub backend_name: String,
    pub backend_version: String,
    pub perceval_version: String,
    pub category: String,
    pub tag: String,
}

impl Record {
    /// Serialise as a single JSON line (no trailing newline).
    pub fn to_json_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Wraps raw items with identity, timestamps, versions, category and tag.
///
/// Timestamps never go backwards over the lifetime of one enricher, even if
/// the wall clock does.
#[derive(Clone)]
pub struct Enricher {
    origin: String,
    tag: String,
    backend_name: String,
    backend_version: String,
    updated_on: Option<UpdatedOnFn>,
    last_timestamp: f64,
}

impl Enricher {
    pub fn new(
        origin: impl Into<String>,
        tag: impl Into<String>,
        backend_name: impl Into<String>,
        backend_version: impl Into<String>,
    ) -> Self {
        Enricher {
            origin: origin.into(),
            tag: tag.into(),
            backend_name: backend_name.into(),
            backend_version: backend_version.into(),
            updated_on: None,
            last_timestamp: f64::MIN,
        }
    }

    pub fn with_updated_on(mut self, updated_on: Option<UpdatedOnFn>) -> Self {
        self.updated_on = updated_on;
        self
    }

    pub fn enrich(&mut self, item: Item, connector: &dyn Connector) -> Result<Record, EnrichError> {
        let identifier = connector.metadata_id(&item)?;
        let updated_on = match &self.updated_on {
            Some(updated_on) => (**updated_on)(&item)?,
            None => connector.metadata_updated_on(&item)?,
        };
        let uuid = identity::uuid(&[self.origin.as_str(), identifier.as_str()])?;
        let category = connector.metadata_category(&item);

        let now = datetime_to_timestamp(&Utc::now());
        self.last_timestamp = self.last_timestamp.max(now);

        Ok(Record {
            data: item,
            uuid,
            origin: self.origin.clone(),
            updated_on,
            timestamp: self.last_timestamp,
            backend_name: self.backend_name.clone(),
            backend_version: self.backend_version.clone(),
            perceval_version: PERCEVAL_VERSION.to_string(),
            category,
            tag: self.tag.clone(),
        })
    }

    /// The enrichment stage over a whole item sequence: one result per item,
    /// in input order.
    pub fn enrich_items<'a, I>(
        &'a mut self,
        items: I,
        connector: &'a dyn Connector,
    ) -> impl Iterator<Item = Result<Record, EnrichError>> + 'a
    where
        I: IntoIterator<Item = Item>,
        I::IntoIter: 'a,
    {
        items
            .into_iter()
            .map(move |item| self.enrich(item, connector))
    }
}
