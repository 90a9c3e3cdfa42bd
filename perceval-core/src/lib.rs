#![doc = "perceval-core: fetch items from software repositories as enriched records."]

//! This crate holds the fetch framework and the bundled connectors.
//! The `perceval` binary crate only adds the command line, settings and output.
//!
//! # Usage
//! Build a [`backends`] connector, wrap it in a [`Backend`] with an origin,
//! optionally attach a [`Cache`] or an [`Archive`], and pull records from
//! [`Backend::fetch`].

pub mod archive;
pub mod backend;
pub mod backends;
pub mod cache;
pub mod contract;
pub mod dates;
pub mod error;
pub mod identity;
pub mod pagelog;
pub mod record;

pub use archive::{Archive, ArchiveManager, ArchiveMetadata};
pub use backend::{Backend, Fetch, FetchSummary};
pub use cache::Cache;
pub use contract::{Connector, Item, PageSource, RawPage, StaticPages};
pub use error::{
    ArchiveError, CacheError, EnrichError, FetchError, IdentityError, SourceError,
    ValidationError,
};
pub use record::{Enricher, Record, UpdatedOnFn, PERCEVAL_VERSION};
