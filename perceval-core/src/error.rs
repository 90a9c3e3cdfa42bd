//! Error taxonomy shared by every component of the core.
//!
//! Per-item ([`ValidationError`]) and per-page (recoverable [`SourceError`])
//! failures are contained inside a fetch session: they are logged and the
//! offending item or page is skipped. Only configuration problems, identity
//! violations, fatal source failures and cache/archive I/O cross the session
//! boundary, as variants of [`FetchError`].

use std::path::PathBuf;

use thiserror::Error;

/// Inputs rejected by [`crate::identity::uuid`].
///
/// These always indicate a broken connector and are never swallowed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("cannot generate a uuid from an empty list of fields")]
    NoFields,

    #[error("cannot generate a uuid: field at position {position} is empty")]
    EmptyField { position: usize },
}

/// A raw item lacks a mandatory field or carries an unusable value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("field '{field}' not found in item")]
    MissingField { field: String },

    #[error("field '{field}' is empty")]
    EmptyField { field: String },

    #[error("field '{field}' has an unexpected type")]
    UnexpectedType { field: String },

    #[error("invalid date '{value}'")]
    InvalidDate { value: String },
}

impl ValidationError {
    pub fn missing(field: &str) -> Self {
        ValidationError::MissingField {
            field: field.to_string(),
        }
    }

    pub fn empty(field: &str) -> Self {
        ValidationError::EmptyField {
            field: field.to_string(),
        }
    }

    pub fn unexpected_type(field: &str) -> Self {
        ValidationError::UnexpectedType {
            field: field.to_string(),
        }
    }
}

/// Failures raised by a connector's page source or page parser.
#[derive(Debug, Error)]
pub enum SourceError {
    /// One file or page could not be read; the session skips it.
    #[error("cannot read {location}: {source}")]
    Unreadable {
        location: String,
        #[source]
        source: std::io::Error,
    },

    /// A page was obtained but its content cannot be parsed; the session skips it.
    #[error("malformed page: {0}")]
    MalformedPage(String),

    /// The source as a whole does not exist (e.g. the mbox directory).
    #[error("source not found: {0}")]
    NotFound(String),

    /// The remote service could not be reached or answered with an error status.
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The remote service answered with something the client cannot paginate over.
    #[error("unexpected response from {url}: {reason}")]
    Protocol { url: String, reason: String },
}

impl SourceError {
    /// Whether the session may skip the failing page/file and keep going.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SourceError::Unreadable { .. } | SourceError::MalformedPage(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no cache backup found at {0}")]
    BackupNotFound(PathBuf),
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("archive {0} not found")]
    NotFound(PathBuf),

    #[error("archive {0} already exists")]
    AlreadyExists(PathBuf),

    #[error("invalid archive metadata in {path}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ArchiveError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ArchiveError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Outcome of enriching a single raw item.
#[derive(Debug, Error)]
pub enum EnrichError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error(transparent)]
    Identity(#[from] IdentityError),
}

/// Errors that end a fetch session and reach the driver.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

pub type Result<T, E = FetchError> = std::result::Result<T, E>;
