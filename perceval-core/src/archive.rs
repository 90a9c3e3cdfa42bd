//! Archives: persisted raw pages of whole fetch sessions, for offline replay.
//!
//! An archive is a directory with a `metadata.json` describing the session
//! (origin, backend, parameters, creation time) and a `pages.log` holding
//! every raw page the session obtained. [`ArchiveManager`] keeps many archives
//! under one root and finds the ones matching a backend and a date.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::contract::RawPage;
use crate::error::ArchiveError;
use crate::pagelog::{PageLog, PageReader};

const METADATA_FILE: &str = "metadata.json";
const PAGES_FILE: &str = "pages.log";

/// Description of the session stored in an archive.
///
/// The backend fields stay empty until [`Archive::init_metadata`] is called.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    pub created_on: DateTime<Utc>,
    pub origin: Option<String>,
    pub backend_name: Option<String>,
    pub backend_version: Option<String>,
    #[serde(default)]
    pub backend_params: serde_json::Value,
}

impl ArchiveMetadata {
    pub fn is_initialized(&self) -> bool {
        self.origin.is_some() && self.backend_name.is_some()
    }
}

#[derive(Debug)]
pub struct Archive {
    dir: PathBuf,
    log: PageLog,
    metadata: ArchiveMetadata,
}

impl Archive {
    /// Create a new, empty archive in `dir`, which must not hold one already.
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self, ArchiveError> {
        let dir = dir.into();
        if dir.join(METADATA_FILE).exists() {
            return Err(ArchiveError::AlreadyExists(dir));
        }
        fs::create_dir_all(&dir).map_err(|e| ArchiveError::io(&dir, e))?;

        let archive = Archive {
            log: PageLog::new(dir.join(PAGES_FILE)),
            metadata: ArchiveMetadata {
                created_on: Utc::now(),
                origin: None,
                backend_name: None,
                backend_version: None,
                backend_params: serde_json::Value::Null,
            },
            dir,
        };
        archive.write_metadata()?;

        debug!(path = %archive.dir.display(), "Created archive");
        Ok(archive)
    }

    /// Open an existing archive.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, ArchiveError> {
        let dir = dir.into();
        let metadata_path = dir.join(METADATA_FILE);
        let raw = match fs::read(&metadata_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ArchiveError::NotFound(dir))
            }
            Err(e) => return Err(ArchiveError::io(&metadata_path, e)),
        };
        let metadata: ArchiveMetadata =
            serde_json::from_slice(&raw).map_err(|source| ArchiveError::Metadata {
                path: metadata_path,
                source,
            })?;

        let log = PageLog::new(dir.join(PAGES_FILE));
        log.repair().map_err(|e| ArchiveError::io(log.path(), e))?;

        Ok(Archive { dir, log, metadata })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn metadata(&self) -> &ArchiveMetadata {
        &self.metadata
    }

    /// Record which backend session the archive holds.
    pub fn init_metadata(
        &mut self,
        origin: &str,
        backend_name: &str,
        backend_version: &str,
        backend_params: serde_json::Value,
    ) -> Result<(), ArchiveError> {
        self.metadata.origin = Some(origin.to_string());
        self.metadata.backend_name = Some(backend_name.to_string());
        self.metadata.backend_version = Some(backend_version.to_string());
        self.metadata.backend_params = backend_params;
        self.write_metadata()
    }

    /// Append one raw page; durable when this returns.
    pub fn store(&mut self, page: &RawPage) -> Result<(), ArchiveError> {
        self.log
            .append(std::slice::from_ref(page))
            .map_err(|e| ArchiveError::io(self.log.path(), e))
    }

    /// Lazy sequence of the archived pages in storage order.
    pub fn retrieve(&self) -> Result<PageReader, ArchiveError> {
        self.log
            .reader()
            .map_err(|e| ArchiveError::io(self.log.path(), e))
    }

    fn write_metadata(&self) -> Result<(), ArchiveError> {
        let path = self.dir.join(METADATA_FILE);
        let body = serde_json::to_vec_pretty(&self.metadata).map_err(|source| {
            ArchiveError::Metadata {
                path: path.clone(),
                source,
            }
        })?;

        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(|e| ArchiveError::io(&self.dir, e))?;
        io::Write::write_all(&mut tmp, &body).map_err(|e| ArchiveError::io(tmp.path(), e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| ArchiveError::io(tmp.path(), e))?;
        tmp.persist(&path)
            .map_err(|e| ArchiveError::io(&path, e.error))?;
        Ok(())
    }
}

/// Keeps archives under a root directory, two levels deep (`ab/cdef…`).
#[derive(Debug, Clone)]
pub struct ArchiveManager {
    dirpath: PathBuf,
}

impl ArchiveManager {
    pub fn new(dirpath: impl Into<PathBuf>) -> Result<Self, ArchiveError> {
        let dirpath = dirpath.into();
        fs::create_dir_all(&dirpath).map_err(|e| ArchiveError::io(&dirpath, e))?;
        Ok(ArchiveManager { dirpath })
    }

    pub fn dirpath(&self) -> &Path {
        &self.dirpath
    }

    /// Create an archive at a fresh, unique location.
    pub fn create_archive(&self) -> Result<Archive, ArchiveError> {
        let name = Uuid::new_v4().simple().to_string();
        let (prefix, rest) = name.split_at(2);
        let archive = Archive::create(self.dirpath.join(prefix).join(rest))?;
        info!(path = %archive.path().display(), "New archive created");
        Ok(archive)
    }

    pub fn load_archive(&self, path: &Path) -> Result<Archive, ArchiveError> {
        Archive::open(path)
    }

    pub fn delete_archive(&self, archive: Archive) -> Result<(), ArchiveError> {
        let dir = archive.path().to_path_buf();
        fs::remove_dir_all(&dir).map_err(|e| ArchiveError::io(&dir, e))?;
        if let Some(parent) = dir.parent() {
            // Leave the prefix directory in place when other archives share it.
            let _ = fs::remove_dir(parent);
        }
        info!(path = %dir.display(), "Archive deleted");
        Ok(())
    }

    /// Delete every archive under the root. Returns how many were removed.
    pub fn delete_archives(&self) -> Result<usize, ArchiveError> {
        let stored = self.stored_archives()?;
        for path in &stored {
            fs::remove_dir_all(path).map_err(|e| ArchiveError::io(path, e))?;
            if let Some(parent) = path.parent() {
                let _ = fs::remove_dir(parent);
            }
        }
        info!(dirpath = %self.dirpath.display(), removed = stored.len(), "Archives deleted");
        Ok(stored.len())
    }

    /// Paths of every archive under the root, sorted by path.
    pub fn stored_archives(&self) -> Result<Vec<PathBuf>, ArchiveError> {
        let mut archives = Vec::new();
        for entry in WalkDir::new(&self.dirpath).min_depth(3).max_depth(3) {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(&self.dirpath).to_path_buf();
                ArchiveError::io(path, io::Error::new(io::ErrorKind::Other, e.to_string()))
            })?;
            if entry.file_type().is_file() && entry.file_name() == METADATA_FILE {
                if let Some(dir) = entry.path().parent() {
                    archives.push(dir.to_path_buf());
                }
            }
        }
        archives.sort();
        Ok(archives)
    }

    /// Archives of `origin`/`backend_name` created at or after `from_date`,
    /// oldest first. Unreadable archives are skipped with a warning.
    pub fn collect_archives(
        &self,
        origin: &str,
        backend_name: &str,
        from_date: DateTime<Utc>,
    ) -> Result<Vec<PathBuf>, ArchiveError> {
        let mut found: Vec<(DateTime<Utc>, PathBuf)> = Vec::new();
        for path in self.stored_archives()? {
            let archive = match Archive::open(&path) {
                Ok(archive) => archive,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring unreadable archive");
                    continue;
                }
            };
            let metadata = archive.metadata();
            if metadata.origin.as_deref() == Some(origin)
                && metadata.backend_name.as_deref() == Some(backend_name)
                && metadata.created_on >= from_date
            {
                found.push((metadata.created_on, path));
            }
        }
        found.sort();
        Ok(found.into_iter().map(|(_, path)| path).collect())
    }
}
