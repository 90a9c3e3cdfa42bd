//! Replay cache: durable, replayable storage of raw pages for one origin.
//!
//! The cache has two explicit states. *Pending* pages live in memory after
//! [`Cache::push`]; *committed* pages live in the on-disk log after
//! [`Cache::flush`]. Pending pages are lost on a crash; committed pages are
//! not. Backends flush after every page so at most the page being parsed is
//! at risk.
//!
//! Session lifecycle as driven by the CLI:
//!
//! 1. [`Cache::backup`] (or [`Cache::clean`] to drop history) before a fetch;
//! 2. `purge` + `push`/`flush` per page during the fetch;
//! 3. [`Cache::recover`] if the fetch fails, restoring the pre-session log.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::contract::RawPage;
use crate::error::CacheError;
use crate::pagelog::{PageLog, PageReader};

const LOG_FILE: &str = "pages.log";
const BACKUP_FILE: &str = "pages.log.bak";

#[derive(Debug)]
pub struct Cache {
    dir: PathBuf,
    log: PageLog,
    backup_path: PathBuf,
    pending: Vec<RawPage>,
}

impl Cache {
    /// Open (or create) the cache stored under `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| CacheError::io(&dir, e))?;

        let log = PageLog::new(dir.join(LOG_FILE));
        log.repair().map_err(|e| CacheError::io(log.path(), e))?;

        debug!(path = %dir.display(), "Opened cache");
        Ok(Cache {
            backup_path: dir.join(BACKUP_FILE),
            dir,
            log,
            pending: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn log_path(&self) -> &Path {
        self.log.path()
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    /// Number of pushed pages not yet flushed.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Queue a page in memory. Nothing is written until [`Cache::flush`].
    pub fn push(&mut self, page: RawPage) {
        self.pending.push(page);
    }

    /// Commit every pending page to the log as one batch and clear the queue.
    ///
    /// Returns the number of pages committed. On error the pending pages are
    /// kept so the caller decides whether to retry or purge.
    pub fn flush(&mut self) -> Result<usize, CacheError> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        self.log
            .append(&self.pending)
            .map_err(|e| CacheError::io(self.log.path(), e))?;

        let committed = self.pending.len();
        self.pending.clear();
        Ok(committed)
    }

    /// Discard pending pages left over by an aborted session.
    pub fn purge(&mut self) -> usize {
        let dropped = self.pending.len();
        if dropped > 0 {
            warn!(
                path = %self.dir.display(),
                pages = dropped,
                "Purging unflushed pages from cache"
            );
        }
        self.pending.clear();
        dropped
    }

    /// Lazy sequence of committed pages in flush order.
    ///
    /// Every call re-opens the log from the start.
    pub fn retrieve(&self) -> Result<PageReader, CacheError> {
        self.log
            .reader()
            .map_err(|e| CacheError::io(self.log.path(), e))
    }

    /// Save the committed log to the backup location and start a new, empty log.
    ///
    /// With no log on disk the backup is an empty log, so a later
    /// [`Cache::recover`] restores an empty cache.
    pub fn backup(&mut self) -> Result<(), CacheError> {
        if self.log.exists() {
            self.replace_with_copy(self.log.path(), &self.backup_path)?;
            fs::remove_file(self.log.path()).map_err(|e| CacheError::io(self.log.path(), e))?;
        } else {
            self.persist_empty(&self.backup_path)?;
        }

        info!(
            path = %self.dir.display(),
            backup = %self.backup_path.display(),
            "Cache backed up"
        );
        Ok(())
    }

    /// Restore the log from the latest backup, discarding writes made since.
    ///
    /// The backup is kept, so recovering twice gives the same state.
    pub fn recover(&mut self) -> Result<(), CacheError> {
        if !self.backup_path.is_file() {
            return Err(CacheError::BackupNotFound(self.backup_path.clone()));
        }
        self.pending.clear();
        self.replace_with_copy(&self.backup_path, self.log.path())?;

        info!(
            path = %self.dir.display(),
            backup = %self.backup_path.display(),
            "Cache recovered from backup"
        );
        Ok(())
    }

    /// Erase the log, the backup and any pending pages.
    pub fn clean(&mut self) -> Result<(), CacheError> {
        self.pending.clear();
        for path in [self.log.path(), self.backup_path.as_path()] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(CacheError::io(path, e)),
            }
        }
        info!(path = %self.dir.display(), "Cache cleaned");
        Ok(())
    }

    /// Copy `from` over `to` through a temporary file in the cache directory,
    /// so `to` is never observed half-written.
    fn replace_with_copy(&self, from: &Path, to: &Path) -> Result<(), CacheError> {
        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(|e| CacheError::io(&self.dir, e))?;
        let mut source = fs::File::open(from).map_err(|e| CacheError::io(from, e))?;
        io::copy(&mut source, tmp.as_file_mut()).map_err(|e| CacheError::io(from, e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| CacheError::io(tmp.path(), e))?;
        tmp.persist(to).map_err(|e| CacheError::io(to, e.error))?;
        Ok(())
    }

    fn persist_empty(&self, to: &Path) -> Result<(), CacheError> {
        let tmp = NamedTempFile::new_in(&self.dir).map_err(|e| CacheError::io(&self.dir, e))?;
        tmp.persist(to).map_err(|e| CacheError::io(to, e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn retrieved(cache: &Cache) -> Vec<RawPage> {
        cache
            .retrieve()
            .unwrap()
            .collect::<io::Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn push_does_not_touch_disk() {
        let dir = tempdir().unwrap();
        let mut cache = Cache::open(dir.path().join("origin")).unwrap();

        cache.push(RawPage::from("page"));
        assert_eq!(cache.pending(), 1);
        assert!(!cache.log_path().exists());
        assert!(retrieved(&cache).is_empty());
    }

    #[test]
    fn purge_drops_pending_only() {
        let dir = tempdir().unwrap();
        let mut cache = Cache::open(dir.path()).unwrap();

        cache.push(RawPage::from("committed"));
        cache.flush().unwrap();
        cache.push(RawPage::from("stale"));

        assert_eq!(cache.purge(), 1);
        assert_eq!(cache.pending(), 0);
        assert_eq!(retrieved(&cache), vec![RawPage::from("committed")]);
    }

    #[test]
    fn flush_without_pending_is_a_no_op() {
        let dir = tempdir().unwrap();
        let mut cache = Cache::open(dir.path()).unwrap();
        assert_eq!(cache.flush().unwrap(), 0);
        assert!(!cache.log_path().exists());
    }

    #[test]
    fn recover_without_backup_fails() {
        let dir = tempdir().unwrap();
        let mut cache = Cache::open(dir.path()).unwrap();
        assert!(matches!(
            cache.recover(),
            Err(CacheError::BackupNotFound(_))
        ));
    }

    #[test]
    fn clean_removes_log_and_backup() {
        let dir = tempdir().unwrap();
        let mut cache = Cache::open(dir.path()).unwrap();
        cache.push(RawPage::from("one"));
        cache.flush().unwrap();
        cache.backup().unwrap();
        cache.push(RawPage::from("two"));
        cache.flush().unwrap();

        cache.clean().unwrap();

        assert!(!cache.log_path().exists());
        assert!(!cache.backup_path().exists());
        assert!(retrieved(&cache).is_empty());
        assert!(cache.clean().is_ok(), "cleaning twice is harmless");
    }
}
