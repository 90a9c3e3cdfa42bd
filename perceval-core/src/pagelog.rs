//! Append-only log of raw pages.
//!
//! Layout: a sequence of batches, one per append. A batch is a little-endian
//! `u64` payload length followed by the payload; the payload is a sequence of
//! pages, each a little-endian `u64` length followed by the page bytes.
//!
//! A batch is written with a single `write_all` followed by `sync_data`. If the
//! process dies mid-write the last batch is incomplete; readers stop before it
//! and [`PageLog::repair`] truncates it, so a batch is either fully visible or
//! not visible at all.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::contract::RawPage;

const LEN_BYTES: usize = 8;

#[derive(Debug, Clone)]
pub struct PageLog {
    path: PathBuf,
}

impl PageLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        PageLog { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Append `pages` as one batch. An empty slice writes nothing.
    pub fn append(&self, pages: &[RawPage]) -> io::Result<()> {
        if pages.is_empty() {
            return Ok(());
        }

        let payload_len: usize = pages.iter().map(|p| LEN_BYTES + p.len()).sum();
        let mut frame = Vec::with_capacity(LEN_BYTES + payload_len);
        frame.extend_from_slice(&(payload_len as u64).to_le_bytes());
        for page in pages {
            frame.extend_from_slice(&(page.len() as u64).to_le_bytes());
            frame.extend_from_slice(page.as_bytes());
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&frame)?;
        file.sync_data()?;

        debug!(
            path = %self.path.display(),
            pages = pages.len(),
            bytes = frame.len(),
            "Appended batch to page log"
        );
        Ok(())
    }

    /// Lazy reader over every committed page, from the start of the log.
    ///
    /// A missing log reads as empty.
    pub fn reader(&self) -> io::Result<PageReader> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(PageReader::empty(self.path.clone()))
            }
            Err(e) => return Err(e),
        };
        let remaining = file.metadata()?.len();

        Ok(PageReader {
            path: self.path.clone(),
            file: Some(BufReader::new(file)),
            remaining,
            batch: VecDeque::new(),
        })
    }

    /// Truncate an incomplete trailing batch. Returns the number of bytes dropped.
    pub fn repair(&self) -> io::Result<u64> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        let total = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut valid: u64 = 0;

        loop {
            let mut header = [0u8; LEN_BYTES];
            let read = read_full(&mut reader, &mut header)?;
            if read < LEN_BYTES {
                break;
            }
            let batch_len = u64::from_le_bytes(header);
            if batch_len > total - valid - LEN_BYTES as u64 {
                break;
            }
            io::copy(&mut (&mut reader).take(batch_len), &mut io::sink())?;
            valid += LEN_BYTES as u64 + batch_len;
        }

        let dropped = total - valid;
        if dropped > 0 {
            warn!(
                path = %self.path.display(),
                dropped_bytes = dropped,
                "Truncating incomplete batch at the end of the page log"
            );
            let file = OpenOptions::new().write(true).open(&self.path)?;
            file.set_len(valid)?;
            file.sync_all()?;
        }
        Ok(dropped)
    }
}

/// Iterator over the pages of a [`PageLog`], in append order.
pub struct PageReader {
    path: PathBuf,
    file: Option<BufReader<File>>,
    remaining: u64,
    batch: VecDeque<RawPage>,
}

impl PageReader {
    fn empty(path: PathBuf) -> Self {
        PageReader {
            path,
            file: None,
            remaining: 0,
            batch: VecDeque::new(),
        }
    }

    /// Load the next complete batch. Returns false at the end of the log.
    fn load_batch(&mut self) -> io::Result<bool> {
        let Some(reader) = self.file.as_mut() else {
            return Ok(false);
        };

        let mut header = [0u8; LEN_BYTES];
        let read = read_full(reader, &mut header)?;
        if read == 0 {
            self.file = None;
            return Ok(false);
        }

        let batch_len = u64::from_le_bytes(header);
        let available = self.remaining.saturating_sub(LEN_BYTES as u64);
        if read < LEN_BYTES || batch_len > available {
            warn!(
                path = %self.path.display(),
                "Ignoring incomplete batch at the end of the page log"
            );
            self.file = None;
            return Ok(false);
        }

        let mut payload = vec![0u8; batch_len as usize];
        reader.read_exact(&mut payload)?;
        self.remaining = available - batch_len;
        self.batch = split_pages(&payload).map_err(|reason| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}: {reason}", self.path.display()),
            )
        })?;
        Ok(true)
    }
}

impl Iterator for PageReader {
    type Item = io::Result<RawPage>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(page) = self.batch.pop_front() {
                return Some(Ok(page));
            }
            match self.load_batch() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(e) => {
                    self.file = None;
                    return Some(Err(e));
                }
            }
        }
    }
}

fn split_pages(mut payload: &[u8]) -> Result<VecDeque<RawPage>, &'static str> {
    let mut pages = VecDeque::new();
    while !payload.is_empty() {
        if payload.len() < LEN_BYTES {
            return Err("truncated page header");
        }
        let (header, rest) = payload.split_at(LEN_BYTES);
        let mut len_bytes = [0u8; LEN_BYTES];
        len_bytes.copy_from_slice(header);
        let len = u64::from_le_bytes(len_bytes) as usize;
        if len > rest.len() {
            return Err("page length exceeds batch");
        }
        let (page, rest) = rest.split_at(len);
        pages.push_back(RawPage::new(page.to_vec()));
        payload = rest;
    }
    Ok(pages)
}

/// Read until `buf` is full or EOF. Returns the number of bytes read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn pages(log: &PageLog) -> Vec<RawPage> {
        log.reader()
            .unwrap()
            .collect::<io::Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn missing_log_reads_empty() {
        let dir = tempdir().unwrap();
        let log = PageLog::new(dir.path().join("pages.log"));
        assert!(pages(&log).is_empty());
        assert_eq!(log.repair().unwrap(), 0);
    }

    #[test]
    fn batches_read_back_in_append_order() {
        let dir = tempdir().unwrap();
        let log = PageLog::new(dir.path().join("pages.log"));

        log.append(&[RawPage::from("a"), RawPage::from("")]).unwrap();
        log.append(&[]).unwrap();
        log.append(&[RawPage::from("ccc")]).unwrap();

        assert_eq!(
            pages(&log),
            vec![RawPage::from("a"), RawPage::from(""), RawPage::from("ccc")]
        );
    }

    #[test]
    fn torn_tail_is_invisible_and_repaired() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pages.log");
        let log = PageLog::new(&path);
        log.append(&[RawPage::from("kept-1"), RawPage::from("kept-2")])
            .unwrap();
        let good_len = std::fs::metadata(&path).unwrap().len();

        // Simulate a crash halfway through writing a second batch.
        let mut frame = Vec::new();
        frame.extend_from_slice(&100u64.to_le_bytes());
        frame.extend_from_slice(b"partial");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&frame).unwrap();

        assert_eq!(
            pages(&log),
            vec![RawPage::from("kept-1"), RawPage::from("kept-2")]
        );

        assert_eq!(log.repair().unwrap(), frame.len() as u64);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);

        log.append(&[RawPage::from("after-crash")]).unwrap();
        assert_eq!(
            pages(&log),
            vec![
                RawPage::from("kept-1"),
                RawPage::from("kept-2"),
                RawPage::from("after-crash")
            ]
        );
    }
}
