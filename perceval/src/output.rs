//! JSON-lines sink for records: stdout by default, or a file.

use anyhow::{Context, Result};
use perceval_core::Record;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

pub struct RecordWriter {
    out: Box<dyn Write>,
    written: usize,
}

impl RecordWriter {
    pub fn stdout() -> Self {
        RecordWriter::new(Box::new(BufWriter::new(io::stdout())))
    }

    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create output file {}", path.display()))?;
        Ok(RecordWriter::new(Box::new(BufWriter::new(file))))
    }

    /// Write to `path` when given, to stdout otherwise.
    pub fn open(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => RecordWriter::create(path),
            None => Ok(RecordWriter::stdout()),
        }
    }

    pub fn new(out: Box<dyn Write>) -> Self {
        RecordWriter { out, written: 0 }
    }

    pub fn write(&mut self, record: &Record) -> Result<()> {
        serde_json::to_writer(&mut self.out, record).context("Failed to serialise record")?;
        self.out
            .write_all(b"\n")
            .context("Failed to write record")?;
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush().context("Failed to flush output")
    }
}
