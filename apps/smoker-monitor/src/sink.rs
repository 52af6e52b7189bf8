use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Append-only record log for one channel.
pub trait RecordSink {
    /// Writes one record. Records land in call order.
    fn append(&mut self, fields: &[String]) -> Result<()>;

    fn flush(&mut self) -> Result<()>;
}

/// CSV log file opened in append mode; every record is flushed before `append` returns so an
/// acknowledged message is never only in a userspace buffer.
pub struct CsvSink {
    path: PathBuf,
    writer: csv::Writer<File>,
    rows_written: u64,
}

impl CsvSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create sink directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open sink {}", path.display()))?;
        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_writer(file);
        tracing::debug!(path = %path.display(), "opened channel sink");
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            rows_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }
}

impl RecordSink for CsvSink {
    fn append(&mut self, fields: &[String]) -> Result<()> {
        self.writer
            .write_record(fields)
            .with_context(|| format!("failed to write record to {}", self.path.display()))?;
        self.writer
            .flush()
            .with_context(|| format!("failed to flush {}", self.path.display()))?;
        self.rows_written += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .with_context(|| format!("failed to flush {}", self.path.display()))
    }
}
