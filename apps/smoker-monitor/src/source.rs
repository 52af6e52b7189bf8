use crate::channel::ChannelId;
use crate::reading::encode_fields;
use anyhow::{Context, Result};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// One row of the sample file: `time, smoker, food_a, food_b`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    pub fields: Vec<String>,
}

impl SourceRecord {
    pub fn new(fields: Vec<String>) -> Self {
        Self { fields }
    }

    pub fn timestamp(&self) -> &str {
        self.field(0)
    }

    pub fn field(&self, idx: usize) -> &str {
        self.fields.get(idx).map(String::as_str).unwrap_or("")
    }

    /// Wire body for one channel: the timestamp plus that channel's column.
    pub fn channel_message(&self, channel: ChannelId) -> String {
        encode_fields(&[self.timestamp(), self.field(channel.source_column())])
    }
}

/// Every row is a record, including a leading header row; short rows are allowed.
pub struct CsvSource<R> {
    reader: csv::Reader<R>,
}

impl CsvSource<File> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open source file {}", path.display()))?;
        Ok(Self::from_reader(file))
    }
}

impl<R: Read> CsvSource<R> {
    pub fn from_reader(reader: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(reader);
        Self { reader }
    }
}

impl<R: Read> Iterator for CsvSource<R> {
    type Item = Result<SourceRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut record = csv::StringRecord::new();
        match self.reader.read_record(&mut record) {
            Ok(true) => Some(Ok(SourceRecord::new(
                record.iter().map(str::to_string).collect(),
            ))),
            Ok(false) => None,
            Err(err) => Some(Err(err).context("failed to read source row")),
        }
    }
}
