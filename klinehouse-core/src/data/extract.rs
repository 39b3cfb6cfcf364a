//! Archive extraction — streams decoded rows out of a zipped CSV.
//!
//! Each call to [`ArchiveExtractor::rows`] reopens the CSV entry from the
//! start, so extracting the same bytes twice yields the same sequence.
//! Malformed lines are dropped and counted, never fatal; only a corrupt
//! archive or a failing read ends extraction with an error.

use std::io::{Cursor, Read};
use thiserror::Error;
use tracing::warn;
use zip::ZipArchive;

use crate::domain::{DataKind, DataRow, DecodeError, RowLayout};

/// Dropped lines logged individually per archive before going quiet.
const MAX_LOGGED_DROPS: u64 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("corrupt archive: {0}")]
    Archive(String),

    #[error("archive contains no CSV entry")]
    NoCsvEntry,

    #[error("read failed at line {line}: {message}")]
    Read { line: u64, message: String },
}

pub struct ArchiveExtractor<'a> {
    archive: ZipArchive<Cursor<&'a [u8]>>,
    entry: String,
    layout: RowLayout,
}

impl<'a> ArchiveExtractor<'a> {
    pub fn new(bytes: &'a [u8], kind: DataKind) -> Result<Self, ExtractError> {
        let archive = ZipArchive::new(Cursor::new(bytes))
            .map_err(|e| ExtractError::Archive(e.to_string()))?;
        let entry = archive
            .file_names()
            .find(|name| name.to_ascii_lowercase().ends_with(".csv"))
            .map(str::to_string)
            .ok_or(ExtractError::NoCsvEntry)?;
        Ok(Self {
            archive,
            entry,
            layout: kind.layout(),
        })
    }

    pub fn entry_name(&self) -> &str {
        &self.entry
    }

    pub fn layout(&self) -> RowLayout {
        self.layout
    }

    /// A fresh row stream from the first line of the CSV entry.
    pub fn rows(&mut self) -> Result<Rows<'_>, ExtractError> {
        let file = self
            .archive
            .by_name(&self.entry)
            .map_err(|e| ExtractError::Archive(e.to_string()))?;
        let reader: Box<dyn Read + '_> = Box::new(file);
        let csv = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(reader);
        Ok(Rows {
            csv,
            record: csv::StringRecord::new(),
            layout: self.layout,
            entry: self.entry.clone(),
            line: 0,
            dropped: 0,
            last_id: None,
            done: false,
        })
    }
}

/// Lazy row stream over one archive entry.
pub struct Rows<'r> {
    csv: csv::Reader<Box<dyn Read + 'r>>,
    record: csv::StringRecord,
    layout: RowLayout,
    entry: String,
    line: u64,
    dropped: u64,
    last_id: Option<i64>,
    done: bool,
}

impl Rows<'_> {
    /// Lines dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn drop_line(&mut self, reason: &dyn std::fmt::Display) {
        self.dropped += 1;
        if self.dropped <= MAX_LOGGED_DROPS {
            warn!(entry = %self.entry, line = self.line, %reason, "dropping malformed row");
        }
    }

    fn finish(&mut self) {
        self.done = true;
        if self.dropped > MAX_LOGGED_DROPS {
            warn!(
                entry = %self.entry,
                dropped = self.dropped,
                "dropped malformed rows (only the first {MAX_LOGGED_DROPS} were logged)"
            );
        }
    }

    /// Newer archives start with a column-name header.
    fn is_header(&self) -> bool {
        self.line == 1
            && self
                .record
                .get(0)
                .is_some_and(|f| f.trim().parse::<i64>().is_err() && !f.trim().is_empty())
    }
}

impl Iterator for Rows<'_> {
    type Item = Result<DataRow, ExtractError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.csv.read_record(&mut self.record) {
                Ok(false) => {
                    self.finish();
                    return None;
                }
                Ok(true) => {}
                Err(e) if e.is_io_error() => {
                    self.done = true;
                    return Some(Err(ExtractError::Read {
                        line: self.line + 1,
                        message: e.to_string(),
                    }));
                }
                Err(e) => {
                    self.line += 1;
                    self.drop_line(&e);
                    continue;
                }
            }
            self.line += 1;

            if self.record.len() == 1 && self.record.get(0).is_some_and(|f| f.trim().is_empty()) {
                continue;
            }

            match DataRow::decode(self.layout, &self.record) {
                Ok(row) => {
                    if self.layout != RowLayout::Kline {
                        let id = row.natural_id();
                        if let Some(previous) = self.last_id.filter(|prev| id < *prev) {
                            self.drop_line(&DecodeError::IdRegression {
                                previous,
                                current: id,
                            });
                            continue;
                        }
                        self.last_id = Some(id);
                    }
                    return Some(Ok(row));
                }
                Err(_) if self.is_header() => continue,
                Err(e) => self.drop_line(&e),
            }
        }
    }
}
