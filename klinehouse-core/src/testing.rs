//! Test fixtures shared by the core and runner test suites: an in-memory
//! archive source and helpers that build archives the way the upstream
//! host publishes them.

use std::collections::{HashMap, VecDeque};
use std::io::{Cursor, Write};
use std::sync::Mutex;

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::cancel::CancellationToken;
use crate::data::checksum::compute_sha256;
use crate::data::source::{ArchiveSource, SourceError};
use crate::domain::FetchTarget;

/// In-memory `ArchiveSource`. URLs without a file answer 404. Queued
/// failures for a URL are returned, in order, before its file is served.
#[derive(Default)]
pub struct MapSource {
    files: HashMap<String, Vec<u8>>,
    failures: Mutex<HashMap<String, VecDeque<SourceError>>>,
    calls: Mutex<Vec<String>>,
}

impl MapSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, url: &str, bytes: Vec<u8>) -> Self {
        self.files.insert(url.to_string(), bytes);
        self
    }

    pub fn with_failures(self, url: &str, failures: Vec<SourceError>) -> Self {
        if let Ok(mut map) = self.failures.lock() {
            map.entry(url.to_string()).or_default().extend(failures);
        }
        self
    }

    /// Publish `lines` as the archive for `target`, plus its checksum sidecar
    /// when `with_checksum` is set.
    pub fn with_archive(
        self,
        base_url: &str,
        target: &FetchTarget,
        lines: &[&str],
        with_checksum: bool,
    ) -> Self {
        let bytes = zip_csv(&format!("{}.csv", target.file_stem()), lines);
        let source = if with_checksum {
            let sidecar = checksum_sidecar(&bytes, &target.file_name());
            self.with_file(&target.checksum_url(base_url), sidecar)
        } else {
            self
        };
        source.with_file(&target.url(base_url), bytes)
    }

    /// Every URL requested so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }
}

impl ArchiveSource for MapSource {
    fn name(&self) -> &str {
        "memory"
    }

    fn get(&self, url: &str, cancel: &CancellationToken) -> Result<Vec<u8>, SourceError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(url.to_string());
        }
        if cancel.is_cancelled() {
            return Err(SourceError::Cancelled);
        }
        let queued = self
            .failures
            .lock()
            .ok()
            .and_then(|mut map| map.get_mut(url).and_then(|q| q.pop_front()));
        if let Some(err) = queued {
            return Err(err);
        }
        self.files
            .get(url)
            .cloned()
            .ok_or_else(|| SourceError::NotFound {
                url: url.to_string(),
            })
    }
}

/// A deflated zip holding one CSV entry with the given lines.
pub fn zip_csv(entry_name: &str, lines: &[&str]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    writer
        .start_file(entry_name, options)
        .expect("start zip entry");
    for line in lines {
        writer.write_all(line.as_bytes()).expect("write zip entry");
        writer.write_all(b"\n").expect("write zip entry");
    }
    writer.finish().expect("finish zip").into_inner()
}

/// Sidecar contents in the upstream `<sha256>  <file>` format.
pub fn checksum_sidecar(bytes: &[u8], file_name: &str) -> Vec<u8> {
    format!("{}  {}\n", compute_sha256(bytes), file_name).into_bytes()
}

/// A valid one-minute kline line opening at `open_time`.
pub fn kline_line(open_time: i64) -> String {
    format!(
        "{open_time},6407.10,6422.82,6407.10,6417.24,427.762,{},2744209.05214,1082,249.357,1599628.66410,0",
        open_time + 59_999
    )
}
