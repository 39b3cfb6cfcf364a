//! Run reports — the run summary persisted as JSON, named by a
//! content-addressed fingerprint of the selection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use klinehouse_core::data::Selection;

use crate::outcome::RunSummary;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("report serialization failed: {0}")]
    Serialize(String),

    #[error("cannot write report {path}: {message}")]
    Io { path: String, message: String },
}

/// BLAKE3 of the serialized selection. Equal selections share a fingerprint,
/// so reruns of the same selection overwrite the same report.
pub fn selection_fingerprint(selection: &Selection) -> Result<String, ReportError> {
    let json = serde_json::to_string(selection).map_err(|e| ReportError::Serialize(e.to_string()))?;
    Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub fingerprint: String,
    pub selection: Selection,
    pub destination: String,
    pub dry_run: bool,
    pub finished_at: DateTime<Utc>,
    pub summary: RunSummary,
}

impl RunReport {
    pub fn new(
        selection: &Selection,
        destination: &str,
        dry_run: bool,
        summary: RunSummary,
    ) -> Result<Self, ReportError> {
        Ok(Self {
            fingerprint: selection_fingerprint(selection)?,
            selection: selection.clone(),
            destination: destination.to_string(),
            dry_run,
            finished_at: Utc::now(),
            summary,
        })
    }

    pub fn file_name(&self) -> String {
        format!("run-{}.json", self.fingerprint)
    }

    /// Write `{dir}/run-{fingerprint}.json` atomically.
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf, ReportError> {
        let io_err = |path: &Path, e: std::io::Error| ReportError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        };
        fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

        let json =
            serde_json::to_vec_pretty(self).map_err(|e| ReportError::Serialize(e.to_string()))?;
        let path = dir.join(self.file_name());
        let tmp = dir.join(format!("{}.tmp", self.file_name()));
        fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            io_err(&path, e)
        })?;
        Ok(path)
    }

    pub fn read_from(path: &Path) -> Result<Self, ReportError> {
        let content = fs::read_to_string(path).map_err(|e| ReportError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        serde_json::from_str(&content).map_err(|e| ReportError::Serialize(e.to_string()))
    }
}
