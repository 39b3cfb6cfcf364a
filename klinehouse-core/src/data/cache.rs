//! Local archive cache mirroring the remote layout.
//!
//! Layout: `{root}/data/{market}/{monthly|daily}/{kind}/{SYMBOL}[/{INTERVAL}]/{file}.zip`
//!
//! Next to each archive:
//! - `{file}.zip.CHECKSUM` — the published checksum sidecar, when fetched
//! - `{file}.zip.meta.json` — completion marker, written only after the
//!   archive's rows were committed; names the store and table that hold them
//!
//! Every write goes to `{path}.tmp` first and is renamed into place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use super::checksum::{compute_sha256, Verification};
use crate::domain::FetchTarget;

#[derive(Debug, Error)]
#[error("cache error at {}: {message}", path.display())]
pub struct CacheError {
    pub path: PathBuf,
    pub message: String,
}

impl CacheError {
    fn new(path: &Path, message: impl std::fmt::Display) -> Self {
        Self {
            path: path.to_path_buf(),
            message: message.to_string(),
        }
    }
}

/// Completion sidecar for a loaded archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionMeta {
    pub target: FetchTarget,
    /// `{store location}/{table}` the rows were committed to.
    #[serde(default)]
    pub destination: String,
    pub sha256: String,
    pub checksum_verified: bool,
    pub rows_loaded: u64,
    pub completed_at: DateTime<Utc>,
}

/// Summary of what is on disk under the cache root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatus {
    pub archives: usize,
    pub checksums: usize,
    pub completed: usize,
    pub verified: usize,
    pub archive_bytes: u64,
}

pub struct ArchiveCache {
    root: PathBuf,
}

impl ArchiveCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn archive_path(&self, target: &FetchTarget) -> PathBuf {
        self.root.join(target.remote_dir()).join(target.file_name())
    }

    pub fn checksum_path(&self, target: &FetchTarget) -> PathBuf {
        sibling(&self.archive_path(target), ".CHECKSUM")
    }

    pub fn meta_path(&self, target: &FetchTarget) -> PathBuf {
        sibling(&self.archive_path(target), ".meta.json")
    }

    pub fn read_archive(&self, target: &FetchTarget) -> Result<Option<Vec<u8>>, CacheError> {
        read_optional(&self.archive_path(target))
    }

    pub fn read_checksum(&self, target: &FetchTarget) -> Result<Option<Vec<u8>>, CacheError> {
        read_optional(&self.checksum_path(target))
    }

    pub fn write_archive(&self, target: &FetchTarget, bytes: &[u8]) -> Result<PathBuf, CacheError> {
        let path = self.archive_path(target);
        write_atomic(&path, bytes)?;
        debug!(path = %path.display(), bytes = bytes.len(), "archive cached");
        Ok(path)
    }

    pub fn write_checksum(&self, target: &FetchTarget, bytes: &[u8]) -> Result<PathBuf, CacheError> {
        let path = self.checksum_path(target);
        write_atomic(&path, bytes)?;
        Ok(path)
    }

    /// The completion sidecar, if present and readable.
    pub fn get_meta(&self, target: &FetchTarget) -> Option<CompletionMeta> {
        let path = self.meta_path(target);
        let content = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&content) {
            Ok(meta) => Some(meta),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable completion meta");
                None
            }
        }
    }

    /// Record that the archive's rows are committed.
    pub fn mark_complete(
        &self,
        target: &FetchTarget,
        destination: &str,
        verification: &Verification,
        rows_loaded: u64,
    ) -> Result<(), CacheError> {
        let meta = CompletionMeta {
            target: target.clone(),
            destination: destination.to_string(),
            sha256: verification.sha256().to_string(),
            checksum_verified: verification.is_verified(),
            rows_loaded,
            completed_at: Utc::now(),
        };
        let path = self.meta_path(target);
        let json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| CacheError::new(&path, format!("meta serialization: {e}")))?;
        write_atomic(&path, &json)
    }

    /// True when the archive was loaded into `destination` before and is
    /// still intact: the archive and its meta exist, the meta names the same
    /// destination, the archive hashes to the recorded digest, and (if
    /// `require_verified`) the meta records a verified checksum.
    pub fn is_complete(
        &self,
        target: &FetchTarget,
        destination: &str,
        require_verified: bool,
    ) -> bool {
        let Some(meta) = self.get_meta(target) else {
            return false;
        };
        if meta.destination != destination {
            return false;
        }
        if require_verified && !meta.checksum_verified {
            return false;
        }
        match self.read_archive(target) {
            Ok(Some(bytes)) => compute_sha256(&bytes) == meta.sha256,
            _ => false,
        }
    }

    /// Remove the archive, its checksum and its meta. Missing files are fine.
    pub fn purge(&self, target: &FetchTarget) -> Result<(), CacheError> {
        for path in [
            self.archive_path(target),
            self.checksum_path(target),
            self.meta_path(target),
        ] {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "purged"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(CacheError::new(&path, format!("remove failed: {e}"))),
            }
        }
        Ok(())
    }

    /// Walk the cache and count what is there.
    pub fn status(&self) -> Result<CacheStatus, CacheError> {
        let mut status = CacheStatus::default();
        let data_dir = self.root.join("data");
        if data_dir.exists() {
            walk(&data_dir, &mut status)?;
        }
        Ok(status)
    }
}

fn walk(dir: &Path, status: &mut CacheStatus) -> Result<(), CacheError> {
    let entries = fs::read_dir(dir).map_err(|e| CacheError::new(dir, format!("read dir: {e}")))?;
    for entry in entries {
        let entry = entry.map_err(|e| CacheError::new(dir, format!("dir entry: {e}")))?;
        let path = entry.path();
        if path.is_dir() {
            walk(&path, status)?;
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".zip") {
            status.archives += 1;
            status.archive_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        } else if name.ends_with(".zip.CHECKSUM") {
            status.checksums += 1;
        } else if name.ends_with(".zip.meta.json") {
            status.completed += 1;
            let verified = fs::read_to_string(&path)
                .ok()
                .and_then(|s| serde_json::from_str::<CompletionMeta>(&s).ok())
                .is_some_and(|m| m.checksum_verified);
            if verified {
                status.verified += 1;
            }
        }
    }
    Ok(())
}

/// `foo.zip` + `.CHECKSUM` → `foo.zip.CHECKSUM`
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, CacheError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CacheError::new(path, format!("read failed: {e}"))),
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| CacheError::new(parent, format!("failed to create dir: {e}")))?;
    }
    let tmp = sibling(path, ".tmp");
    fs::write(&tmp, bytes).map_err(|e| CacheError::new(&tmp, format!("write failed: {e}")))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        CacheError::new(path, format!("atomic rename failed: {e}"))
    })
}
