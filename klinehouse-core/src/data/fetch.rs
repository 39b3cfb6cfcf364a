//! Archive fetcher — cache first, then the remote source with bounded retry.
//!
//! Cache policy, per target:
//! 1. archive + completion meta for the same destination present and intact
//!    → `Fetched::CacheHit`, no network
//! 2. archive present without meta (interrupted run) → reused without network
//! 3. otherwise GET the archive, write it to the cache, then GET the sidecar
//!
//! Retry policy: transient failures (network errors, 5xx, 429) are retried up
//! to `max_retries` times, sleeping `attempt × backoff_step` between attempts.
//! 404 is final and maps to `FetchError::NotFound`. Other 4xx are not retried.

use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::cache::{ArchiveCache, CacheError, CompletionMeta};
use super::source::{ArchiveSource, SourceError};
use crate::cancel::CancellationToken;
use crate::domain::FetchTarget;

pub const DEFAULT_BASE_URL: &str = "https://data.binance.vision";
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BACKOFF_STEP: Duration = Duration::from_secs(1);

/// Linear backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_step: DEFAULT_BACKOFF_STEP,
        }
    }
}

impl RetryPolicy {
    /// Retries without sleeping.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff_step: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff_step * attempt
    }
}

/// Raw bytes of one archive and its sidecar. Lives only until extraction.
#[derive(Debug, Clone)]
pub struct DownloadedArchive {
    pub target: FetchTarget,
    pub bytes: Vec<u8>,
    pub checksum: Option<Vec<u8>>,
    pub from_cache: bool,
}

#[derive(Debug)]
pub enum Fetched {
    /// Already loaded by an earlier run; nothing to do.
    CacheHit(CompletionMeta),
    Archive(DownloadedArchive),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("archive not published: {url}")]
    NotFound { url: String },

    #[error("gave up on {url} after {attempts} attempts: {last}")]
    Exhausted {
        url: String,
        attempts: u32,
        last: SourceError,
    },

    #[error("request rejected: {0}")]
    Rejected(SourceError),

    #[error("fetch cancelled")]
    Cancelled,

    #[error(transparent)]
    Cache(#[from] CacheError),
}

pub struct ArchiveFetcher {
    source: Arc<dyn ArchiveSource>,
    cache: ArchiveCache,
    base_url: String,
    retry: RetryPolicy,
    verify_checksum: bool,
}

impl ArchiveFetcher {
    pub fn new(source: Arc<dyn ArchiveSource>, cache: ArchiveCache) -> Self {
        Self {
            source,
            cache,
            base_url: DEFAULT_BASE_URL.to_string(),
            retry: RetryPolicy::default(),
            verify_checksum: false,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_checksum(mut self, verify: bool) -> Self {
        self.verify_checksum = verify;
        self
    }

    pub fn cache(&self) -> &ArchiveCache {
        &self.cache
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn verifies_checksum(&self) -> bool {
        self.verify_checksum
    }

    /// Get `target`'s archive. `destination` is the `{location}/{table}`
    /// the rows are headed for; a completion meta only counts as a cache hit
    /// when it names the same one. `None` ignores completion metas entirely.
    pub fn fetch(
        &self,
        target: &FetchTarget,
        destination: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Fetched, FetchError> {
        if let Some(destination) = destination {
            if self.cache.is_complete(target, destination, self.verify_checksum) {
                if let Some(meta) = self.cache.get_meta(target) {
                    debug!(%target, destination, "cache hit");
                    return Ok(Fetched::CacheHit(meta));
                }
            }
        }

        if let Some(bytes) = self.cache.read_archive(target)? {
            info!(%target, "reusing cached archive from an interrupted run");
            let checksum = if self.verify_checksum {
                match self.cache.read_checksum(target)? {
                    Some(sum) => Some(sum),
                    None => self.fetch_checksum(target, cancel)?,
                }
            } else {
                None
            };
            return Ok(Fetched::Archive(DownloadedArchive {
                target: target.clone(),
                bytes,
                checksum,
                from_cache: true,
            }));
        }

        let url = target.url(&self.base_url);
        let started = Instant::now();
        let bytes = self.get_with_retry(&url, cancel)?;
        self.cache.write_archive(target, &bytes)?;
        info!(
            %target,
            bytes = bytes.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "archive downloaded"
        );

        let checksum = if self.verify_checksum {
            self.fetch_checksum(target, cancel)?
        } else {
            None
        };

        Ok(Fetched::Archive(DownloadedArchive {
            target: target.clone(),
            bytes,
            checksum,
            from_cache: false,
        }))
    }

    /// A missing sidecar is tolerated: the archive is then treated as unverified.
    fn fetch_checksum(
        &self,
        target: &FetchTarget,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<u8>>, FetchError> {
        let url = target.checksum_url(&self.base_url);
        match self.get_with_retry(&url, cancel) {
            Ok(bytes) => {
                self.cache.write_checksum(target, &bytes)?;
                Ok(Some(bytes))
            }
            Err(FetchError::NotFound { .. }) => {
                warn!(%target, "checksum sidecar not published; archive stays unverified");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn get_with_retry(&self, url: &str, cancel: &CancellationToken) -> Result<Vec<u8>, FetchError> {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            match self.source.get(url, cancel) {
                Ok(bytes) => return Ok(bytes),
                Err(SourceError::NotFound { .. }) => {
                    return Err(FetchError::NotFound {
                        url: url.to_string(),
                    })
                }
                Err(SourceError::Cancelled) => return Err(FetchError::Cancelled),
                Err(e) if e.is_transient() => {
                    if attempt >= self.retry.max_retries {
                        return Err(FetchError::Exhausted {
                            url: url.to_string(),
                            attempts: attempt + 1,
                            last: e,
                        });
                    }
                    attempt += 1;
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        url,
                        attempt,
                        max_retries = self.retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient fetch failure, retrying"
                    );
                    sleep_unless_cancelled(delay, cancel);
                }
                Err(e) => return Err(FetchError::Rejected(e)),
            }
        }
    }
}

fn sleep_unless_cancelled(delay: Duration, cancel: &CancellationToken) {
    let slice = Duration::from_millis(50);
    let deadline = Instant::now() + delay;
    while !cancel.is_cancelled() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep(slice.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::checksum::{compute_sha256, Verification};
    use crate::domain::{DataKind, MarketType, Period};
    use crate::testing::{checksum_sidecar, MapSource};
    use chrono::NaiveDate;

    const BASE: &str = "http://vision.test";
    const DEST: &str = "memory#1/spot_agg_trades";

    fn target() -> FetchTarget {
        FetchTarget::new(
            MarketType::Spot,
            DataKind::AggTrades,
            "BTCUSDT",
            None,
            Period::day(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()),
        )
    }

    fn fetcher(source: Arc<MapSource>, dir: &std::path::Path) -> ArchiveFetcher {
        ArchiveFetcher::new(source, ArchiveCache::new(dir))
            .with_base_url(BASE)
            .with_retry(RetryPolicy::immediate(DEFAULT_MAX_RETRIES))
    }

    fn archive(fetched: Fetched) -> DownloadedArchive {
        match fetched {
            Fetched::Archive(a) => a,
            Fetched::CacheHit(_) => panic!("unexpected cache hit"),
        }
    }

    #[test]
    fn linear_backoff() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_for(1), Duration::from_secs(1));
        assert_eq!(p.delay_for(3), Duration::from_secs(3));
    }

    #[test]
    fn downloads_and_caches_archive() {
        let dir = tempfile::tempdir().unwrap();
        let t = target();
        let source = Arc::new(MapSource::new().with_file(&t.url(BASE), b"payload".to_vec()));
        let f = fetcher(source.clone(), dir.path());

        let a = archive(f.fetch(&t, Some(DEST), &CancellationToken::new()).unwrap());
        assert_eq!(a.bytes, b"payload");
        assert!(!a.from_cache);
        assert!(a.checksum.is_none());
        assert!(f.cache().archive_path(&t).exists());
        assert_eq!(source.call_count(), 1);
    }

    #[test]
    fn not_found_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(MapSource::new());
        let f = fetcher(source.clone(), dir.path());
        let err = f.fetch(&target(), Some(DEST), &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, FetchError::NotFound { .. }));
        assert_eq!(source.call_count(), 1);
    }

    #[test]
    fn transient_failures_are_retried_until_success() {
        let dir = tempfile::tempdir().unwrap();
        let t = target();
        let url = t.url(BASE);
        let source = Arc::new(
            MapSource::new()
                .with_file(&url, b"payload".to_vec())
                .with_failures(
                    &url,
                    vec![
                        SourceError::Status {
                            status: 503,
                            url: url.clone(),
                        },
                        SourceError::Network("reset".into()),
                    ],
                ),
        );
        let f = fetcher(source.clone(), dir.path());
        let a = archive(f.fetch(&t, Some(DEST), &CancellationToken::new()).unwrap());
        assert_eq!(a.bytes, b"payload");
        assert_eq!(source.call_count(), 3);
    }

    #[test]
    fn retries_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let t = target();
        let url = t.url(BASE);
        let failures = (0..10)
            .map(|_| SourceError::Status {
                status: 500,
                url: url.clone(),
            })
            .collect();
        let source = Arc::new(MapSource::new().with_failures(&url, failures));
        let f = fetcher(source.clone(), dir.path());
        let err = f.fetch(&t, Some(DEST), &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, FetchError::Exhausted { attempts: 4, .. }));
        assert_eq!(source.call_count(), 1 + DEFAULT_MAX_RETRIES as usize);
        assert!(!f.cache().archive_path(&t).exists());
    }

    #[test]
    fn client_errors_are_rejected_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let t = target();
        let url = t.url(BASE);
        let source = Arc::new(MapSource::new().with_failures(
            &url,
            vec![SourceError::Status {
                status: 403,
                url: url.clone(),
            }],
        ));
        let f = fetcher(source.clone(), dir.path());
        let err = f.fetch(&t, Some(DEST), &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, FetchError::Rejected(_)));
        assert_eq!(source.call_count(), 1);
    }

    #[test]
    fn fetches_checksum_when_requested() {
        let dir = tempfile::tempdir().unwrap();
        let t = target();
        let sidecar = checksum_sidecar(b"payload", &t.file_name());
        let source = Arc::new(
            MapSource::new()
                .with_file(&t.url(BASE), b"payload".to_vec())
                .with_file(&t.checksum_url(BASE), sidecar.clone()),
        );
        let f = fetcher(source, dir.path()).with_checksum(true);
        let a = archive(f.fetch(&t, Some(DEST), &CancellationToken::new()).unwrap());
        assert_eq!(a.checksum, Some(sidecar));
        assert!(f.cache().checksum_path(&t).exists());
    }

    #[test]
    fn missing_checksum_sidecar_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let t = target();
        let source = Arc::new(MapSource::new().with_file(&t.url(BASE), b"payload".to_vec()));
        let f = fetcher(source, dir.path()).with_checksum(true);
        let a = archive(f.fetch(&t, Some(DEST), &CancellationToken::new()).unwrap());
        assert!(a.checksum.is_none());
    }

    #[test]
    fn completed_target_is_a_cache_hit_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let t = target();
        let source = Arc::new(MapSource::new());
        let f = fetcher(source.clone(), dir.path()).with_checksum(true);
        f.cache().write_archive(&t, b"payload").unwrap();
        f.cache()
            .mark_complete(
                &t,
                DEST,
                &Verification::Verified {
                    sha256: compute_sha256(b"payload"),
                },
                5,
            )
            .unwrap();

        let fetched = f.fetch(&t, Some(DEST), &CancellationToken::new()).unwrap();
        assert!(matches!(fetched, Fetched::CacheHit(ref m) if m.rows_loaded == 5));
        assert_eq!(source.call_count(), 0);
    }

    #[test]
    fn completion_for_another_destination_reuses_bytes_only() {
        let dir = tempfile::tempdir().unwrap();
        let t = target();
        let source = Arc::new(MapSource::new());
        let f = fetcher(source.clone(), dir.path());
        f.cache().write_archive(&t, b"payload").unwrap();
        let v = Verification::Skipped {
            sha256: compute_sha256(b"payload"),
        };
        f.cache().mark_complete(&t, DEST, &v, 5).unwrap();

        let other = f
            .fetch(&t, Some("memory#2/spot_agg_trades"), &CancellationToken::new())
            .unwrap();
        assert!(archive(other).from_cache);
        let fresh_table = f.fetch(&t, None, &CancellationToken::new()).unwrap();
        assert!(archive(fresh_table).from_cache);
        assert_eq!(source.call_count(), 0);
    }

    #[test]
    fn interrupted_download_is_reused_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let t = target();
        let source = Arc::new(MapSource::new());
        let f = fetcher(source.clone(), dir.path());
        f.cache().write_archive(&t, b"payload").unwrap();

        let a = archive(f.fetch(&t, Some(DEST), &CancellationToken::new()).unwrap());
        assert!(a.from_cache);
        assert_eq!(source.call_count(), 0);
    }

    #[test]
    fn cancelled_token_stops_before_network() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(MapSource::new());
        let f = fetcher(source.clone(), dir.path());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = f.fetch(&target(), Some(DEST), &cancel).unwrap_err();
        assert!(matches!(err, FetchError::Cancelled));
        assert_eq!(source.call_count(), 0);
    }
}
