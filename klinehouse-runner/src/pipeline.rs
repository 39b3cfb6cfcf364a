//! Pipeline driver — resolve, ensure schema, then fetch → verify → extract →
//! load every target, classifying each into a `PipelineOutcome`.
//!
//! Only two conditions abort a run: an invalid selection and a schema
//! conflict. Everything else is recorded per target and the run continues.
//!
//! Targets run sequentially unless `workers > 1`, in which case they are
//! spread over a bounded rayon pool. Reports always come back in resolver
//! order. A target's completion meta is written only after all its batches
//! committed, so an interrupted run redoes at most the targets in flight.
//! Metas name the store location and table that received the rows; a run
//! against another store, or into a table it just created, loads again.

use chrono::NaiveDate;
use rayon::prelude::*;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, warn};

use klinehouse_core::cancel::CancellationToken;
use klinehouse_core::data::checksum::verify;
use klinehouse_core::data::{
    resolve, ArchiveCache, ArchiveExtractor, ArchiveFetcher, ArchiveSource, FetchError, Fetched,
    ResolveError, Selection, SymbolCatalog,
};
use klinehouse_core::domain::FetchTarget;
use klinehouse_core::store::{
    BatchLoader, Destination, LoadError, SchemaError, SchemaManager, TableSchema,
    DEFAULT_BATCH_SIZE,
};

use crate::config::IngestConfig;
use crate::outcome::{FailureKind, PipelineOutcome, RunSummary, SkipReason, TargetReport};
use crate::progress::IngestProgress;

/// Run-aborting failures.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    InvalidRange(#[from] ResolveError),

    #[error(transparent)]
    SchemaConflict(SchemaError),
}

pub struct PipelineDriver {
    fetcher: ArchiveFetcher,
    destination: Arc<dyn Destination>,
    catalog: SymbolCatalog,
    batch_size: usize,
    workers: usize,
    dry_run: bool,
}

impl PipelineDriver {
    pub fn new(
        fetcher: ArchiveFetcher,
        destination: Arc<dyn Destination>,
        catalog: SymbolCatalog,
    ) -> Self {
        Self {
            fetcher,
            destination,
            catalog,
            batch_size: DEFAULT_BATCH_SIZE,
            workers: 1,
            dry_run: false,
        }
    }

    /// Wire a driver from a run config.
    pub fn from_config(
        config: &IngestConfig,
        source: Arc<dyn ArchiveSource>,
        destination: Arc<dyn Destination>,
        catalog: SymbolCatalog,
    ) -> Self {
        let fetcher = ArchiveFetcher::new(source, ArchiveCache::new(&config.output_dir))
            .with_base_url(config.base_url.clone())
            .with_retry(config.retry_policy())
            .with_checksum(config.verify_checksum);
        Self::new(fetcher, destination, catalog)
            .with_batch_size(config.batch_size)
            .with_workers(config.workers)
            .with_dry_run(config.dry_run)
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn fetcher(&self) -> &ArchiveFetcher {
        &self.fetcher
    }

    pub fn run(
        &self,
        selection: &Selection,
        today: NaiveDate,
        progress: &dyn IngestProgress,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, PipelineError> {
        let started = Instant::now();
        let targets = resolve(selection, &self.catalog, today)?;
        info!(
            market = %selection.market,
            kind = %selection.kind,
            targets = targets.len(),
            workers = self.workers,
            dry_run = self.dry_run,
            destination = self.destination.name(),
            "starting ingest"
        );

        let schemas = SchemaManager::new(self.destination.clone(), self.dry_run);
        let schema = match schemas.ensure_schema(selection.market, selection.kind) {
            Ok(schema) => Ok(schema),
            Err(e @ SchemaError::Conflict { .. }) => {
                error!(error = %e, "schema conflict, aborting run");
                return Err(PipelineError::SchemaConflict(e));
            }
            Err(e) => {
                error!(error = %e, "destination unavailable; every target will fail");
                Err(e.to_string())
            }
        };

        let completion_key = match &schema {
            Ok(schema) if !schemas.was_created(&schema.name) => {
                Some(format!("{}/{}", self.destination.location(), schema.name))
            }
            Ok(schema) => {
                info!(table = %schema.name, "new table, earlier completions do not apply");
                None
            }
            Err(_) => None,
        };

        let loader = BatchLoader::new(self.destination.clone(), self.batch_size, self.dry_run);
        let total = targets.len();
        let run_one = |index: usize, target: &FetchTarget| -> TargetReport {
            progress.on_start(target, index, total);
            let report = if cancel.is_cancelled() {
                TargetReport::skipped(target, SkipReason::Cancelled)
            } else {
                match &schema {
                    Ok(schema) => {
                        self.process(target, schema, completion_key.as_deref(), &loader, cancel)
                    }
                    Err(message) => TargetReport::failed(target, FailureKind::Load, message),
                }
            };
            progress.on_complete(&report, index, total);
            report
        };

        let pool = if self.workers > 1 {
            match rayon::ThreadPoolBuilder::new().num_threads(self.workers).build() {
                Ok(pool) => Some(pool),
                Err(e) => {
                    warn!(error = %e, "could not build worker pool, running sequentially");
                    None
                }
            }
        } else {
            None
        };

        let reports: Vec<TargetReport> = match pool {
            Some(pool) => pool.install(|| {
                targets
                    .par_iter()
                    .enumerate()
                    .map(|(i, t)| run_one(i, t))
                    .collect()
            }),
            None => targets.iter().enumerate().map(|(i, t)| run_one(i, t)).collect(),
        };

        let summary = RunSummary::from_reports(reports);
        info!(
            loaded = summary.loaded,
            skipped = summary.skipped,
            failed = summary.failed,
            rows = summary.rows_loaded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "ingest finished"
        );
        progress.on_run_complete(&summary);
        Ok(summary)
    }

    fn process(
        &self,
        target: &FetchTarget,
        schema: &TableSchema,
        completion_key: Option<&str>,
        loader: &BatchLoader,
        cancel: &CancellationToken,
    ) -> TargetReport {
        let cache = self.fetcher.cache();
        let destination = format!("{}/{}", self.destination.location(), schema.name);

        let archive = match self.fetcher.fetch(target, completion_key, cancel) {
            Ok(Fetched::CacheHit(_)) => {
                return TargetReport::skipped(target, SkipReason::CacheHit);
            }
            Ok(Fetched::Archive(archive)) => archive,
            Err(FetchError::NotFound { url }) => {
                info!(%target, %url, "archive not published, skipping");
                return TargetReport::skipped(target, SkipReason::NotFound);
            }
            Err(FetchError::Cancelled) => {
                return TargetReport::skipped(target, SkipReason::Cancelled);
            }
            Err(e) => {
                warn!(%target, error = %e, "fetch failed");
                return TargetReport::failed(target, FailureKind::Fetch, e);
            }
        };

        let verification = match verify(&archive.bytes, archive.checksum.as_deref()) {
            Ok(v) => v,
            Err(e) => {
                warn!(%target, error = %e, "integrity check failed, purging cached files");
                if let Err(purge) = cache.purge(target) {
                    warn!(%target, error = %purge, "purge failed");
                }
                return TargetReport::failed(target, FailureKind::Integrity, e);
            }
        };

        let mut extractor = match ArchiveExtractor::new(&archive.bytes, target.kind) {
            Ok(x) => x,
            Err(e) => return self.extract_failed(target, e),
        };
        let mut rows = match extractor.rows() {
            Ok(rows) => rows,
            Err(e) => return self.extract_failed(target, e),
        };

        let loaded = loader.load(schema, &target.symbol, target.interval, rows.by_ref());
        let dropped = rows.dropped();
        let outcome = match loaded {
            Ok(result) => {
                if !self.dry_run {
                    if let Err(e) =
                        cache.mark_complete(target, &destination, &verification, result.rows_loaded)
                    {
                        warn!(%target, error = %e, "rows committed but completion meta not written");
                    }
                }
                info!(%target, rows = result.rows_loaded, inserted = result.rows_inserted, dropped, "target loaded");
                PipelineOutcome::Loaded {
                    rows: result.rows_loaded,
                }
            }
            Err(LoadError::Extract { committed, source }) => {
                warn!(%target, committed, error = %source, "extraction failed mid-stream");
                PipelineOutcome::failed(FailureKind::Extract, source)
            }
            Err(e) => {
                warn!(%target, committed = e.committed(), error = %e, "load failed");
                PipelineOutcome::failed(FailureKind::Load, e)
            }
        };

        TargetReport {
            target: target.clone(),
            outcome,
            dropped_rows: dropped,
        }
    }

    /// A corrupt archive would fail the same way on every rerun, so it is
    /// dropped from the cache.
    fn extract_failed(&self, target: &FetchTarget, e: impl std::fmt::Display) -> TargetReport {
        warn!(%target, error = %e, "extraction failed, purging cached archive");
        if let Err(purge) = self.fetcher.cache().purge(target) {
            warn!(%target, error = %purge, "purge failed");
        }
        TargetReport::failed(target, FailureKind::Extract, e)
    }
}
