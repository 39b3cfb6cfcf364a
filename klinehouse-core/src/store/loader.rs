//! Batch loader — chunks a row stream into bounded batches and commits each
//! one with a single insert.
//!
//! A failed commit leaves earlier batches committed; the error reports how
//! many rows made it so a rerun can pick up from there (reruns are safe
//! because stores insert-or-ignore on the natural key).

use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use super::schema::TableSchema;
use super::{Destination, LoadBatch, StoreError};
use crate::data::extract::ExtractError;
use crate::domain::{DataRow, Interval, RowLayout};

pub const DEFAULT_BATCH_SIZE: usize = 5000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadResult {
    /// Rows handed to the store (or, in a dry run, that would have been).
    pub rows_loaded: u64,
    /// Rows the store reported as accepted: new rows for stores that dedup
    /// on insert, rows sent for ClickHouse.
    pub rows_inserted: u64,
    pub batches: u64,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("batch {batch} into '{table}' failed after {committed} committed rows: {source}")]
    Commit {
        table: String,
        batch: u64,
        committed: u64,
        #[source]
        source: StoreError,
    },

    #[error("extraction failed after {committed} committed rows: {source}")]
    Extract {
        committed: u64,
        #[source]
        source: ExtractError,
    },

    #[error("table '{table}' holds {expected:?} rows, got a {found:?} row after {committed} committed rows")]
    LayoutMismatch {
        table: String,
        expected: RowLayout,
        found: RowLayout,
        committed: u64,
    },
}

impl LoadError {
    /// Rows committed before the failure.
    pub fn committed(&self) -> u64 {
        match self {
            LoadError::Commit { committed, .. }
            | LoadError::Extract { committed, .. }
            | LoadError::LayoutMismatch { committed, .. } => *committed,
        }
    }
}

pub struct BatchLoader {
    destination: Arc<dyn Destination>,
    batch_size: usize,
    dry_run: bool,
}

impl BatchLoader {
    pub fn new(destination: Arc<dyn Destination>, batch_size: usize, dry_run: bool) -> Self {
        Self {
            destination,
            batch_size: batch_size.max(1),
            dry_run,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Stream `rows` into `schema`'s table for one symbol (and interval).
    pub fn load<I>(
        &self,
        schema: &TableSchema,
        symbol: &str,
        interval: Option<Interval>,
        rows: I,
    ) -> Result<LoadResult, LoadError>
    where
        I: IntoIterator<Item = Result<DataRow, ExtractError>>,
    {
        let mut result = LoadResult::default();
        let mut buffer: Vec<DataRow> = Vec::with_capacity(self.batch_size);

        for row in rows {
            let row = row.map_err(|source| LoadError::Extract {
                committed: result.rows_loaded,
                source,
            })?;
            if row.layout() != schema.layout {
                return Err(LoadError::LayoutMismatch {
                    table: schema.name.clone(),
                    expected: schema.layout,
                    found: row.layout(),
                    committed: result.rows_loaded,
                });
            }
            buffer.push(row);
            if buffer.len() >= self.batch_size {
                self.commit(schema, symbol, interval, &mut buffer, &mut result)?;
            }
        }
        if !buffer.is_empty() {
            self.commit(schema, symbol, interval, &mut buffer, &mut result)?;
        }
        Ok(result)
    }

    fn commit(
        &self,
        schema: &TableSchema,
        symbol: &str,
        interval: Option<Interval>,
        buffer: &mut Vec<DataRow>,
        result: &mut LoadResult,
    ) -> Result<(), LoadError> {
        let batch = LoadBatch {
            table: schema.name.clone(),
            symbol: symbol.to_string(),
            interval,
            rows: std::mem::replace(buffer, Vec::with_capacity(self.batch_size)),
        };
        let n = batch.rows.len() as u64;
        result.batches += 1;

        if self.dry_run {
            result.rows_loaded += n;
            debug!(table = %batch.table, rows = n, batch = result.batches, "dry run: batch not committed");
            return Ok(());
        }

        let inserted = self
            .destination
            .insert_batch(&batch)
            .map_err(|source| LoadError::Commit {
                table: batch.table.clone(),
                batch: result.batches,
                committed: result.rows_loaded,
                source,
            })?;
        result.rows_loaded += n;
        result.rows_inserted += inserted;
        debug!(table = %batch.table, rows = n, inserted, batch = result.batches, "batch committed");
        Ok(())
    }
}
