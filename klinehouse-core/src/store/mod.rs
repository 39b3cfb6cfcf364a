//! Destination stores and the schema/loading layer on top of them.
//!
//! The `Destination` trait is the only capability the pipeline needs from a
//! store: introspect a table, create one, insert a batch. Implementations must
//! make `insert_batch` all-or-nothing and insert-or-ignore on the table's
//! natural key, so reloading an archive never duplicates rows.

pub mod clickhouse;
pub mod loader;
pub mod memory;
pub mod parquet;
pub mod schema;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::domain::{DataRow, Interval};

pub use clickhouse::{ClickHouseConfig, ClickHouseStore};
pub use loader::{BatchLoader, LoadError, LoadResult, DEFAULT_BATCH_SIZE};
pub use memory::MemoryStore;
pub use parquet::ParquetStore;
pub use schema::{table_schema, SchemaError, SchemaManager, TableSchema};

/// Logical column types, mapped by each store onto its own type system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    String,
    UInt64,
    TimestampMs,
    Decimal,
    Bool,
    NullableBool,
    /// A store type with no logical counterpart; never compatible.
    Other(String),
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::String => f.write_str("string"),
            ColumnType::UInt64 => f.write_str("uint64"),
            ColumnType::TimestampMs => f.write_str("timestamp_ms"),
            ColumnType::Decimal => f.write_str("decimal"),
            ColumnType::Bool => f.write_str("bool"),
            ColumnType::NullableBool => f.write_str("nullable_bool"),
            ColumnType::Other(s) => write!(f, "other({s})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub ty: ColumnType,
}

impl ColumnDef {
    pub fn new(name: &str, ty: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            ty,
        }
    }
}

/// Rows of one archive destined for one table, at most `batch_size` long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBatch {
    pub table: String,
    pub symbol: String,
    pub interval: Option<Interval>,
    pub rows: Vec<DataRow>,
}

/// Natural key of a stored row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowKey {
    pub symbol: String,
    pub interval: Option<Interval>,
    pub id: i64,
}

impl RowKey {
    pub fn of(batch: &LoadBatch, row: &DataRow) -> Self {
        Self {
            symbol: batch.symbol.clone(),
            interval: batch.interval,
            id: row.natural_id(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("table '{0}' does not exist")]
    NoSuchTable(String),

    #[error("batch does not fit table '{table}': {message}")]
    Layout { table: String, message: String },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("parquet error: {0}")]
    Parquet(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("server rejected request ({status}): {message}")]
    Server { status: u16, message: String },
}

/// Where committed rows end up.
pub trait Destination: Send + Sync {
    /// Human-readable name of this store.
    fn name(&self) -> &str;

    /// Identity of the storage behind this store, stable across runs that
    /// point at the same place (server and database, root directory, or
    /// in-process instance). Completion metas are keyed on it.
    fn location(&self) -> String;

    /// Columns of an existing table, or `None` if it does not exist.
    fn describe_table(&self, table: &str) -> Result<Option<Vec<ColumnDef>>, StoreError>;

    /// Create the table. Called only after `describe_table` returned `None`.
    fn create_table(&self, schema: &TableSchema) -> Result<(), StoreError>;

    /// Commit one batch atomically; rows whose natural key already exists
    /// are ignored. Returns the number of rows the store accepted: stores
    /// that deduplicate on insert report only new rows, stores that
    /// deduplicate in the background (ClickHouse) report every row sent.
    fn insert_batch(&self, batch: &LoadBatch) -> Result<u64, StoreError>;

    fn count_rows(&self, table: &str) -> Result<u64, StoreError>;
}
