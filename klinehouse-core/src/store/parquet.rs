//! Local columnar destination backed by Parquet files (polars).
//!
//! Layout: `{root}/{table}/_schema.json` plus Hive-style partitions
//! `{root}/{table}/symbol={SYMBOL}/[interval={INTERVAL}/]month={YYYY-MM}/part-{NNNNN}.parquet`,
//! one month partition per calendar month (UTC) of row time and one part
//! file per committed batch.
//!
//! - Partition columns (`symbol`, `interval`) live in the path, not the file
//! - Decimals are stored as strings so scale survives the round trip
//! - Inserts skip rows whose natural id is already in the month partition;
//!   the ids of a partition are read from disk once and then kept in memory
//! - Every new part is written to `.tmp` first; renames happen only after all
//!   of them were written, and a failed rename removes the parts already
//!   renamed

use polars::prelude::*;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use super::schema::TableSchema;
use super::{ColumnDef, Destination, LoadBatch, StoreError};
use crate::domain::{DataRow, RowLayout};

const SCHEMA_FILE: &str = "_schema.json";

/// Natural ids per month partition directory. Held for the whole insert, so
/// it also serializes writers.
type KnownIds = HashMap<PathBuf, HashSet<i64>>;

pub struct ParquetStore {
    root: PathBuf,
    known_ids: Mutex<KnownIds>,
}

/// A part written to `tmp`, waiting to be renamed to `path`.
struct StagedPart {
    tmp: PathBuf,
    path: PathBuf,
    partition: PathBuf,
    ids: HashSet<i64>,
}

impl ParquetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            known_ids: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn table_dir(&self, table: &str) -> PathBuf {
        self.root.join(table)
    }

    fn partition_dir(&self, batch: &LoadBatch) -> PathBuf {
        let mut dir = self
            .table_dir(&batch.table)
            .join(format!("symbol={}", batch.symbol));
        if let Some(interval) = batch.interval {
            dir = dir.join(format!("interval={interval}"));
        }
        dir
    }

    fn read_schema(&self, table: &str) -> Result<Option<TableSchema>, StoreError> {
        let path = self.table_dir(table).join(SCHEMA_FILE);
        match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)
                .map(Some)
                .map_err(|e| StoreError::Io(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(format!("{}: {e}", path.display()))),
        }
    }

    /// Write one part per touched month partition, holding only rows whose
    /// id is new to that partition.
    fn stage(
        &self,
        known: &mut KnownIds,
        layout: RowLayout,
        batch: &LoadBatch,
        staged: &mut Vec<StagedPart>,
    ) -> Result<(), StoreError> {
        let mut by_month: BTreeMap<String, Vec<&DataRow>> = BTreeMap::new();
        for row in &batch.rows {
            by_month.entry(month_key(row.time_ms())).or_default().push(row);
        }

        let base = self.partition_dir(batch);
        for (month, rows) in &by_month {
            let partition = base.join(format!("month={month}"));
            if !known.contains_key(&partition) {
                let ids = partition_ids(&partition, layout)?;
                known.insert(partition.clone(), ids);
            }
            let stored = &known[&partition];

            let mut ids = HashSet::new();
            let fresh: Vec<&DataRow> = rows
                .iter()
                .copied()
                .filter(|r| {
                    let id = r.natural_id();
                    !stored.contains(&id) && ids.insert(id)
                })
                .collect();
            if fresh.is_empty() {
                continue;
            }

            fs::create_dir_all(&partition)
                .map_err(|e| StoreError::Io(format!("create dir: {e}")))?;
            let path = next_part_path(&partition, staged)?;
            let tmp = path.with_extension("parquet.tmp");
            let mut df = rows_to_dataframe(layout, &fresh)?;
            write_parquet(&mut df, &tmp)?;
            staged.push(StagedPart {
                tmp,
                path,
                partition,
                ids,
            });
        }
        Ok(())
    }
}

impl Destination for ParquetStore {
    fn name(&self) -> &str {
        "parquet"
    }

    fn location(&self) -> String {
        let root = if self.root.is_absolute() {
            self.root.clone()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(&self.root))
                .unwrap_or_else(|_| self.root.clone())
        };
        format!("parquet:{}", root.display())
    }

    fn describe_table(&self, table: &str) -> Result<Option<Vec<ColumnDef>>, StoreError> {
        Ok(self.read_schema(table)?.map(|s| s.columns))
    }

    fn create_table(&self, schema: &TableSchema) -> Result<(), StoreError> {
        let dir = self.table_dir(&schema.name);
        fs::create_dir_all(&dir).map_err(|e| StoreError::Io(format!("create dir: {e}")))?;
        let json = serde_json::to_vec_pretty(schema)
            .map_err(|e| StoreError::Io(format!("schema serialization: {e}")))?;
        let path = dir.join(SCHEMA_FILE);
        let tmp = dir.join(format!("{SCHEMA_FILE}.tmp"));
        fs::write(&tmp, json).map_err(|e| StoreError::Io(format!("write schema: {e}")))?;
        fs::rename(&tmp, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            StoreError::Io(format!("atomic rename failed: {e}"))
        })
    }

    fn insert_batch(&self, batch: &LoadBatch) -> Result<u64, StoreError> {
        let mut known = self.known_ids.lock().unwrap_or_else(|p| p.into_inner());

        let schema = self
            .read_schema(&batch.table)?
            .ok_or_else(|| StoreError::NoSuchTable(batch.table.clone()))?;
        if let Some(bad) = batch.rows.iter().find(|r| r.layout() != schema.layout) {
            return Err(StoreError::Layout {
                table: batch.table.clone(),
                message: format!("{:?} row in a {:?} table", bad.layout(), schema.layout),
            });
        }

        let mut staged: Vec<StagedPart> = Vec::new();
        if let Err(e) = self.stage(&mut known, schema.layout, batch, &mut staged) {
            for part in &staged {
                let _ = fs::remove_file(&part.tmp);
            }
            return Err(e);
        }

        for (i, part) in staged.iter().enumerate() {
            if let Err(e) = fs::rename(&part.tmp, &part.path) {
                for done in &staged[..i] {
                    let _ = fs::remove_file(&done.path);
                }
                for pending in &staged[i..] {
                    let _ = fs::remove_file(&pending.tmp);
                }
                return Err(StoreError::Io(format!("atomic rename failed: {e}")));
            }
        }

        let parts = staged.len();
        let mut inserted = 0u64;
        for part in staged {
            inserted += part.ids.len() as u64;
            known.entry(part.partition).or_default().extend(part.ids);
        }
        debug!(table = %batch.table, parts, inserted, "parquet batch written");
        Ok(inserted)
    }

    fn count_rows(&self, table: &str) -> Result<u64, StoreError> {
        if self.read_schema(table)?.is_none() {
            return Err(StoreError::NoSuchTable(table.to_string()));
        }
        let mut total = 0u64;
        count_dir(&self.table_dir(table), &mut total)?;
        Ok(total)
    }
}

fn count_dir(dir: &Path, total: &mut u64) -> Result<(), StoreError> {
    let entries = fs::read_dir(dir).map_err(|e| StoreError::Io(format!("read dir: {e}")))?;
    for entry in entries {
        let path = entry
            .map_err(|e| StoreError::Io(format!("dir entry: {e}")))?
            .path();
        if path.is_dir() {
            count_dir(&path, total)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("parquet") {
            *total += read_parquet(&path)?.height() as u64;
        }
    }
    Ok(())
}

/// `YYYY-MM` of a millisecond timestamp, UTC.
fn month_key(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m").to_string())
        .unwrap_or_else(|| "invalid".to_string())
}

/// Natural ids stored in a month partition; empty if it does not exist yet.
fn partition_ids(partition: &Path, layout: RowLayout) -> Result<HashSet<i64>, StoreError> {
    let mut ids = HashSet::new();
    for path in part_files(partition)? {
        ids.extend(existing_ids(&read_parquet(&path)?, layout)?);
    }
    Ok(ids)
}

fn part_files(partition: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let entries = match fs::read_dir(partition) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::Io(format!("read dir: {e}"))),
    };
    let mut parts = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|e| StoreError::Io(format!("dir entry: {e}")))?
            .path();
        if path.extension().and_then(|e| e.to_str()) == Some("parquet") {
            parts.push(path);
        }
    }
    parts.sort();
    Ok(parts)
}

/// First unused `part-NNNNN.parquet` in the partition, counting parts staged
/// by the current batch as used.
fn next_part_path(partition: &Path, staged: &[StagedPart]) -> Result<PathBuf, StoreError> {
    let mut n = part_files(partition)?.len();
    loop {
        let path = partition.join(format!("part-{n:05}.parquet"));
        if !path.exists() && staged.iter().all(|p| p.path != path) {
            return Ok(path);
        }
        n += 1;
    }
}

fn read_parquet(path: &Path) -> Result<DataFrame, StoreError> {
    let file = fs::File::open(path).map_err(|e| StoreError::Parquet(format!("open: {e}")))?;
    ParquetReader::new(file)
        .finish()
        .map_err(|e| StoreError::Parquet(format!("read {}: {e}", path.display())))
}

fn write_parquet(df: &mut DataFrame, path: &Path) -> Result<(), StoreError> {
    let file =
        fs::File::create(path).map_err(|e| StoreError::Parquet(format!("create file: {e}")))?;
    ParquetWriter::new(file)
        .finish(df)
        .map_err(|e| StoreError::Parquet(format!("write parquet: {e}")))?;
    Ok(())
}

fn existing_ids(df: &DataFrame, layout: RowLayout) -> Result<HashSet<i64>, StoreError> {
    let map_err = |e: PolarsError| StoreError::Parquet(format!("id column: {e}"));
    let col = df.column(layout.id_column()).map_err(map_err)?;
    let ids = match layout {
        RowLayout::Kline => col.i64().map_err(map_err)?.into_iter().flatten().collect(),
        RowLayout::Trade | RowLayout::AggTrade => col
            .u64()
            .map_err(map_err)?
            .into_iter()
            .flatten()
            .map(|v| v as i64)
            .collect(),
    };
    Ok(ids)
}

fn rows_to_dataframe(layout: RowLayout, rows: &[&DataRow]) -> Result<DataFrame, StoreError> {
    let dec = |v: &rust_decimal::Decimal| v.to_string();

    let columns = match layout {
        RowLayout::Kline => {
            let k: Vec<_> = rows
                .iter()
                .filter_map(|r| match r {
                    DataRow::Kline(k) => Some(k),
                    _ => None,
                })
                .collect();
            vec![
                Column::new("open_time".into(), k.iter().map(|k| k.open_time).collect::<Vec<i64>>()),
                Column::new("open".into(), k.iter().map(|k| dec(&k.open)).collect::<Vec<_>>()),
                Column::new("high".into(), k.iter().map(|k| dec(&k.high)).collect::<Vec<_>>()),
                Column::new("low".into(), k.iter().map(|k| dec(&k.low)).collect::<Vec<_>>()),
                Column::new("close".into(), k.iter().map(|k| dec(&k.close)).collect::<Vec<_>>()),
                Column::new("volume".into(), k.iter().map(|k| dec(&k.volume)).collect::<Vec<_>>()),
                Column::new("close_time".into(), k.iter().map(|k| k.close_time).collect::<Vec<i64>>()),
                Column::new(
                    "quote_volume".into(),
                    k.iter().map(|k| dec(&k.quote_volume)).collect::<Vec<_>>(),
                ),
                Column::new("trade_count".into(), k.iter().map(|k| k.trade_count).collect::<Vec<u64>>()),
                Column::new(
                    "taker_buy_base_volume".into(),
                    k.iter().map(|k| dec(&k.taker_buy_base_volume)).collect::<Vec<_>>(),
                ),
                Column::new(
                    "taker_buy_quote_volume".into(),
                    k.iter().map(|k| dec(&k.taker_buy_quote_volume)).collect::<Vec<_>>(),
                ),
            ]
        }
        RowLayout::Trade => {
            let t: Vec<_> = rows
                .iter()
                .filter_map(|r| match r {
                    DataRow::Trade(t) => Some(t),
                    _ => None,
                })
                .collect();
            vec![
                Column::new("trade_id".into(), t.iter().map(|t| t.trade_id).collect::<Vec<u64>>()),
                Column::new("price".into(), t.iter().map(|t| dec(&t.price)).collect::<Vec<_>>()),
                Column::new("quantity".into(), t.iter().map(|t| dec(&t.quantity)).collect::<Vec<_>>()),
                Column::new(
                    "quote_quantity".into(),
                    t.iter().map(|t| dec(&t.quote_quantity)).collect::<Vec<_>>(),
                ),
                Column::new("time".into(), t.iter().map(|t| t.time).collect::<Vec<i64>>()),
                Column::new(
                    "is_buyer_maker".into(),
                    t.iter().map(|t| t.is_buyer_maker).collect::<Vec<bool>>(),
                ),
                Column::new(
                    "is_best_match".into(),
                    t.iter().map(|t| t.is_best_match).collect::<Vec<Option<bool>>>(),
                ),
            ]
        }
        RowLayout::AggTrade => {
            let a: Vec<_> = rows
                .iter()
                .filter_map(|r| match r {
                    DataRow::AggTrade(a) => Some(a),
                    _ => None,
                })
                .collect();
            vec![
                Column::new(
                    "agg_trade_id".into(),
                    a.iter().map(|a| a.agg_trade_id).collect::<Vec<u64>>(),
                ),
                Column::new("price".into(), a.iter().map(|a| dec(&a.price)).collect::<Vec<_>>()),
                Column::new("quantity".into(), a.iter().map(|a| dec(&a.quantity)).collect::<Vec<_>>()),
                Column::new(
                    "first_trade_id".into(),
                    a.iter().map(|a| a.first_trade_id).collect::<Vec<u64>>(),
                ),
                Column::new(
                    "last_trade_id".into(),
                    a.iter().map(|a| a.last_trade_id).collect::<Vec<u64>>(),
                ),
                Column::new("timestamp".into(), a.iter().map(|a| a.timestamp).collect::<Vec<i64>>()),
                Column::new(
                    "is_buyer_maker".into(),
                    a.iter().map(|a| a.is_buyer_maker).collect::<Vec<bool>>(),
                ),
            ]
        }
    };

    DataFrame::new(columns).map_err(|e| StoreError::Parquet(format!("dataframe creation: {e}")))
}
