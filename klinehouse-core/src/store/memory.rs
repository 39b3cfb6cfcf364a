//! In-process destination used by tests and `--destination memory`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::schema::TableSchema;
use super::{ColumnDef, Destination, LoadBatch, RowKey, StoreError};
use crate::domain::DataRow;

struct MemoryTable {
    schema: TableSchema,
    rows: BTreeMap<RowKey, DataRow>,
}

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

pub struct MemoryStore {
    instance: u64,
    tables: Mutex<BTreeMap<String, MemoryTable>>,
    /// Remaining successful inserts before every insert fails.
    insert_budget: Mutex<Option<usize>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            tables: Mutex::new(BTreeMap::new()),
            insert_budget: Mutex::new(None),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `insert_batch` after the first `n` fail.
    pub fn fail_after_batches(self, n: usize) -> Self {
        *self.budget() = Some(n);
        self
    }

    /// Stored rows of a table in natural-key order.
    pub fn rows(&self, table: &str) -> Vec<DataRow> {
        self.tables()
            .get(table)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables().keys().cloned().collect()
    }

    fn tables(&self) -> MutexGuard<'_, BTreeMap<String, MemoryTable>> {
        self.tables.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn budget(&self) -> MutexGuard<'_, Option<usize>> {
        self.insert_budget.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Destination for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn location(&self) -> String {
        format!("memory#{}", self.instance)
    }

    fn describe_table(&self, table: &str) -> Result<Option<Vec<ColumnDef>>, StoreError> {
        Ok(self.tables().get(table).map(|t| t.schema.columns.clone()))
    }

    fn create_table(&self, schema: &TableSchema) -> Result<(), StoreError> {
        self.tables()
            .entry(schema.name.clone())
            .or_insert_with(|| MemoryTable {
                schema: schema.clone(),
                rows: BTreeMap::new(),
            });
        Ok(())
    }

    fn insert_batch(&self, batch: &LoadBatch) -> Result<u64, StoreError> {
        {
            let mut budget = self.budget();
            match budget.as_mut() {
                Some(0) => {
                    return Err(StoreError::Io(format!(
                        "injected failure inserting into {}",
                        batch.table
                    )))
                }
                Some(n) => *n -= 1,
                None => {}
            }
        }

        let mut tables = self.tables();
        let table = tables
            .get_mut(&batch.table)
            .ok_or_else(|| StoreError::NoSuchTable(batch.table.clone()))?;

        if let Some(bad) = batch.rows.iter().find(|r| r.layout() != table.schema.layout) {
            return Err(StoreError::Layout {
                table: batch.table.clone(),
                message: format!("{:?} row in a {:?} table", bad.layout(), table.schema.layout),
            });
        }

        let mut inserted = 0;
        for row in &batch.rows {
            let key = RowKey::of(batch, row);
            if !table.rows.contains_key(&key) {
                table.rows.insert(key, row.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    fn count_rows(&self, table: &str) -> Result<u64, StoreError> {
        self.tables()
            .get(table)
            .map(|t| t.rows.len() as u64)
            .ok_or_else(|| StoreError::NoSuchTable(table.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AggTrade, DataKind, MarketType};
    use crate::store::table_schema;
    use rust_decimal::Decimal;

    fn agg(id: u64) -> DataRow {
        DataRow::AggTrade(AggTrade {
            agg_trade_id: id,
            price: Decimal::new(15, 1),
            quantity: Decimal::ONE,
            first_trade_id: id,
            last_trade_id: id,
            timestamp: 1_700_000_000_000 + id as i64,
            is_buyer_maker: false,
        })
    }

    fn batch(ids: &[u64]) -> LoadBatch {
        LoadBatch {
            table: "spot_agg_trades".into(),
            symbol: "BTCUSDT".into(),
            interval: None,
            rows: ids.iter().map(|&i| agg(i)).collect(),
        }
    }

    #[test]
    fn insert_or_ignore_on_natural_key() {
        let store = MemoryStore::new();
        store
            .create_table(&table_schema(MarketType::Spot, DataKind::AggTrades))
            .unwrap();
        assert_eq!(store.insert_batch(&batch(&[1, 2, 3])).unwrap(), 3);
        assert_eq!(store.insert_batch(&batch(&[2, 3, 4])).unwrap(), 1);
        assert_eq!(store.count_rows("spot_agg_trades").unwrap(), 4);
    }

    #[test]
    fn each_instance_is_its_own_location() {
        let a = MemoryStore::new();
        let b = MemoryStore::new();
        assert_ne!(a.location(), b.location());
        assert_eq!(a.location(), a.location());
    }

    #[test]
    fn missing_table_is_an_error() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.insert_batch(&batch(&[1])),
            Err(StoreError::NoSuchTable(_))
        ));
    }

    #[test]
    fn layout_mismatch_commits_nothing() {
        let store = MemoryStore::new();
        store
            .create_table(&table_schema(MarketType::Spot, DataKind::Klines))
            .unwrap();
        let mut b = batch(&[1]);
        b.table = "spot_klines".into();
        assert!(store.insert_batch(&b).is_err());
        assert_eq!(store.count_rows("spot_klines").unwrap(), 0);
    }

    #[test]
    fn injected_failures_start_after_budget() {
        let store = MemoryStore::new().fail_after_batches(1);
        store
            .create_table(&table_schema(MarketType::Spot, DataKind::AggTrades))
            .unwrap();
        assert!(store.insert_batch(&batch(&[1])).is_ok());
        assert!(store.insert_batch(&batch(&[2])).is_err());
        assert_eq!(store.rows("spot_agg_trades").len(), 1);
    }
}
