//! Table schema contract and the schema manager.
//!
//! One table per (market, kind): `spot_klines`, `um_agg_trades`, ... All
//! intervals of a kline kind share a table, so `interval` is a column and
//! part of both keys.
//!
//! - Ordering key: `(symbol, [interval,] open_time|time|timestamp)`
//! - Natural key: klines `(symbol, interval, open_time)`, trades
//!   `(symbol, trade_id)`, aggregated trades `(symbol, agg_trade_id)`

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::info;

use super::{ColumnDef, ColumnType, Destination, StoreError};
use crate::domain::{DataKind, MarketType, RowLayout};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub layout: RowLayout,
    pub columns: Vec<ColumnDef>,
    pub ordering_key: Vec<String>,
    pub natural_key: Vec<String>,
}

impl TableSchema {
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Same columns with the same types, in any order.
    pub fn is_compatible(&self, existing: &[ColumnDef]) -> bool {
        let want: BTreeSet<(&str, String)> = self
            .columns
            .iter()
            .map(|c| (c.name.as_str(), c.ty.to_string()))
            .collect();
        let have: BTreeSet<(&str, String)> = existing
            .iter()
            .map(|c| (c.name.as_str(), c.ty.to_string()))
            .collect();
        want == have
    }
}

pub fn table_name(market: MarketType, kind: DataKind) -> String {
    format!("{}_{}", market.table_prefix(), kind.table_suffix())
}

/// The fixed schema for a (market, kind) table.
pub fn table_schema(market: MarketType, kind: DataKind) -> TableSchema {
    use ColumnType::*;
    let layout = kind.layout();
    let col = ColumnDef::new;

    let (columns, ordering_key, natural_key) = match layout {
        RowLayout::Kline => (
            vec![
                col("symbol", String),
                col("interval", String),
                col("open_time", TimestampMs),
                col("open", Decimal),
                col("high", Decimal),
                col("low", Decimal),
                col("close", Decimal),
                col("volume", Decimal),
                col("close_time", TimestampMs),
                col("quote_volume", Decimal),
                col("trade_count", UInt64),
                col("taker_buy_base_volume", Decimal),
                col("taker_buy_quote_volume", Decimal),
            ],
            vec!["symbol", "interval", "open_time"],
            vec!["symbol", "interval", "open_time"],
        ),
        RowLayout::Trade => (
            vec![
                col("symbol", String),
                col("trade_id", UInt64),
                col("price", Decimal),
                col("quantity", Decimal),
                col("quote_quantity", Decimal),
                col("time", TimestampMs),
                col("is_buyer_maker", Bool),
                col("is_best_match", NullableBool),
            ],
            vec!["symbol", "time"],
            vec!["symbol", "trade_id"],
        ),
        RowLayout::AggTrade => (
            vec![
                col("symbol", String),
                col("agg_trade_id", UInt64),
                col("price", Decimal),
                col("quantity", Decimal),
                col("first_trade_id", UInt64),
                col("last_trade_id", UInt64),
                col("timestamp", TimestampMs),
                col("is_buyer_maker", Bool),
            ],
            vec!["symbol", "timestamp"],
            vec!["symbol", "agg_trade_id"],
        ),
    };

    let owned = |v: Vec<&str>| v.into_iter().map(str::to_string).collect();
    TableSchema {
        name: table_name(market, kind),
        layout,
        columns,
        ordering_key: owned(ordering_key),
        natural_key: owned(natural_key),
    }
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("table '{table}' exists with an incompatible schema (expected [{expected}], found [{found}]); migrate it manually")]
    Conflict {
        table: String,
        expected: String,
        found: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Creates or checks destination tables, at most once per table per run.
pub struct SchemaManager {
    destination: Arc<dyn Destination>,
    ensured: Mutex<HashMap<String, TableSchema>>,
    created: Mutex<HashSet<String>>,
    dry_run: bool,
}

impl SchemaManager {
    pub fn new(destination: Arc<dyn Destination>, dry_run: bool) -> Self {
        Self {
            destination,
            ensured: Mutex::new(HashMap::new()),
            created: Mutex::new(HashSet::new()),
            dry_run,
        }
    }

    /// Make sure the table for (market, kind) exists with the expected
    /// columns. Existing compatible tables are left alone; incompatible ones
    /// are reported, never altered. A dry run only inspects.
    pub fn ensure_schema(
        &self,
        market: MarketType,
        kind: DataKind,
    ) -> Result<TableSchema, SchemaError> {
        let schema = table_schema(market, kind);
        if let Some(done) = self.lock().get(&schema.name) {
            return Ok(done.clone());
        }

        match self.destination.describe_table(&schema.name)? {
            Some(existing) => {
                if !schema.is_compatible(&existing) {
                    return Err(SchemaError::Conflict {
                        table: schema.name.clone(),
                        expected: describe(&schema.columns),
                        found: describe(&existing),
                    });
                }
                info!(table = %schema.name, store = self.destination.name(), "table exists");
            }
            None if self.dry_run => {
                info!(table = %schema.name, store = self.destination.name(), "dry run: table would be created");
            }
            None => {
                self.destination.create_table(&schema)?;
                self.created
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .insert(schema.name.clone());
                info!(table = %schema.name, store = self.destination.name(), "table created");
            }
        }

        self.lock().insert(schema.name.clone(), schema.clone());
        Ok(schema)
    }

    /// True if this manager created `table`, so nothing was loaded into it
    /// before.
    pub fn was_created(&self, table: &str) -> bool {
        self.created
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(table)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, TableSchema>> {
        self.ensured.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn describe(columns: &[ColumnDef]) -> String {
    columns
        .iter()
        .map(|c| format!("{} {}", c.name, c.ty))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn table_names_combine_market_and_kind() {
        assert_eq!(table_name(MarketType::Spot, DataKind::Klines), "spot_klines");
        assert_eq!(table_name(MarketType::UsdMFutures, DataKind::AggTrades), "um_agg_trades");
        assert_eq!(
            table_name(MarketType::CoinMFutures, DataKind::MarkPriceKlines),
            "cm_mark_price_klines"
        );
    }

    #[test]
    fn keys_follow_layout() {
        let k = table_schema(MarketType::Spot, DataKind::Klines);
        assert_eq!(k.ordering_key, vec!["symbol", "interval", "open_time"]);
        let t = table_schema(MarketType::Spot, DataKind::Trades);
        assert_eq!(t.ordering_key, vec!["symbol", "time"]);
        assert_eq!(t.natural_key, vec!["symbol", "trade_id"]);
        let a = table_schema(MarketType::Spot, DataKind::AggTrades);
        assert_eq!(a.natural_key, vec!["symbol", "agg_trade_id"]);
        for s in [k, t, a] {
            for key in s.ordering_key.iter().chain(&s.natural_key) {
                assert!(s.column_names().contains(&key.as_str()), "{key} not a column");
            }
        }
    }

    #[test]
    fn compatibility_ignores_column_order() {
        let s = table_schema(MarketType::Spot, DataKind::AggTrades);
        let mut reversed = s.columns.clone();
        reversed.reverse();
        assert!(s.is_compatible(&reversed));
        reversed.pop();
        assert!(!s.is_compatible(&reversed));
    }

    #[test]
    fn ensure_schema_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let mgr = SchemaManager::new(store.clone(), false);
        mgr.ensure_schema(MarketType::Spot, DataKind::Klines).unwrap();
        mgr.ensure_schema(MarketType::Spot, DataKind::Klines).unwrap();

        assert!(mgr.was_created("spot_klines"));

        let fresh = SchemaManager::new(store.clone(), false);
        fresh.ensure_schema(MarketType::Spot, DataKind::Klines).unwrap();
        assert!(store.describe_table("spot_klines").unwrap().is_some());
        assert!(!fresh.was_created("spot_klines"));
    }

    #[test]
    fn incompatible_table_is_a_conflict() {
        let store = Arc::new(MemoryStore::new());
        let mut wrong = table_schema(MarketType::Spot, DataKind::Trades);
        wrong.name = "spot_klines".into();
        store.create_table(&wrong).unwrap();

        let mgr = SchemaManager::new(store, false);
        let err = mgr.ensure_schema(MarketType::Spot, DataKind::Klines).unwrap_err();
        assert!(matches!(err, SchemaError::Conflict { ref table, .. } if table == "spot_klines"));
    }

    #[test]
    fn dry_run_does_not_create() {
        let store = Arc::new(MemoryStore::new());
        let mgr = SchemaManager::new(store.clone(), true);
        mgr.ensure_schema(MarketType::Spot, DataKind::Trades).unwrap();
        assert!(store.describe_table("spot_trades").unwrap().is_none());
        assert!(!mgr.was_created("spot_trades"));
    }
}
