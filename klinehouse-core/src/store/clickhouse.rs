//! ClickHouse destination over the HTTP interface.
//!
//! Tables use `ReplacingMergeTree` ordered by the ordering key extended with
//! the natural key, so rows loaded twice collapse into one; counts read with
//! `FINAL` see the deduplicated view. Inserts are one `INSERT ... FORMAT
//! JSONEachRow` request per batch, which ClickHouse applies atomically; the
//! row count an insert reports is rows sent, since duplicates collapse only
//! at merge time.
//!
//! The database is created on first table creation. Table introspection runs
//! against `system.columns` without selecting the database, so a missing
//! database reads as a missing table.

use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::schema::TableSchema;
use super::{ColumnDef, ColumnType, Destination, LoadBatch, StoreError};
use crate::domain::DataRow;

/// Connection settings. Read from `CH_HOST`, `CH_USER`, `CH_PASSWORD` and
/// `CH_DATABASE`; a bare host name gets `http://` and port 8123.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClickHouseConfig {
    pub url: String,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".into(),
            user: "default".into(),
            password: String::new(),
            database: "crypto".into(),
        }
    }
}

impl ClickHouseConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            url: non_empty("CH_HOST")
                .map(|h| normalize_url(&h))
                .unwrap_or(defaults.url),
            user: non_empty("CH_USER").unwrap_or(defaults.user),
            password: lookup("CH_PASSWORD").unwrap_or(defaults.password),
            database: non_empty("CH_DATABASE").unwrap_or(defaults.database),
        }
    }
}

fn normalize_url(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{host}:8123")
    }
}

pub struct ClickHouseStore {
    client: reqwest::blocking::Client,
    config: ClickHouseConfig,
}

#[derive(Deserialize)]
struct SystemColumn {
    name: String,
    #[serde(rename = "type")]
    ty: String,
}

impl ClickHouseStore {
    pub fn new(config: ClickHouseConfig) -> Result<Self, StoreError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| StoreError::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ClickHouseConfig {
        &self.config
    }

    /// Run `sql` in the configured database. With `data`, the statement
    /// travels in the `query` parameter and `data` is the request body.
    fn execute(
        &self,
        sql: &str,
        data: Option<String>,
        params: &[(&str, &str)],
    ) -> Result<String, StoreError> {
        self.send(sql, data, params, true)
    }

    /// Run `sql` without selecting a database.
    fn execute_on_server(&self, sql: &str, params: &[(&str, &str)]) -> Result<String, StoreError> {
        self.send(sql, None, params, false)
    }

    fn send(
        &self,
        sql: &str,
        data: Option<String>,
        params: &[(&str, &str)],
        use_database: bool,
    ) -> Result<String, StoreError> {
        let mut query: Vec<(String, String)> = Vec::new();
        if use_database {
            query.push(("database".into(), self.config.database.clone()));
        }
        for (k, v) in params {
            query.push((format!("param_{k}"), v.to_string()));
        }
        let body = match data {
            Some(data) => {
                query.push(("query".into(), sql.to_string()));
                data
            }
            None => sql.to_string(),
        };

        let resp = self
            .client
            .post(&self.config.url)
            .query(&query)
            .header("X-ClickHouse-User", &self.config.user)
            .header("X-ClickHouse-Key", &self.config.password)
            .body(body)
            .send()
            .map_err(|e| StoreError::Http(e.to_string()))?;

        let status = resp.status();
        let text = resp.text().map_err(|e| StoreError::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(StoreError::Server {
                status: status.as_u16(),
                message: text.trim().to_string(),
            });
        }
        Ok(text)
    }

    fn qualified(&self, table: &str) -> String {
        format!("`{}`.`{}`", self.config.database, table)
    }

    pub fn create_database(&self) -> Result<(), StoreError> {
        let sql = format!("CREATE DATABASE IF NOT EXISTS `{}`", self.config.database);
        self.execute_on_server(&sql, &[])?;
        Ok(())
    }
}

/// `UNKNOWN_DATABASE` (code 81) and `UNKNOWN_TABLE` (code 60).
fn is_unknown_object(err: &StoreError) -> bool {
    match err {
        StoreError::Server { message, .. } => {
            message.contains("UNKNOWN_DATABASE")
                || message.contains("UNKNOWN_TABLE")
                || message.starts_with("Code: 81.")
                || message.starts_with("Code: 60.")
        }
        _ => false,
    }
}

impl Destination for ClickHouseStore {
    fn name(&self) -> &str {
        "clickhouse"
    }

    fn location(&self) -> String {
        format!("clickhouse:{}/{}", self.config.url, self.config.database)
    }

    fn describe_table(&self, table: &str) -> Result<Option<Vec<ColumnDef>>, StoreError> {
        let sql = "SELECT name, type FROM system.columns \
                   WHERE database = {db:String} AND table = {table:String} \
                   ORDER BY position FORMAT JSONEachRow";
        let text = match self.execute_on_server(
            sql,
            &[("db", self.config.database.as_str()), ("table", table)],
        ) {
            Ok(text) => text,
            Err(e) if is_unknown_object(&e) => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut columns = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let col: SystemColumn = serde_json::from_str(line)
                .map_err(|e| StoreError::Http(format!("unexpected system.columns row: {e}")))?;
            columns.push(ColumnDef {
                name: col.name,
                ty: column_type_from_sql(&col.ty),
            });
        }
        Ok(if columns.is_empty() { None } else { Some(columns) })
    }

    fn create_table(&self, schema: &TableSchema) -> Result<(), StoreError> {
        self.create_database()?;
        let ddl = create_table_sql(&self.qualified(&schema.name), schema);
        debug!(table = %schema.name, %ddl, "creating table");
        self.execute(&ddl, None, &[])?;
        Ok(())
    }

    /// Rows sent. `ReplacingMergeTree` drops duplicates later, during merges.
    fn insert_batch(&self, batch: &LoadBatch) -> Result<u64, StoreError> {
        if batch.rows.is_empty() {
            return Ok(0);
        }
        let sql = format!("INSERT INTO {} FORMAT JSONEachRow", self.qualified(&batch.table));
        self.execute(&sql, Some(json_each_row(batch)), &[])?;
        Ok(batch.rows.len() as u64)
    }

    fn count_rows(&self, table: &str) -> Result<u64, StoreError> {
        let sql = format!("SELECT count() FROM {} FINAL", self.qualified(table));
        let text = self.execute(&sql, None, &[])?;
        text.trim()
            .parse()
            .map_err(|_| StoreError::Http(format!("unexpected count response: {text}")))
    }
}

pub fn column_type_sql(ty: &ColumnType) -> &str {
    match ty {
        ColumnType::String => "LowCardinality(String)",
        ColumnType::UInt64 => "UInt64",
        ColumnType::TimestampMs => "DateTime64(3, 'UTC')",
        ColumnType::Decimal => "Decimal(38, 18)",
        ColumnType::Bool => "Bool",
        ColumnType::NullableBool => "Nullable(Bool)",
        ColumnType::Other(s) => s,
    }
}

pub fn column_type_from_sql(sql: &str) -> ColumnType {
    match sql.trim() {
        "String" | "LowCardinality(String)" => ColumnType::String,
        "UInt64" => ColumnType::UInt64,
        "DateTime64(3, 'UTC')" => ColumnType::TimestampMs,
        "Decimal(38, 18)" => ColumnType::Decimal,
        "Bool" => ColumnType::Bool,
        "Nullable(Bool)" => ColumnType::NullableBool,
        other => ColumnType::Other(other.to_string()),
    }
}

pub fn create_table_sql(qualified_name: &str, schema: &TableSchema) -> String {
    let columns = schema
        .columns
        .iter()
        .map(|c| format!("    `{}` {}", c.name, column_type_sql(&c.ty)))
        .collect::<Vec<_>>()
        .join(",\n");

    let mut order_by: Vec<&str> = schema.ordering_key.iter().map(String::as_str).collect();
    for key in &schema.natural_key {
        if !order_by.contains(&key.as_str()) {
            order_by.push(key);
        }
    }
    let order_by: Vec<String> = order_by.iter().map(|k| format!("`{k}`")).collect();

    format!(
        "CREATE TABLE IF NOT EXISTS {qualified_name}\n(\n{columns}\n)\n\
         ENGINE = ReplacingMergeTree\nORDER BY ({})",
        order_by.join(", ")
    )
}

/// `2020-04-01 00:00:00.000`, the text form DateTime64(3) parses.
fn timestamp_text(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| ms.to_string())
}

fn row_json(batch: &LoadBatch, row: &DataRow) -> Value {
    match row {
        DataRow::Kline(k) => json!({
            "symbol": batch.symbol,
            "interval": batch.interval.map(|i| i.as_str()).unwrap_or_default(),
            "open_time": timestamp_text(k.open_time),
            "open": k.open.to_string(),
            "high": k.high.to_string(),
            "low": k.low.to_string(),
            "close": k.close.to_string(),
            "volume": k.volume.to_string(),
            "close_time": timestamp_text(k.close_time),
            "quote_volume": k.quote_volume.to_string(),
            "trade_count": k.trade_count,
            "taker_buy_base_volume": k.taker_buy_base_volume.to_string(),
            "taker_buy_quote_volume": k.taker_buy_quote_volume.to_string(),
        }),
        DataRow::Trade(t) => json!({
            "symbol": batch.symbol,
            "trade_id": t.trade_id,
            "price": t.price.to_string(),
            "quantity": t.quantity.to_string(),
            "quote_quantity": t.quote_quantity.to_string(),
            "time": timestamp_text(t.time),
            "is_buyer_maker": t.is_buyer_maker,
            "is_best_match": t.is_best_match,
        }),
        DataRow::AggTrade(a) => json!({
            "symbol": batch.symbol,
            "agg_trade_id": a.agg_trade_id,
            "price": a.price.to_string(),
            "quantity": a.quantity.to_string(),
            "first_trade_id": a.first_trade_id,
            "last_trade_id": a.last_trade_id,
            "timestamp": timestamp_text(a.timestamp),
            "is_buyer_maker": a.is_buyer_maker,
        }),
    }
}

/// One JSON object per line.
pub fn json_each_row(batch: &LoadBatch) -> String {
    let mut body = String::new();
    for row in &batch.rows {
        body.push_str(&row_json(batch, row).to_string());
        body.push('\n');
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DataKind, Interval, MarketType, RowLayout};
    use crate::store::table_schema;
    use crate::testing::kline_line;
    use std::collections::HashMap;

    #[test]
    fn config_from_lookup_applies_defaults() {
        let env: HashMap<&str, &str> = [("CH_HOST", "ch.internal"), ("CH_PASSWORD", "s3cret")]
            .into_iter()
            .collect();
        let cfg = ClickHouseConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.url, "http://ch.internal:8123");
        assert_eq!(cfg.user, "default");
        assert_eq!(cfg.password, "s3cret");
        assert_eq!(cfg.database, "crypto");
    }

    #[test]
    fn unknown_database_reads_as_missing() {
        let err = StoreError::Server {
            status: 404,
            message: "Code: 81. DB::Exception: Database crypto does not exist. (UNKNOWN_DATABASE)"
                .into(),
        };
        assert!(is_unknown_object(&err));
        let other = StoreError::Server {
            status: 500,
            message: "Code: 241. DB::Exception: Memory limit exceeded. (MEMORY_LIMIT_EXCEEDED)"
                .into(),
        };
        assert!(!is_unknown_object(&other));
    }

    #[test]
    fn location_names_server_and_database() {
        let store = ClickHouseStore::new(ClickHouseConfig::default()).unwrap();
        assert_eq!(store.location(), "clickhouse:http://localhost:8123/crypto");
    }

    #[test]
    fn explicit_urls_are_kept() {
        let cfg = ClickHouseConfig::from_lookup(|k| {
            (k == "CH_HOST").then(|| "https://ch.example.com:8443/".to_string())
        });
        assert_eq!(cfg.url, "https://ch.example.com:8443");
    }

    #[test]
    fn ddl_orders_by_ordering_then_natural_key() {
        let schema = table_schema(MarketType::Spot, DataKind::Trades);
        let ddl = create_table_sql("`crypto`.`spot_trades`", &schema);
        assert!(ddl.starts_with("CREATE TABLE IF NOT EXISTS `crypto`.`spot_trades`"));
        assert!(ddl.contains("`price` Decimal(38, 18)"));
        assert!(ddl.contains("`is_best_match` Nullable(Bool)"));
        assert!(ddl.contains("ENGINE = ReplacingMergeTree"));
        assert!(ddl.ends_with("ORDER BY (`symbol`, `time`, `trade_id`)"));

        let klines = table_schema(MarketType::Spot, DataKind::Klines);
        let ddl = create_table_sql("k", &klines);
        assert!(ddl.ends_with("ORDER BY (`symbol`, `interval`, `open_time`)"));
    }

    #[test]
    fn sql_types_roundtrip() {
        for ty in [
            ColumnType::String,
            ColumnType::UInt64,
            ColumnType::TimestampMs,
            ColumnType::Decimal,
            ColumnType::Bool,
            ColumnType::NullableBool,
        ] {
            assert_eq!(column_type_from_sql(column_type_sql(&ty)), ty);
        }
        assert_eq!(
            column_type_from_sql("Float64"),
            ColumnType::Other("Float64".into())
        );
    }

    #[test]
    fn kline_rows_serialize_with_partition_columns() {
        let line = kline_line(1_585_699_200_000);
        let record = csv::StringRecord::from(line.split(',').collect::<Vec<_>>());
        let batch = LoadBatch {
            table: "spot_klines".into(),
            symbol: "BTCUSDT".into(),
            interval: Some(Interval::M1),
            rows: vec![DataRow::decode(RowLayout::Kline, &record).unwrap()],
        };
        let body = json_each_row(&batch);
        let v: Value = serde_json::from_str(body.trim()).unwrap();
        assert_eq!(v["symbol"], "BTCUSDT");
        assert_eq!(v["interval"], "1m");
        assert_eq!(v["open_time"], "2020-04-01 00:00:00.000");
        assert_eq!(v["open"], "6407.10");
        assert_eq!(v["trade_count"], 1082);
        assert_eq!(body.lines().count(), 1);
    }
}
