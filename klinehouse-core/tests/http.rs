//! HTTP behaviour of the archive source and the ClickHouse store against a
//! local mock server.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use mockito::{Matcher, Server};

use klinehouse_core::cancel::CancellationToken;
use klinehouse_core::data::{
    ArchiveCache, ArchiveFetcher, ArchiveSource, FetchError, HttpSource, RetryPolicy, SourceError,
};
use klinehouse_core::domain::{AggTrade, DataKind, DataRow, FetchTarget, MarketType, Period};
use klinehouse_core::store::{
    table_schema, ClickHouseConfig, ClickHouseStore, ColumnDef, ColumnType, Destination,
    LoadBatch, StoreError,
};
use rust_decimal::Decimal;

const ARCHIVE_PATH: &str =
    "/data/spot/daily/aggTrades/BTCUSDT/BTCUSDT-aggTrades-2024-01-01.zip";

fn source() -> HttpSource {
    HttpSource::new(Duration::from_secs(10)).unwrap()
}

fn agg_target() -> FetchTarget {
    FetchTarget::new(
        MarketType::Spot,
        DataKind::AggTrades,
        "BTCUSDT",
        None,
        Period::day(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()),
    )
}

fn clickhouse(server: &Server) -> ClickHouseStore {
    ClickHouseStore::new(ClickHouseConfig {
        url: server.url(),
        ..ClickHouseConfig::default()
    })
    .unwrap()
}

fn agg(id: u64) -> DataRow {
    DataRow::AggTrade(AggTrade {
        agg_trade_id: id,
        price: Decimal::new(4215025, 2),
        quantity: Decimal::new(3, 3),
        first_trade_id: id * 10,
        last_trade_id: id * 10 + 2,
        timestamp: 1_704_067_200_000 + id as i64,
        is_buyer_maker: true,
    })
}

#[test]
fn missing_archive_is_not_found() {
    let mut server = Server::new();
    let mock = server.mock("GET", ARCHIVE_PATH).with_status(404).create();

    let url = format!("{}{ARCHIVE_PATH}", server.url());
    let err = source().get(&url, &CancellationToken::new()).unwrap_err();
    assert_eq!(err, SourceError::NotFound { url });
    mock.assert();
}

#[test]
fn server_error_is_a_transient_status() {
    let mut server = Server::new();
    server.mock("GET", ARCHIVE_PATH).with_status(503).create();

    let err = source()
        .get(&format!("{}{ARCHIVE_PATH}", server.url()), &CancellationToken::new())
        .unwrap_err();
    assert!(matches!(err, SourceError::Status { status: 503, .. }));
    assert!(err.is_transient());
}

#[test]
fn large_body_is_read_in_full() {
    let mut server = Server::new();
    let body: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    server
        .mock("GET", ARCHIVE_PATH)
        .with_status(200)
        .with_body(body.clone())
        .create();

    let got = source()
        .get(&format!("{}{ARCHIVE_PATH}", server.url()), &CancellationToken::new())
        .unwrap();
    assert_eq!(got.len(), body.len());
    assert_eq!(got, body);
}

#[test]
fn fetcher_retries_server_errors_then_gives_up() {
    let mut server = Server::new();
    let mock = server
        .mock("GET", ARCHIVE_PATH)
        .with_status(503)
        .expect(3)
        .create();
    let cache = tempfile::tempdir().unwrap();
    let fetcher = ArchiveFetcher::new(Arc::new(source()), ArchiveCache::new(cache.path()))
        .with_base_url(server.url())
        .with_retry(RetryPolicy::immediate(2));

    let err = fetcher
        .fetch(&agg_target(), None, &CancellationToken::new())
        .unwrap_err();
    assert!(matches!(
        err,
        FetchError::Exhausted {
            attempts: 3,
            last: SourceError::Status { status: 503, .. },
            ..
        }
    ));
    mock.assert();
    assert!(!fetcher.cache().archive_path(&agg_target()).exists());
}

#[test]
fn fetcher_maps_404_to_not_found_without_retry() {
    let mut server = Server::new();
    let mock = server
        .mock("GET", ARCHIVE_PATH)
        .with_status(404)
        .expect(1)
        .create();
    let cache = tempfile::tempdir().unwrap();
    let fetcher = ArchiveFetcher::new(Arc::new(source()), ArchiveCache::new(cache.path()))
        .with_base_url(server.url())
        .with_retry(RetryPolicy::immediate(3));

    let err = fetcher
        .fetch(&agg_target(), None, &CancellationToken::new())
        .unwrap_err();
    assert!(matches!(err, FetchError::NotFound { .. }));
    mock.assert();
}

#[test]
fn clickhouse_describes_columns_from_system_table() {
    let mut server = Server::new();
    let mock = server
        .mock("POST", "/")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("param_db".into(), "crypto".into()),
            Matcher::UrlEncoded("param_table".into(), "spot_agg_trades".into()),
        ]))
        .match_header("X-ClickHouse-User", "default")
        .match_body(Matcher::Regex("FROM system.columns".into()))
        .with_status(200)
        .with_body(
            "{\"name\":\"symbol\",\"type\":\"LowCardinality(String)\"}\n\
             {\"name\":\"agg_trade_id\",\"type\":\"UInt64\"}\n\
             {\"name\":\"price\",\"type\":\"Decimal(38, 18)\"}\n",
        )
        .create();

    let columns = clickhouse(&server)
        .describe_table("spot_agg_trades")
        .unwrap()
        .unwrap();
    assert_eq!(
        columns,
        vec![
            ColumnDef::new("symbol", ColumnType::String),
            ColumnDef::new("agg_trade_id", ColumnType::UInt64),
            ColumnDef::new("price", ColumnType::Decimal),
        ]
    );
    mock.assert();
}

#[test]
fn clickhouse_missing_table_or_database_describes_as_none() {
    let mut server = Server::new();
    server
        .mock("POST", "/")
        .match_query(Matcher::Any)
        .match_body(Matcher::Regex("FROM system.columns".into()))
        .with_status(200)
        .with_body("")
        .create();
    assert!(clickhouse(&server).describe_table("spot_agg_trades").unwrap().is_none());

    let mut fresh = Server::new();
    fresh
        .mock("POST", "/")
        .match_query(Matcher::Any)
        .with_status(404)
        .with_body("Code: 81. DB::Exception: Database crypto does not exist. (UNKNOWN_DATABASE)")
        .create();
    assert!(clickhouse(&fresh).describe_table("spot_agg_trades").unwrap().is_none());
}

#[test]
fn clickhouse_creates_database_before_table() {
    let mut server = Server::new();
    let database = server
        .mock("POST", "/")
        .match_query(Matcher::Any)
        .match_body(Matcher::Regex("^CREATE DATABASE IF NOT EXISTS `crypto`$".into()))
        .with_status(200)
        .expect(1)
        .create();
    let table = server
        .mock("POST", "/")
        .match_query(Matcher::UrlEncoded("database".into(), "crypto".into()))
        .match_body(Matcher::Regex(
            "^CREATE TABLE IF NOT EXISTS `crypto`.`spot_agg_trades`".into(),
        ))
        .with_status(200)
        .expect(1)
        .create();

    clickhouse(&server)
        .create_table(&table_schema(MarketType::Spot, DataKind::AggTrades))
        .unwrap();
    database.assert();
    table.assert();
}

#[test]
fn clickhouse_insert_sends_json_each_row_and_reports_rows_sent() {
    let mut server = Server::new();
    let mock = server
        .mock("POST", "/")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("database".into(), "crypto".into()),
            Matcher::UrlEncoded(
                "query".into(),
                "INSERT INTO `crypto`.`spot_agg_trades` FORMAT JSONEachRow".into(),
            ),
        ]))
        .match_body(Matcher::Regex("\"agg_trade_id\":7".into()))
        .with_status(200)
        .expect(2)
        .create();

    let store = clickhouse(&server);
    let batch = LoadBatch {
        table: "spot_agg_trades".into(),
        symbol: "BTCUSDT".into(),
        interval: None,
        rows: vec![agg(7), agg(8)],
    };
    assert_eq!(store.insert_batch(&batch).unwrap(), 2);
    // Duplicates are collapsed by the engine later, not refused.
    assert_eq!(store.insert_batch(&batch).unwrap(), 2);
    mock.assert();
}

#[test]
fn clickhouse_server_errors_surface_status_and_message() {
    let mut server = Server::new();
    server
        .mock("POST", "/")
        .match_query(Matcher::Any)
        .with_status(500)
        .with_body("Code: 241. DB::Exception: Memory limit exceeded")
        .create();

    let batch = LoadBatch {
        table: "spot_agg_trades".into(),
        symbol: "BTCUSDT".into(),
        interval: None,
        rows: vec![agg(1)],
    };
    let err = clickhouse(&server).insert_batch(&batch).unwrap_err();
    assert!(matches!(
        err,
        StoreError::Server { status: 500, ref message } if message.contains("Memory limit")
    ));
}

#[test]
fn clickhouse_count_parses_number_and_rejects_garbage() {
    let mut server = Server::new();
    server
        .mock("POST", "/")
        .match_query(Matcher::Any)
        .match_body(Matcher::Regex("FROM `crypto`.`spot_klines` FINAL".into()))
        .with_status(200)
        .with_body("42\n")
        .create();
    server
        .mock("POST", "/")
        .match_query(Matcher::Any)
        .match_body(Matcher::Regex("FROM `crypto`.`spot_trades` FINAL".into()))
        .with_status(200)
        .with_body("not a number")
        .create();

    let store = clickhouse(&server);
    assert_eq!(store.count_rows("spot_klines").unwrap(), 42);
    assert!(matches!(
        store.count_rows("spot_trades"),
        Err(StoreError::Http(_))
    ));
}
