//! End-to-end acquisition: fetch → verify → extract → load, against an
//! in-memory archive host and real cache/store directories.

use std::sync::Arc;

use chrono::NaiveDate;
use klinehouse_core::cancel::CancellationToken;
use klinehouse_core::data::checksum::{verify, IntegrityError};
use klinehouse_core::data::{ArchiveCache, ArchiveExtractor, ArchiveFetcher, Fetched, RetryPolicy};
use klinehouse_core::domain::{DataKind, FetchTarget, Interval, MarketType, Period};
use klinehouse_core::store::{BatchLoader, Destination, MemoryStore, ParquetStore, SchemaManager};
use klinehouse_core::testing::{kline_line, MapSource};

const BASE: &str = "https://archive.test";

fn kline_target() -> FetchTarget {
    FetchTarget::new(
        MarketType::Spot,
        DataKind::Klines,
        "btcusdt",
        Some(Interval::M1),
        Period::Monthly {
            year: 2020,
            month: 4,
        },
    )
}

fn minute_lines(n: i64) -> Vec<String> {
    (0..n)
        .map(|i| kline_line(1_585_699_200_000 + i * 60_000))
        .collect()
}

fn fetcher(source: MapSource, cache_root: &std::path::Path) -> ArchiveFetcher {
    ArchiveFetcher::new(Arc::new(source), ArchiveCache::new(cache_root))
        .with_base_url(BASE)
        .with_retry(RetryPolicy::immediate(2))
        .with_checksum(true)
}

#[test]
fn verified_archive_loads_every_row() {
    let cache_dir = tempfile::tempdir().unwrap();
    let target = kline_target();
    let lines = minute_lines(120);
    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    let fetcher = fetcher(
        MapSource::new().with_archive(BASE, &target, &refs, true),
        cache_dir.path(),
    );

    let cancel = CancellationToken::new();
    let destination = "memory#test/spot_klines";
    let archive = match fetcher.fetch(&target, Some(destination), &cancel).unwrap() {
        Fetched::Archive(a) => a,
        Fetched::CacheHit(_) => panic!("fresh cache cannot hit"),
    };
    let verification = verify(&archive.bytes, archive.checksum.as_deref()).unwrap();
    assert!(verification.is_verified());

    let store = Arc::new(MemoryStore::new());
    let schema = SchemaManager::new(store.clone(), false)
        .ensure_schema(target.market, target.kind)
        .unwrap();
    let mut extractor = ArchiveExtractor::new(&archive.bytes, target.kind).unwrap();
    assert_eq!(extractor.entry_name(), "BTCUSDT-1m-2020-04.csv");
    let rows = extractor.rows().unwrap();

    let result = BatchLoader::new(store.clone(), 50, false)
        .load(&schema, &target.symbol, target.interval, rows)
        .unwrap();
    assert_eq!(result.rows_loaded, 120);
    assert_eq!(result.batches, 3);
    assert_eq!(store.count_rows("spot_klines").unwrap(), 120);

    fetcher
        .cache()
        .mark_complete(&target, destination, &verification, result.rows_loaded)
        .unwrap();
    assert!(matches!(
        fetcher.fetch(&target, Some(destination), &cancel).unwrap(),
        Fetched::CacheHit(meta) if meta.rows_loaded == 120
    ));
}

#[test]
fn tampered_archive_fails_verification() {
    let cache_dir = tempfile::tempdir().unwrap();
    let target = kline_target();
    let line = kline_line(1_585_699_200_000);
    let source = MapSource::new()
        .with_archive(BASE, &target, &[line.as_str()], true)
        // Replace the archive after its sidecar was computed.
        .with_file(
            &target.url(BASE),
            klinehouse_core::testing::zip_csv("BTCUSDT-1m-2020-04.csv", &["tampered"]),
        );
    let fetcher = fetcher(source, cache_dir.path());

    let Fetched::Archive(archive) = fetcher.fetch(&target, None, &CancellationToken::new()).unwrap()
    else {
        panic!("expected a download");
    };
    let err = verify(&archive.bytes, archive.checksum.as_deref()).unwrap_err();
    assert!(matches!(err, IntegrityError::Mismatch { .. }));
}

#[test]
fn interrupted_run_reuses_cached_archive() {
    let cache_dir = tempfile::tempdir().unwrap();
    let target = kline_target();
    let lines = minute_lines(3);
    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();

    {
        let first = fetcher(
            MapSource::new().with_archive(BASE, &target, &refs, true),
            cache_dir.path(),
        );
        first.fetch(&target, None, &CancellationToken::new()).unwrap();
        // Crash before loading: no completion meta written.
    }

    // The host is gone; the archive and sidecar must come from the cache.
    let second = fetcher(MapSource::new(), cache_dir.path());
    let Fetched::Archive(archive) = second.fetch(&target, None, &CancellationToken::new()).unwrap()
    else {
        panic!("no meta was written, so this is not a cache hit");
    };
    assert!(archive.from_cache);
    assert!(verify(&archive.bytes, archive.checksum.as_deref())
        .unwrap()
        .is_verified());
}

#[test]
fn parquet_store_reload_is_idempotent() {
    let store_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ParquetStore::new(store_dir.path()));
    let schema = SchemaManager::new(store.clone(), false)
        .ensure_schema(MarketType::Spot, DataKind::Klines)
        .unwrap();

    let lines = minute_lines(10);
    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    let bytes = klinehouse_core::testing::zip_csv("BTCUSDT-1m-2020-04.csv", &refs);
    let loader = BatchLoader::new(store.clone(), 4, false);

    for _ in 0..2 {
        let mut extractor = ArchiveExtractor::new(&bytes, DataKind::Klines).unwrap();
        let rows = extractor.rows().unwrap();
        loader
            .load(&schema, "BTCUSDT", Some(Interval::M1), rows)
            .unwrap();
    }
    assert_eq!(store.count_rows("spot_klines").unwrap(), 10);
    let month = store_dir
        .path()
        .join("spot_klines/symbol=BTCUSDT/interval=1m/month=2020-04");
    let parts = std::fs::read_dir(&month).unwrap().count();
    assert_eq!(parts, 3, "three batches on the first load, none on the reload");
}

#[test]
fn daily_trades_url_layout() {
    let target = FetchTarget::new(
        MarketType::UsdMFutures,
        DataKind::AggTrades,
        "ethusdt",
        None,
        Period::day(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()),
    );
    assert_eq!(
        target.url(BASE),
        "https://archive.test/data/futures/um/daily/aggTrades/ETHUSDT/ETHUSDT-aggTrades-2024-01-01.zip"
    );
    assert_eq!(target.checksum_url(BASE), format!("{}.CHECKSUM", target.url(BASE)));
}
