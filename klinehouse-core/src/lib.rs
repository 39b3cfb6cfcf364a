//! Klinehouse Core — archive acquisition and loading for Binance Vision
//! market data.
//!
//! This crate holds everything below the pipeline driver:
//! - Domain types (markets, data kinds, intervals, fetch targets, rows)
//! - Range resolution from a selection to concrete archive targets
//! - Fetching with retry, local caching, and checksum verification
//! - Streaming CSV extraction out of zip archives
//! - Destination stores (ClickHouse, Parquet, memory), schema management,
//!   and the batch loader

pub mod cancel;
pub mod data;
pub mod domain;
pub mod store;
pub mod testing;

pub use cancel::CancellationToken;
