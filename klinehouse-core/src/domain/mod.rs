//! Domain types for klinehouse

pub mod market;
pub mod row;
pub mod target;

pub use market::{DataKind, Interval, MarketType, ParseEnumError};
pub use row::{AggTrade, DataRow, DecodeError, Kline, RowLayout, Trade};
pub use target::{FetchTarget, Granularity, Period};

/// Symbol type alias
pub type Symbol = String;
