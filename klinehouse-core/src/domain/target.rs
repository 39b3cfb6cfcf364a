//! FetchTarget — the identity of one remote archive.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::market::{DataKind, Interval, MarketType};

/// How much time one archive covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Monthly,
    Daily,
}

impl Granularity {
    pub fn as_str(self) -> &'static str {
        match self {
            Granularity::Monthly => "monthly",
            Granularity::Daily => "daily",
        }
    }
}

/// The period an archive covers. `Monthly` sorts before `Daily`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "granularity", rename_all = "snake_case")]
pub enum Period {
    Monthly { year: i32, month: u32 },
    Daily { date: NaiveDate },
}

impl Period {
    pub fn month_of(date: NaiveDate) -> Self {
        Period::Monthly {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn day(date: NaiveDate) -> Self {
        Period::Daily { date }
    }

    pub fn granularity(&self) -> Granularity {
        match self {
            Period::Monthly { .. } => Granularity::Monthly,
            Period::Daily { .. } => Granularity::Daily,
        }
    }

    /// `YYYY-MM` for monthly archives, `YYYY-MM-DD` for daily ones.
    pub fn key(&self) -> String {
        match self {
            Period::Monthly { year, month } => format!("{year:04}-{month:02}"),
            Period::Daily { date } => date.format("%Y-%m-%d").to_string(),
        }
    }
}

/// One archive to retrieve. Equality, hashing and ordering cover every field;
/// the field order below is the resolver's output order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FetchTarget {
    pub market: MarketType,
    pub kind: DataKind,
    pub symbol: String,
    /// Present only for kline-layout kinds.
    pub interval: Option<Interval>,
    pub period: Period,
}

impl FetchTarget {
    /// Symbols are upper-cased and the interval is dropped for kinds that
    /// are not published per interval.
    pub fn new(
        market: MarketType,
        kind: DataKind,
        symbol: &str,
        interval: Option<Interval>,
        period: Period,
    ) -> Self {
        Self {
            market,
            kind,
            symbol: symbol.trim().to_uppercase(),
            interval: if kind.has_interval() { interval } else { None },
            period,
        }
    }

    /// `BTCUSDT-1m-2020-04` or `BTCUSDT-aggTrades-2024-01-01`.
    pub fn file_stem(&self) -> String {
        let middle = match self.interval {
            Some(interval) => interval.as_str(),
            None => self.kind.as_str(),
        };
        format!("{}-{}-{}", self.symbol, middle, self.period.key())
    }

    pub fn file_name(&self) -> String {
        format!("{}.zip", self.file_stem())
    }

    /// Directory of the archive relative to the host root (and the cache root):
    /// `data/{market}/{granularity}/{kind}/{SYMBOL}[/{INTERVAL}]`.
    pub fn remote_dir(&self) -> String {
        let mut dir = format!(
            "data/{}/{}/{}/{}",
            self.market.remote_path(),
            self.period.granularity().as_str(),
            self.kind.as_str(),
            self.symbol
        );
        if let Some(interval) = self.interval {
            dir.push('/');
            dir.push_str(interval.as_str());
        }
        dir
    }

    pub fn url(&self, base_url: &str) -> String {
        format!(
            "{}/{}/{}",
            base_url.trim_end_matches('/'),
            self.remote_dir(),
            self.file_name()
        )
    }

    /// The checksum sidecar lives next to the archive with `.CHECKSUM` appended.
    pub fn checksum_url(&self, base_url: &str) -> String {
        format!("{}.CHECKSUM", self.url(base_url))
    }
}

impl fmt::Display for FetchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.market, self.kind, self.symbol)?;
        if let Some(interval) = self.interval {
            write!(f, "/{interval}")?;
        }
        write!(f, "/{}", self.period.key())
    }
}
