//! Market, data kind and interval enumerations.
//!
//! Each enum knows its upstream spelling (used verbatim in archive URLs and
//! file names) and which combinations the data provider actually publishes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::row::RowLayout;

/// A string did not name a known market, data kind or interval.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized {what}: '{value}'")]
pub struct ParseEnumError {
    pub what: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}

/// Which market an archive belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MarketType {
    Spot,
    UsdMFutures,
    CoinMFutures,
}

impl MarketType {
    pub const ALL: [MarketType; 3] = [
        MarketType::Spot,
        MarketType::UsdMFutures,
        MarketType::CoinMFutures,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MarketType::Spot => "spot",
            MarketType::UsdMFutures => "usd-m-futures",
            MarketType::CoinMFutures => "coin-m-futures",
        }
    }

    /// Path segment under `/data/` on the bulk-data host.
    pub fn remote_path(self) -> &'static str {
        match self {
            MarketType::Spot => "spot",
            MarketType::UsdMFutures => "futures/um",
            MarketType::CoinMFutures => "futures/cm",
        }
    }

    /// Short prefix used for destination table names.
    pub fn table_prefix(self) -> &'static str {
        match self {
            MarketType::Spot => "spot",
            MarketType::UsdMFutures => "um",
            MarketType::CoinMFutures => "cm",
        }
    }

    pub fn is_futures(self) -> bool {
        !matches!(self, MarketType::Spot)
    }
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarketType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "spot" => Ok(MarketType::Spot),
            "usd-m-futures" | "um" | "usdm" => Ok(MarketType::UsdMFutures),
            "coin-m-futures" | "cm" | "coinm" => Ok(MarketType::CoinMFutures),
            _ => Err(ParseEnumError::new("market type", s)),
        }
    }
}

/// Which family of archive to fetch.
///
/// The mark/index/premium kline kinds are only published for futures markets
/// and share the 12-column kline layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DataKind {
    Klines,
    Trades,
    AggTrades,
    MarkPriceKlines,
    IndexPriceKlines,
    PremiumIndexKlines,
}

impl DataKind {
    pub const ALL: [DataKind; 6] = [
        DataKind::Klines,
        DataKind::Trades,
        DataKind::AggTrades,
        DataKind::MarkPriceKlines,
        DataKind::IndexPriceKlines,
        DataKind::PremiumIndexKlines,
    ];

    /// Upstream spelling, used in URLs and archive names.
    pub fn as_str(self) -> &'static str {
        match self {
            DataKind::Klines => "klines",
            DataKind::Trades => "trades",
            DataKind::AggTrades => "aggTrades",
            DataKind::MarkPriceKlines => "markPriceKlines",
            DataKind::IndexPriceKlines => "indexPriceKlines",
            DataKind::PremiumIndexKlines => "premiumIndexKlines",
        }
    }

    /// Suffix of the destination table name.
    pub fn table_suffix(self) -> &'static str {
        match self {
            DataKind::Klines => "klines",
            DataKind::Trades => "trades",
            DataKind::AggTrades => "agg_trades",
            DataKind::MarkPriceKlines => "mark_price_klines",
            DataKind::IndexPriceKlines => "index_price_klines",
            DataKind::PremiumIndexKlines => "premium_index_klines",
        }
    }

    pub fn layout(self) -> RowLayout {
        match self {
            DataKind::Trades => RowLayout::Trade,
            DataKind::AggTrades => RowLayout::AggTrade,
            DataKind::Klines
            | DataKind::MarkPriceKlines
            | DataKind::IndexPriceKlines
            | DataKind::PremiumIndexKlines => RowLayout::Kline,
        }
    }

    /// Kline-layout kinds are published per interval; trade kinds are not.
    pub fn has_interval(self) -> bool {
        self.layout() == RowLayout::Kline
    }

    pub fn futures_only(self) -> bool {
        matches!(
            self,
            DataKind::MarkPriceKlines | DataKind::IndexPriceKlines | DataKind::PremiumIndexKlines
        )
    }

    pub fn available_on(self, market: MarketType) -> bool {
        !self.futures_only() || market.is_futures()
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        // accept both the upstream camelCase and the snake_case table spelling
        DataKind::ALL
            .into_iter()
            .find(|k| {
                k.as_str().eq_ignore_ascii_case(wanted) || k.table_suffix() == wanted
            })
            .ok_or_else(|| ParseEnumError::new("data kind", s))
    }
}

/// Candle interval. Variants are declared in ascending duration, so the
/// derived ordering sorts `1m` before `1h` before `1d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1s")]
    S1,
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "2h")]
    H2,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "6h")]
    H6,
    #[serde(rename = "8h")]
    H8,
    #[serde(rename = "12h")]
    H12,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "3d")]
    D3,
    #[serde(rename = "1w")]
    W1,
    #[serde(rename = "1mo")]
    Mo1,
}

impl Interval {
    pub const ALL: [Interval; 16] = [
        Interval::S1,
        Interval::M1,
        Interval::M3,
        Interval::M5,
        Interval::M15,
        Interval::M30,
        Interval::H1,
        Interval::H2,
        Interval::H4,
        Interval::H6,
        Interval::H8,
        Interval::H12,
        Interval::D1,
        Interval::D3,
        Interval::W1,
        Interval::Mo1,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Interval::S1 => "1s",
            Interval::M1 => "1m",
            Interval::M3 => "3m",
            Interval::M5 => "5m",
            Interval::M15 => "15m",
            Interval::M30 => "30m",
            Interval::H1 => "1h",
            Interval::H2 => "2h",
            Interval::H4 => "4h",
            Interval::H6 => "6h",
            Interval::H8 => "8h",
            Interval::H12 => "12h",
            Interval::D1 => "1d",
            Interval::D3 => "3d",
            Interval::W1 => "1w",
            Interval::Mo1 => "1mo",
        }
    }

    /// Whether the provider publishes this interval for the market/kind pair.
    /// Second candles only exist for spot klines.
    pub fn available_for(self, market: MarketType, kind: DataKind) -> bool {
        if !kind.has_interval() {
            return false;
        }
        match self {
            Interval::S1 => market == MarketType::Spot && kind == DataKind::Klines,
            _ => true,
        }
    }

    /// All intervals published for the market/kind pair, ascending.
    pub fn published(market: MarketType, kind: DataKind) -> Vec<Interval> {
        Interval::ALL
            .into_iter()
            .filter(|i| i.available_for(market, kind))
            .collect()
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Interval::ALL
            .into_iter()
            .find(|i| i.as_str() == wanted)
            .ok_or_else(|| ParseEnumError::new("interval", s))
    }
}
