//! Decoded archive rows.
//!
//! One CSV line of an archive decodes into exactly one [`DataRow`] variant,
//! chosen by the [`RowLayout`] of the data kind. Numeric fields keep their
//! textual scale (`6407.10` stays `6407.10`) by using `Decimal` rather than
//! `f64`. Timestamps are milliseconds since the Unix epoch, UTC.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Timestamps at or above this value are microseconds, not milliseconds.
const MICROS_THRESHOLD: i64 = 1_000_000_000_000_000;

/// Column layout family of an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowLayout {
    Kline,
    Trade,
    AggTrade,
}

impl RowLayout {
    /// Field counts accepted for this layout. Futures trade files omit
    /// `isBestMatch`; spot aggTrade files carry it as an ignored eighth field.
    pub fn accepts_arity(self, n: usize) -> bool {
        match self {
            RowLayout::Kline => n == 12,
            RowLayout::Trade => n == 6 || n == 7,
            RowLayout::AggTrade => n == 7 || n == 8,
        }
    }

    /// Name of the column holding the row timestamp.
    pub fn time_column(self) -> &'static str {
        match self {
            RowLayout::Kline => "open_time",
            RowLayout::Trade => "time",
            RowLayout::AggTrade => "timestamp",
        }
    }

    /// Name of the column that, together with symbol (and interval for
    /// klines), uniquely identifies a row.
    pub fn id_column(self) -> &'static str {
        match self {
            RowLayout::Kline => "open_time",
            RowLayout::Trade => "trade_id",
            RowLayout::AggTrade => "agg_trade_id",
        }
    }
}

/// One candle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub close_time: i64,
    pub quote_volume: Decimal,
    pub trade_count: u64,
    pub taker_buy_base_volume: Decimal,
    pub taker_buy_quote_volume: Decimal,
}

/// One individual trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: u64,
    pub price: Decimal,
    pub quantity: Decimal,
    pub quote_quantity: Decimal,
    pub time: i64,
    pub is_buyer_maker: bool,
    /// Absent in futures trade files.
    pub is_best_match: Option<bool>,
}

/// One aggregated trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggTrade {
    pub agg_trade_id: u64,
    pub price: Decimal,
    pub quantity: Decimal,
    pub first_trade_id: u64,
    pub last_trade_id: u64,
    pub timestamp: i64,
    pub is_buyer_maker: bool,
}

/// A decoded archive row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "layout", rename_all = "snake_case")]
pub enum DataRow {
    Kline(Kline),
    Trade(Trade),
    AggTrade(AggTrade),
}

/// Why a single CSV line could not become a row. Row-level only: the
/// extractor drops the line and keeps going.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("expected {layout:?} row, got {found} fields")]
    Arity { layout: RowLayout, found: usize },

    #[error("field '{field}': cannot parse '{value}' as {ty}")]
    Field {
        field: &'static str,
        value: String,
        ty: &'static str,
    },

    #[error("open_time {open_time} is not before close_time {close_time}")]
    TimeOrder { open_time: i64, close_time: i64 },

    #[error("id {current} goes backwards (previous {previous})")]
    IdRegression { previous: i64, current: i64 },
}

impl DataRow {
    pub fn layout(&self) -> RowLayout {
        match self {
            DataRow::Kline(_) => RowLayout::Kline,
            DataRow::Trade(_) => RowLayout::Trade,
            DataRow::AggTrade(_) => RowLayout::AggTrade,
        }
    }

    /// Row timestamp in milliseconds.
    pub fn time_ms(&self) -> i64 {
        match self {
            DataRow::Kline(k) => k.open_time,
            DataRow::Trade(t) => t.time,
            DataRow::AggTrade(a) => a.timestamp,
        }
    }

    /// The per-symbol identity of the row (open time for klines).
    pub fn natural_id(&self) -> i64 {
        match self {
            DataRow::Kline(k) => k.open_time,
            DataRow::Trade(t) => t.trade_id as i64,
            DataRow::AggTrade(a) => a.agg_trade_id as i64,
        }
    }

    /// Decode one CSV record according to `layout`.
    pub fn decode(layout: RowLayout, record: &csv::StringRecord) -> Result<DataRow, DecodeError> {
        if !layout.accepts_arity(record.len()) {
            return Err(DecodeError::Arity {
                layout,
                found: record.len(),
            });
        }
        let f = |i: usize| record.get(i).unwrap_or("").trim();

        match layout {
            RowLayout::Kline => {
                let kline = Kline {
                    open_time: parse_timestamp("open_time", f(0))?,
                    open: parse_decimal("open", f(1))?,
                    high: parse_decimal("high", f(2))?,
                    low: parse_decimal("low", f(3))?,
                    close: parse_decimal("close", f(4))?,
                    volume: parse_decimal("volume", f(5))?,
                    close_time: parse_timestamp("close_time", f(6))?,
                    quote_volume: parse_decimal("quote_volume", f(7))?,
                    trade_count: parse_u64("trade_count", f(8))?,
                    taker_buy_base_volume: parse_decimal("taker_buy_base_volume", f(9))?,
                    taker_buy_quote_volume: parse_decimal("taker_buy_quote_volume", f(10))?,
                };
                if kline.open_time >= kline.close_time {
                    return Err(DecodeError::TimeOrder {
                        open_time: kline.open_time,
                        close_time: kline.close_time,
                    });
                }
                Ok(DataRow::Kline(kline))
            }
            RowLayout::Trade => Ok(DataRow::Trade(Trade {
                trade_id: parse_u64("trade_id", f(0))?,
                price: parse_decimal("price", f(1))?,
                quantity: parse_decimal("quantity", f(2))?,
                quote_quantity: parse_decimal("quote_quantity", f(3))?,
                time: parse_timestamp("time", f(4))?,
                is_buyer_maker: parse_bool("is_buyer_maker", f(5))?,
                is_best_match: if record.len() == 7 {
                    Some(parse_bool("is_best_match", f(6))?)
                } else {
                    None
                },
            })),
            RowLayout::AggTrade => Ok(DataRow::AggTrade(AggTrade {
                agg_trade_id: parse_u64("agg_trade_id", f(0))?,
                price: parse_decimal("price", f(1))?,
                quantity: parse_decimal("quantity", f(2))?,
                first_trade_id: parse_u64("first_trade_id", f(3))?,
                last_trade_id: parse_u64("last_trade_id", f(4))?,
                timestamp: parse_timestamp("timestamp", f(5))?,
                is_buyer_maker: parse_bool("is_buyer_maker", f(6))?,
            })),
        }
    }

    /// Encode back to the archive's CSV field list. The kline `ignore`
    /// column is written as `0`.
    pub fn to_record(&self) -> Vec<String> {
        match self {
            DataRow::Kline(k) => vec![
                k.open_time.to_string(),
                k.open.to_string(),
                k.high.to_string(),
                k.low.to_string(),
                k.close.to_string(),
                k.volume.to_string(),
                k.close_time.to_string(),
                k.quote_volume.to_string(),
                k.trade_count.to_string(),
                k.taker_buy_base_volume.to_string(),
                k.taker_buy_quote_volume.to_string(),
                "0".to_string(),
            ],
            DataRow::Trade(t) => {
                let mut fields = vec![
                    t.trade_id.to_string(),
                    t.price.to_string(),
                    t.quantity.to_string(),
                    t.quote_quantity.to_string(),
                    t.time.to_string(),
                    t.is_buyer_maker.to_string(),
                ];
                if let Some(best) = t.is_best_match {
                    fields.push(best.to_string());
                }
                fields
            }
            DataRow::AggTrade(a) => vec![
                a.agg_trade_id.to_string(),
                a.price.to_string(),
                a.quantity.to_string(),
                a.first_trade_id.to_string(),
                a.last_trade_id.to_string(),
                a.timestamp.to_string(),
                a.is_buyer_maker.to_string(),
            ],
        }
    }
}

fn field_error(field: &'static str, value: &str, ty: &'static str) -> DecodeError {
    DecodeError::Field {
        field,
        value: value.to_string(),
        ty,
    }
}

fn parse_decimal(field: &'static str, s: &str) -> Result<Decimal, DecodeError> {
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .map_err(|_| field_error(field, s, "decimal"))
}

fn parse_u64(field: &'static str, s: &str) -> Result<u64, DecodeError> {
    s.parse::<u64>().map_err(|_| field_error(field, s, "unsigned integer"))
}

/// Millisecond timestamp; microsecond values are scaled down.
fn parse_timestamp(field: &'static str, s: &str) -> Result<i64, DecodeError> {
    let raw = s
        .parse::<i64>()
        .map_err(|_| field_error(field, s, "timestamp"))?;
    if raw < 0 {
        return Err(field_error(field, s, "timestamp"));
    }
    Ok(normalize_timestamp(raw))
}

pub fn normalize_timestamp(raw: i64) -> i64 {
    if raw >= MICROS_THRESHOLD {
        raw / 1_000
    } else {
        raw
    }
}

/// Spot files write `True`/`False`, futures files `true`/`false`.
fn parse_bool(field: &'static str, s: &str) -> Result<bool, DecodeError> {
    if s.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if s.eq_ignore_ascii_case("false") {
        Ok(false)
    } else {
        Err(field_error(field, s, "boolean"))
    }
}
