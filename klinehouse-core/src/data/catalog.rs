//! Symbol catalog — the symbols to use per market when a selection names none.
//!
//! Stored as a TOML document with one list per market:
//!
//! ```toml
//! spot = ["BTCUSDT", "ETHUSDT"]
//! usd-m-futures = ["BTCUSDT"]
//! coin-m-futures = ["BTCUSD_PERP"]
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::domain::MarketType;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SymbolCatalog {
    #[serde(default)]
    pub spot: Vec<String>,
    #[serde(default)]
    pub usd_m_futures: Vec<String>,
    #[serde(default)]
    pub coin_m_futures: Vec<String>,
}

impl SymbolCatalog {
    /// Load a catalog from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content =
            std::fs::read_to_string(path).map_err(|e| format!("read catalog file: {e}"))?;
        Self::from_toml(&content)
    }

    /// Parse a catalog from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| format!("parse catalog TOML: {e}"))
    }

    pub fn to_toml(&self) -> Result<String, String> {
        toml::to_string_pretty(self).map_err(|e| format!("serialize catalog: {e}"))
    }

    /// Symbols listed for a market, upper-cased, in file order.
    pub fn symbols(&self, market: MarketType) -> Vec<String> {
        let list = match market {
            MarketType::Spot => &self.spot,
            MarketType::UsdMFutures => &self.usd_m_futures,
            MarketType::CoinMFutures => &self.coin_m_futures,
        };
        list.iter().map(|s| s.trim().to_uppercase()).collect()
    }

    pub fn symbol_count(&self) -> usize {
        self.spot.len() + self.usd_m_futures.len() + self.coin_m_futures.len()
    }

    /// A small built-in catalog of the most liquid pairs.
    pub fn default_catalog() -> Self {
        let list = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            spot: list(&["BTCUSDT", "ETHUSDT", "BNBUSDT", "SOLUSDT", "XRPUSDT"]),
            usd_m_futures: list(&["BTCUSDT", "ETHUSDT", "BNBUSDT", "SOLUSDT"]),
            coin_m_futures: list(&["BTCUSD_PERP", "ETHUSD_PERP"]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalog_covers_every_market() {
        let c = SymbolCatalog::default_catalog();
        for market in MarketType::ALL {
            assert!(!c.symbols(market).is_empty(), "{market} has no symbols");
        }
    }

    #[test]
    fn toml_roundtrip() {
        let c = SymbolCatalog::default_catalog();
        let parsed = SymbolCatalog::from_toml(&c.to_toml().unwrap()).unwrap();
        assert_eq!(c, parsed);
    }

    #[test]
    fn missing_markets_default_to_empty_and_symbols_are_uppercased() {
        let c = SymbolCatalog::from_toml("spot = [\"btcusdt\"]").unwrap();
        assert_eq!(c.symbols(MarketType::Spot), vec!["BTCUSDT".to_string()]);
        assert!(c.symbols(MarketType::CoinMFutures).is_empty());
        assert_eq!(c.symbol_count(), 1);
    }
}
