//! Range resolution — turns a partially specified selection into the exact,
//! ordered list of archives to fetch.
//!
//! Pure: no I/O, no clock. `today` is passed in so results are reproducible.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{debug, warn};

use super::catalog::SymbolCatalog;
use crate::domain::{DataKind, FetchTarget, Interval, MarketType, Period};

/// First day of the default daily range.
pub fn default_start_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 1, 1).unwrap_or(NaiveDate::MIN)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("invalid range: {0}")]
    InvalidRange(String),
}

/// Selection criteria for one run. Empty sets mean "everything".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub market: MarketType,
    pub kind: DataKind,
    #[serde(default)]
    pub symbols: BTreeSet<String>,
    #[serde(default)]
    pub intervals: BTreeSet<Interval>,
    #[serde(default)]
    pub years: BTreeSet<i32>,
    #[serde(default)]
    pub months: BTreeSet<u32>,
    /// When non-empty, the only days fetched; overrides years, months and the range.
    #[serde(default)]
    pub dates: BTreeSet<NaiveDate>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub skip_monthly: bool,
    #[serde(default)]
    pub skip_daily: bool,
}

impl Selection {
    pub fn new(market: MarketType, kind: DataKind) -> Self {
        Self {
            market,
            kind,
            symbols: BTreeSet::new(),
            intervals: BTreeSet::new(),
            years: BTreeSet::new(),
            months: BTreeSet::new(),
            dates: BTreeSet::new(),
            start_date: None,
            end_date: None,
            skip_monthly: false,
            skip_daily: false,
        }
    }

    pub fn with_symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.symbols = symbols
            .into_iter()
            .map(|s| s.as_ref().trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        self
    }

    pub fn with_intervals(mut self, intervals: impl IntoIterator<Item = Interval>) -> Self {
        self.intervals = intervals.into_iter().collect();
        self
    }

    pub fn with_years(mut self, years: impl IntoIterator<Item = i32>) -> Self {
        self.years = years.into_iter().collect();
        self
    }

    pub fn with_months(mut self, months: impl IntoIterator<Item = u32>) -> Self {
        self.months = months.into_iter().collect();
        self
    }

    pub fn with_dates(mut self, dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        self.dates = dates.into_iter().collect();
        self
    }

    pub fn with_range(mut self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        self.start_date = start;
        self.end_date = end;
        self
    }

    pub fn skip_monthly(mut self, skip: bool) -> Self {
        self.skip_monthly = skip;
        self
    }

    pub fn skip_daily(mut self, skip: bool) -> Self {
        self.skip_daily = skip;
        self
    }

    /// The daily range after defaults are applied.
    pub fn effective_range(&self, today: NaiveDate) -> (NaiveDate, NaiveDate) {
        (
            self.start_date.unwrap_or_else(default_start_date),
            self.end_date.unwrap_or(today),
        )
    }

    fn validate(&self, today: NaiveDate) -> Result<(), ResolveError> {
        let invalid = |msg: String| Err(ResolveError::InvalidRange(msg));

        if self.skip_monthly && self.skip_daily {
            return invalid("both monthly and daily archives are skipped; nothing to fetch".into());
        }
        if !self.kind.available_on(self.market) {
            return invalid(format!(
                "{} archives are not published for the {} market",
                self.kind, self.market
            ));
        }
        let (start, end) = self.effective_range(today);
        if start > end {
            return invalid(format!("start date {start} is after end date {end}"));
        }
        if let Some(bad) = self.months.iter().find(|m| !(1..=12).contains(*m)) {
            return invalid(format!("month {bad} is outside 1..=12"));
        }
        if self.kind.has_interval() {
            if let Some(bad) = self
                .intervals
                .iter()
                .find(|i| !i.available_for(self.market, self.kind))
            {
                return invalid(format!(
                    "interval {bad} is not published for {} {}",
                    self.market, self.kind
                ));
            }
        }
        Ok(())
    }

    fn periods(&self, today: NaiveDate) -> BTreeSet<Period> {
        let mut periods = BTreeSet::new();

        if !self.dates.is_empty() {
            for &date in &self.dates {
                if !self.skip_monthly {
                    periods.insert(Period::month_of(date));
                }
                if !self.skip_daily {
                    periods.insert(Period::day(date));
                }
            }
            return periods;
        }

        let (start, end) = self.effective_range(today);

        if !self.skip_monthly {
            let month_wanted = |m: u32| self.months.is_empty() || self.months.contains(&m);
            if self.years.is_empty() {
                for (year, month) in months_spanned(start, end) {
                    if month_wanted(month) {
                        periods.insert(Period::Monthly { year, month });
                    }
                }
            } else {
                for &year in &self.years {
                    for month in (1..=12).filter(|m| month_wanted(*m)) {
                        periods.insert(Period::Monthly { year, month });
                    }
                }
            }
        }

        if !self.skip_daily {
            for date in start.iter_days().take_while(|d| *d <= end) {
                periods.insert(Period::day(date));
            }
        }

        periods
    }
}

/// Every (year, month) touched by `[start, end]`, ascending.
fn months_spanned(start: NaiveDate, end: NaiveDate) -> Vec<(i32, u32)> {
    let mut out = Vec::new();
    let (mut year, mut month) = (start.year(), start.month());
    while (year, month) <= (end.year(), end.month()) {
        out.push((year, month));
        if month == 12 {
            year += 1;
            month = 1;
        } else {
            month += 1;
        }
    }
    out
}

/// Resolve a selection into the deduplicated fetch targets, ordered by symbol,
/// then interval, then period (monthly archives before daily ones).
pub fn resolve(
    selection: &Selection,
    catalog: &SymbolCatalog,
    today: NaiveDate,
) -> Result<Vec<FetchTarget>, ResolveError> {
    selection.validate(today)?;

    let symbols: Vec<String> = if selection.symbols.is_empty() {
        catalog.symbols(selection.market)
    } else {
        selection.symbols.iter().cloned().collect()
    };
    if symbols.is_empty() {
        warn!(market = %selection.market, "no symbols selected and none in the catalog");
    }

    let intervals: Vec<Option<Interval>> = if !selection.kind.has_interval() {
        if !selection.intervals.is_empty() {
            warn!(
                kind = %selection.kind,
                "intervals ignored: archives of this kind are not split by interval"
            );
        }
        vec![None]
    } else if selection.intervals.is_empty() {
        Interval::published(selection.market, selection.kind)
            .into_iter()
            .map(Some)
            .collect()
    } else {
        selection.intervals.iter().copied().map(Some).collect()
    };

    let periods = selection.periods(today);

    let mut targets = BTreeSet::new();
    for symbol in &symbols {
        for &interval in &intervals {
            for &period in &periods {
                targets.insert(FetchTarget::new(
                    selection.market,
                    selection.kind,
                    symbol,
                    interval,
                    period,
                ));
            }
        }
    }

    debug!(
        symbols = symbols.len(),
        intervals = intervals.len(),
        periods = periods.len(),
        targets = targets.len(),
        "selection resolved"
    );
    Ok(targets.into_iter().collect())
}
