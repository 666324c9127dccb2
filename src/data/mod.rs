//! Typed access to MOEX ISS market data.
//!
//! The [`MarketDataProvider`] trait is the seam between the risk tools and
//! the outside world: production uses [`iss::IssProvider`], tests and the
//! offline dev profile use [`fixture::FixtureProvider`].

pub mod cache;
pub mod cached;
pub mod fixture;
pub mod iss;
pub mod rate_limit;

use async_trait::async_trait;
use chrono::NaiveDate;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// Default trading board for MOEX equities.
pub const DEFAULT_BOARD: &str = "TQBR";

/// Candle interval supported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum Interval {
    #[serde(rename = "1d")]
    Daily,
    #[serde(rename = "1h")]
    Hourly,
}

impl Interval {
    /// ISS candle interval code (24 = daily, 60 = hourly).
    pub fn iss_code(self) -> u32 {
        match self {
            Self::Daily => 24,
            Self::Hourly => 60,
        }
    }
}

/// Point-in-time quote for a single security.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SecuritySnapshot {
    pub ticker: String,
    pub board: String,
    pub short_name: String,
    pub last_price: f64,
    pub prev_close: f64,
    pub change_pct: f64,
    pub volume: f64,
    pub currency: String,
}

/// Daily (or hourly) market bar. Bars in a series are strictly ordered by
/// date; non-trading days are simply absent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OhlcvBar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// One member of an index basket.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct IndexConstituent {
    pub ticker: String,
    pub short_name: String,
    pub weight_pct: f64,
}

/// A single dividend payment record.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DividendRecord {
    pub ticker: String,
    pub registry_close_date: NaiveDate,
    pub value: f64,
    pub currency: String,
}

/// Market-data operations the risk tools consume.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn snapshot(&self, ticker: &str, board: &str)
        -> Result<SecuritySnapshot, ProviderError>;

    async fn ohlcv(
        &self,
        ticker: &str,
        board: &str,
        from: NaiveDate,
        to: NaiveDate,
        interval: Interval,
    ) -> Result<Vec<OhlcvBar>, ProviderError>;

    async fn constituents(
        &self,
        index_ticker: &str,
        as_of: Option<NaiveDate>,
    ) -> Result<Vec<IndexConstituent>, ProviderError>;

    async fn dividends(
        &self,
        ticker: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DividendRecord>, ProviderError>;
}

/// Reject windows longer than the configured lookback before any request
/// goes upstream.
pub fn check_lookback(
    from: NaiveDate,
    to: NaiveDate,
    max_days: i64,
) -> Result<(), ProviderError> {
    let days = (to - from).num_days();
    if days < 0 {
        return Err(ProviderError::InvalidTicker(format!(
            "empty window: {from} > {to}"
        )));
    }
    if days > max_days {
        return Err(ProviderError::DateRangeTooLarge {
            days,
            max: max_days,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_codes() {
        assert_eq!(Interval::Daily.iss_code(), 24);
        assert_eq!(Interval::Hourly.iss_code(), 60);
    }

    #[test]
    fn lookback_guard() {
        let from = NaiveDate::from_ymd_opt(2018, 1, 1).unwrap();
        let to = NaiveDate::from_ymd_opt(2024, 12, 31).unwrap();
        let err = check_lookback(from, to, 730).unwrap_err();
        assert!(matches!(err, ProviderError::DateRangeTooLarge { .. }));

        let to_ok = NaiveDate::from_ymd_opt(2019, 12, 31).unwrap();
        assert!(check_lookback(from, to_ok, 730).is_ok());
    }
}
