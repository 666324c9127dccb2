//! Deterministic in-memory market-data provider.
//!
//! Backs tests and the offline dev profile. Price paths are synthesised
//! from a per-ticker seed so the same (ticker, window) always yields the
//! same series without touching the network.

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Weekday};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::ProviderError;

use super::{
    check_lookback, DividendRecord, IndexConstituent, Interval, MarketDataProvider, OhlcvBar,
    SecuritySnapshot,
};

pub struct FixtureProvider {
    series: HashMap<String, Vec<OhlcvBar>>,
    constituents: HashMap<String, Vec<IndexConstituent>>,
    dividends: HashMap<String, Vec<DividendRecord>>,
    max_lookback_days: i64,
    upstream_calls: AtomicU64,
}

impl FixtureProvider {
    pub fn new() -> Self {
        Self {
            series: HashMap::new(),
            constituents: HashMap::new(),
            dividends: HashMap::new(),
            max_lookback_days: 730,
            upstream_calls: AtomicU64::new(0),
        }
    }

    /// Deterministic provider with a synthetic daily series per ticker
    /// over `[from, to]` (weekdays only).
    pub fn seeded(tickers: &[&str], from: NaiveDate, to: NaiveDate) -> Self {
        let mut fixture = Self::new();
        for ticker in tickers {
            fixture
                .series
                .insert(ticker.to_uppercase(), synth_series(ticker, from, to));
        }
        fixture
    }

    pub fn with_series(mut self, ticker: &str, bars: Vec<OhlcvBar>) -> Self {
        self.series.insert(ticker.to_uppercase(), bars);
        self
    }

    pub fn with_constituents(mut self, index: &str, members: Vec<IndexConstituent>) -> Self {
        self.constituents.insert(index.to_uppercase(), members);
        self
    }

    pub fn with_dividends(mut self, ticker: &str, records: Vec<DividendRecord>) -> Self {
        self.dividends.insert(ticker.to_uppercase(), records);
        self
    }

    /// Number of calls that reached this (pretend) upstream.
    pub fn upstream_calls(&self) -> u64 {
        self.upstream_calls.load(Ordering::Relaxed)
    }

    fn record_call(&self) {
        self.upstream_calls.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for FixtureProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Small stable hash for per-ticker seeds.
fn ticker_seed(ticker: &str) -> u64 {
    ticker
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325u64, |acc, b| {
            (acc ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
        })
}

/// Synthetic but plausible daily bars: a drifting sine path whose
/// amplitude, frequency and base price derive from the ticker seed.
fn synth_series(ticker: &str, from: NaiveDate, to: NaiveDate) -> Vec<OhlcvBar> {
    let seed = ticker_seed(ticker);
    let base = 50.0 + (seed % 400) as f64;
    let amplitude = 0.004 + (seed % 17) as f64 * 0.0008;
    let freq = 0.08 + (seed % 11) as f64 * 0.015;
    let drift = ((seed % 7) as f64 - 3.0) * 2e-4;

    let mut bars = Vec::new();
    let mut date = from;
    let mut close = base;
    let mut t = 0.0f64;
    while date <= to {
        if !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
            let ret = drift + amplitude * (t * freq).sin();
            let open = close;
            close *= 1.0 + ret;
            let high = open.max(close) * 1.002;
            let low = open.min(close) * 0.998;
            bars.push(OhlcvBar {
                date,
                open,
                high,
                low,
                close,
                volume: 1_000_000.0 + (seed % 1000) as f64 * 1000.0,
            });
            t += 1.0;
        }
        date = date.succ_opt().expect("date overflow");
    }
    bars
}

#[async_trait]
impl MarketDataProvider for FixtureProvider {
    async fn snapshot(
        &self,
        ticker: &str,
        board: &str,
    ) -> Result<SecuritySnapshot, ProviderError> {
        self.record_call();
        let ticker = ticker.to_uppercase();
        let bars = self
            .series
            .get(&ticker)
            .ok_or_else(|| ProviderError::InvalidTicker(ticker.clone()))?;
        let last = bars
            .last()
            .ok_or_else(|| ProviderError::InvalidTicker(ticker.clone()))?;
        let prev_close = if bars.len() >= 2 {
            bars[bars.len() - 2].close
        } else {
            last.open
        };
        let change_pct = if prev_close > 0.0 {
            (last.close - prev_close) / prev_close * 100.0
        } else {
            0.0
        };
        Ok(SecuritySnapshot {
            short_name: ticker.clone(),
            ticker,
            board: board.to_string(),
            last_price: last.close,
            prev_close,
            change_pct,
            volume: last.volume,
            currency: "SUR".to_string(),
        })
    }

    async fn ohlcv(
        &self,
        ticker: &str,
        _board: &str,
        from: NaiveDate,
        to: NaiveDate,
        _interval: Interval,
    ) -> Result<Vec<OhlcvBar>, ProviderError> {
        self.record_call();
        check_lookback(from, to, self.max_lookback_days)?;
        let ticker = ticker.to_uppercase();
        let bars = self
            .series
            .get(&ticker)
            .ok_or_else(|| ProviderError::InvalidTicker(ticker.clone()))?;
        Ok(bars
            .iter()
            .filter(|b| b.date >= from && b.date <= to)
            .copied()
            .collect())
    }

    async fn constituents(
        &self,
        index_ticker: &str,
        _as_of: Option<NaiveDate>,
    ) -> Result<Vec<IndexConstituent>, ProviderError> {
        self.record_call();
        let index = index_ticker.to_uppercase();
        self.constituents
            .get(&index)
            .cloned()
            .ok_or(ProviderError::InvalidTicker(index))
    }

    async fn dividends(
        &self,
        ticker: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DividendRecord>, ProviderError> {
        self.record_call();
        check_lookback(from, to, self.max_lookback_days)?;
        let ticker = ticker.to_uppercase();
        Ok(self
            .dividends
            .get(&ticker)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.registry_close_date >= from && r.registry_close_date <= to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seeded_series_is_deterministic() {
        let from = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let to = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        let a = FixtureProvider::seeded(&["SBER", "GAZP"], from, to);
        let b = FixtureProvider::seeded(&["SBER", "GAZP"], from, to);

        let bars_a = a.ohlcv("SBER", "TQBR", from, to, Interval::Daily).await.unwrap();
        let bars_b = b.ohlcv("SBER", "TQBR", from, to, Interval::Daily).await.unwrap();
        assert_eq!(bars_a, bars_b);
        assert!(!bars_a.is_empty());

        // Different tickers get different paths
        let gazp = a.ohlcv("GAZP", "TQBR", from, to, Interval::Daily).await.unwrap();
        assert_ne!(bars_a[0].close, gazp[0].close);
    }

    #[tokio::test]
    async fn weekends_excluded() {
        let from = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let to = NaiveDate::from_ymd_opt(2024, 1, 14).unwrap();
        let fixture = FixtureProvider::seeded(&["SBER"], from, to);
        let bars = fixture
            .ohlcv("SBER", "TQBR", from, to, Interval::Daily)
            .await
            .unwrap();
        assert!(bars
            .iter()
            .all(|b| !matches!(b.date.weekday(), Weekday::Sat | Weekday::Sun)));
        assert_eq!(bars.len(), 10);
    }

    #[tokio::test]
    async fn unknown_ticker_is_invalid() {
        let from = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let to = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        let fixture = FixtureProvider::seeded(&["SBER"], from, to);
        let err = fixture
            .ohlcv("ZZZZ", "TQBR", from, to, Interval::Daily)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidTicker(_)));
    }
}
