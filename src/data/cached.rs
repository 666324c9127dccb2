//! Caching decorator over any [`MarketDataProvider`].
//!
//! Snapshot, constituents and dividends responses are always cacheable;
//! OHLCV responses only for short windows (≤ 7 days), since long histories
//! are both large and unlikely to repeat within the TTL.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

use crate::error::ProviderError;

use super::cache::TtlCache;
use super::{
    DividendRecord, IndexConstituent, Interval, MarketDataProvider, OhlcvBar, SecuritySnapshot,
};

/// OHLCV windows at or below this many days go through the cache.
const CACHEABLE_OHLCV_DAYS: i64 = 7;

pub struct CachedProvider<P> {
    inner: P,
    cache: std::sync::Arc<TtlCache>,
}

impl<P> CachedProvider<P> {
    pub fn new(inner: P, ttl: Duration, max_size: usize) -> Self {
        Self {
            inner,
            cache: std::sync::Arc::new(TtlCache::new(ttl, max_size)),
        }
    }

    pub fn cache(&self) -> &TtlCache {
        &self.cache
    }

    /// Shared handle for surfacing hit/miss counters elsewhere.
    pub fn cache_handle(&self) -> std::sync::Arc<TtlCache> {
        std::sync::Arc::clone(&self.cache)
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.cache
            .get(key)
            .and_then(|v| serde_json::from_value(v).ok())
    }

    fn store<T: Serialize>(&self, key: String, value: &T) {
        if let Ok(v) = serde_json::to_value(value) {
            self.cache.insert(key, v);
        }
    }
}

#[async_trait]
impl<P: MarketDataProvider> MarketDataProvider for CachedProvider<P> {
    async fn snapshot(
        &self,
        ticker: &str,
        board: &str,
    ) -> Result<SecuritySnapshot, ProviderError> {
        let key = TtlCache::key("snapshot", &[ticker, board]);
        if let Some(hit) = self.lookup(&key) {
            return Ok(hit);
        }
        let snap = self.inner.snapshot(ticker, board).await?;
        self.store(key, &snap);
        Ok(snap)
    }

    async fn ohlcv(
        &self,
        ticker: &str,
        board: &str,
        from: NaiveDate,
        to: NaiveDate,
        interval: Interval,
    ) -> Result<Vec<OhlcvBar>, ProviderError> {
        let cacheable = (to - from).num_days() <= CACHEABLE_OHLCV_DAYS;
        let key = TtlCache::key(
            "ohlcv",
            &[
                ticker,
                board,
                &from.to_string(),
                &to.to_string(),
                &interval.iss_code().to_string(),
            ],
        );
        if cacheable {
            if let Some(hit) = self.lookup(&key) {
                return Ok(hit);
            }
        }
        let bars = self.inner.ohlcv(ticker, board, from, to, interval).await?;
        if cacheable {
            self.store(key, &bars);
        }
        Ok(bars)
    }

    async fn constituents(
        &self,
        index_ticker: &str,
        as_of: Option<NaiveDate>,
    ) -> Result<Vec<IndexConstituent>, ProviderError> {
        let as_of_part = as_of.map(|d| d.to_string()).unwrap_or_default();
        let key = TtlCache::key("constituents", &[index_ticker, &as_of_part]);
        if let Some(hit) = self.lookup(&key) {
            return Ok(hit);
        }
        let members = self.inner.constituents(index_ticker, as_of).await?;
        self.store(key, &members);
        Ok(members)
    }

    async fn dividends(
        &self,
        ticker: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DividendRecord>, ProviderError> {
        let key = TtlCache::key("dividends", &[ticker, &from.to_string(), &to.to_string()]);
        if let Some(hit) = self.lookup(&key) {
            return Ok(hit);
        }
        let records = self.inner.dividends(ticker, from, to).await?;
        self.store(key, &records);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixture::FixtureProvider;
    use super::*;

    fn dates() -> (NaiveDate, NaiveDate) {
        (
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 5).unwrap(),
        )
    }

    #[tokio::test]
    async fn repeated_snapshot_hits_upstream_once() {
        let (from, to) = dates();
        let fixture = FixtureProvider::seeded(&["SBER"], from, to);
        let cached = CachedProvider::new(fixture, Duration::from_secs(30), 16);

        let first = cached.snapshot("SBER", "TQBR").await.unwrap();
        let second = cached.snapshot("SBER", "TQBR").await.unwrap();

        assert_eq!(first.last_price, second.last_price);
        assert_eq!(cached.inner().upstream_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_refetches_after_ttl() {
        let (from, to) = dates();
        let fixture = FixtureProvider::seeded(&["SBER"], from, to);
        let cached = CachedProvider::new(fixture, Duration::from_secs(30), 16);

        cached.snapshot("SBER", "TQBR").await.unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;
        cached.snapshot("SBER", "TQBR").await.unwrap();

        assert_eq!(cached.inner().upstream_calls(), 2);
    }

    #[tokio::test]
    async fn short_ohlcv_window_is_cached_long_is_not() {
        let (from, to) = dates();
        let fixture = FixtureProvider::seeded(&["SBER"], from, to);
        let cached = CachedProvider::new(fixture, Duration::from_secs(30), 16);

        // 4-day window: cacheable
        cached
            .ohlcv("SBER", "TQBR", from, to, Interval::Daily)
            .await
            .unwrap();
        cached
            .ohlcv("SBER", "TQBR", from, to, Interval::Daily)
            .await
            .unwrap();
        assert_eq!(cached.inner().upstream_calls(), 1);

        // 30-day window: bypasses the cache
        let far_from = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        let fixture2 = FixtureProvider::seeded(&["SBER"], far_from, to);
        let cached2 = CachedProvider::new(fixture2, Duration::from_secs(30), 16);
        cached2
            .ohlcv("SBER", "TQBR", far_from, to, Interval::Daily)
            .await
            .unwrap();
        cached2
            .ohlcv("SBER", "TQBR", far_from, to, Interval::Daily)
            .await
            .unwrap();
        assert_eq!(cached2.inner().upstream_calls(), 2);
    }
}
