//! MOEX ISS HTTP provider.
//!
//! ISS responses are blocks of `{"columns": [...], "data": [[...]]}` tables.
//! Decoding goes through [`Table`], so each operation is a thin pure parse
//! function over the generic fetch path. Key policies:
//!
//! - **Rate limiting** — process-wide token bucket, callers block.
//! - **Retries** — up to 3 attempts on network errors and HTTP 5xx with
//!   exponential backoff (base 200 ms, jitter ±50%). 4xx never retries.
//!
//! TTL caching is layered on top by [`super::cached::CachedProvider`].

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use rand::Rng;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;

use crate::config::ProviderConfig;
use crate::error::ProviderError;

use super::rate_limit::TokenBucket;
use super::{
    check_lookback, DividendRecord, IndexConstituent, Interval, MarketDataProvider, OhlcvBar,
    SecuritySnapshot,
};

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 200;
/// ISS pages candle responses at 500 rows.
const CANDLE_PAGE_LIMIT: usize = 500;
const MAX_CANDLE_PAGES: usize = 40;

pub struct IssProvider {
    client: Client,
    cfg: ProviderConfig,
    bucket: TokenBucket,
}

impl IssProvider {
    pub fn new(cfg: ProviderConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        Ok(Self {
            bucket: TokenBucket::new(cfg.rate_limit_rps),
            client,
            cfg,
        })
    }

    pub fn from_env() -> Result<Self, ProviderError> {
        Self::new(ProviderConfig::from_env())
    }

    /// Rate-limited GET with retry on transient errors.
    async fn get_json(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<Value, ProviderError> {
        let url = format!("{}{path}", self.cfg.base_url.trim_end_matches('/'));

        for attempt in 0..MAX_ATTEMPTS {
            self.bucket.acquire().await;

            let resp = match self.client.get(&url).query(query).send().await {
                Ok(r) => r,
                Err(e) => {
                    if attempt + 1 == MAX_ATTEMPTS {
                        return Err(if e.is_timeout() {
                            ProviderError::Timeout(path.to_string())
                        } else {
                            ProviderError::Network(e.to_string())
                        });
                    }
                    backoff(attempt).await;
                    continue;
                }
            };

            let status = resp.status().as_u16();

            if status >= 500 {
                if attempt + 1 == MAX_ATTEMPTS {
                    return Err(ProviderError::Upstream {
                        status,
                        message: format!("ISS server error on {path}"),
                    });
                }
                tracing::warn!(
                    "ISS {status} on {path}, retrying (attempt {}/{MAX_ATTEMPTS})",
                    attempt + 1
                );
                backoff(attempt).await;
                continue;
            }

            return match status {
                429 => Err(ProviderError::RateLimit),
                400 | 404 => Err(ProviderError::InvalidTicker(path.to_string())),
                s if !(200..300).contains(&s) => Err(ProviderError::Network(format!(
                    "unexpected status {s} on {path}"
                ))),
                _ => resp
                    .json::<Value>()
                    .await
                    .map_err(|e| ProviderError::Decode(e.to_string())),
            };
        }
        unreachable!("retry loop always returns")
    }
}

async fn backoff(attempt: u32) {
    let base = BACKOFF_BASE_MS * 2u64.pow(attempt);
    let jitter: f64 = rand::rng().random_range(0.5..1.5);
    sleep(Duration::from_millis((base as f64 * jitter) as u64)).await;
}

fn meta_off() -> (String, String) {
    ("iss.meta".to_string(), "off".to_string())
}

#[async_trait]
impl MarketDataProvider for IssProvider {
    async fn snapshot(
        &self,
        ticker: &str,
        board: &str,
    ) -> Result<SecuritySnapshot, ProviderError> {
        let ticker = ticker.to_uppercase();
        let path = format!(
            "/iss/engines/stock/markets/shares/boards/{board}/securities/{ticker}.json"
        );
        let body = self.get_json(&path, &[meta_off()]).await?;
        parse_snapshot(&body, &ticker, board)
    }

    async fn ohlcv(
        &self,
        ticker: &str,
        board: &str,
        from: NaiveDate,
        to: NaiveDate,
        interval: Interval,
    ) -> Result<Vec<OhlcvBar>, ProviderError> {
        check_lookback(from, to, self.cfg.max_lookback_days)?;
        let ticker = ticker.to_uppercase();
        let path = format!(
            "/iss/engines/stock/markets/shares/boards/{board}/securities/{ticker}/candles.json"
        );

        // ISS pages candles; walk pages until a short page arrives.
        let mut bars = Vec::new();
        let mut start = 0usize;
        for _ in 0..MAX_CANDLE_PAGES {
            let query = vec![
                ("from".to_string(), from.to_string()),
                ("till".to_string(), to.to_string()),
                ("interval".to_string(), interval.iss_code().to_string()),
                ("start".to_string(), start.to_string()),
                meta_off(),
            ];
            let body = self.get_json(&path, &query).await?;
            let page = parse_candles(&body, &ticker)?;
            let page_len = page.len();
            bars.extend(page);
            if page_len < CANDLE_PAGE_LIMIT {
                break;
            }
            start += page_len;
        }

        bars.sort_by_key(|b| b.date);
        if interval == Interval::Daily {
            // Page overlap can repeat a trading day
            bars.dedup_by_key(|b| b.date);
        }

        if bars.is_empty() {
            return Err(ProviderError::InvalidTicker(format!(
                "no trading history for {ticker} on {board}"
            )));
        }

        Ok(bars)
    }

    async fn constituents(
        &self,
        index_ticker: &str,
        as_of: Option<NaiveDate>,
    ) -> Result<Vec<IndexConstituent>, ProviderError> {
        let index = index_ticker.to_uppercase();
        let path = format!("/iss/statistics/engines/stock/markets/index/analytics/{index}.json");
        let mut query = vec![("limit".to_string(), "100".to_string()), meta_off()];
        if let Some(date) = as_of {
            query.push(("date".to_string(), date.to_string()));
        }
        let body = self.get_json(&path, &query).await?;
        let members = parse_constituents(&body)?;
        if members.is_empty() {
            return Err(ProviderError::InvalidTicker(format!(
                "no constituents for index {index}"
            )));
        }
        Ok(members)
    }

    async fn dividends(
        &self,
        ticker: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DividendRecord>, ProviderError> {
        check_lookback(from, to, self.cfg.max_lookback_days)?;
        let ticker = ticker.to_uppercase();
        let path = format!("/iss/securities/{ticker}/dividends.json");
        let body = self.get_json(&path, &[meta_off()]).await?;
        let mut records = parse_dividends(&body, &ticker)?;
        records.retain(|r| r.registry_close_date >= from && r.registry_close_date <= to);
        Ok(records)
    }
}

// ---------------------------------------------------------------------------
// ISS table decoding
// ---------------------------------------------------------------------------

/// One ISS response block: parallel `columns` / `data` arrays.
struct Table {
    columns: Vec<String>,
    data: Vec<Vec<Value>>,
}

impl Table {
    fn from_block(body: &Value, block: &str) -> Result<Self, ProviderError> {
        let node = body
            .get(block)
            .ok_or_else(|| ProviderError::Decode(format!("missing block: {block}")))?;
        let columns = node
            .get("columns")
            .and_then(Value::as_array)
            .ok_or_else(|| ProviderError::Decode(format!("{block}: missing columns")))?
            .iter()
            .filter_map(|c| c.as_str().map(str::to_lowercase))
            .collect();
        let data = node
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| ProviderError::Decode(format!("{block}: missing data")))?
            .iter()
            .filter_map(|row| row.as_array().cloned())
            .collect();
        Ok(Self { columns, data })
    }

    fn idx(&self, col: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == col)
    }

    fn str_at(&self, row: &[Value], col: &str) -> Option<String> {
        self.idx(col)
            .and_then(|i| row.get(i))
            .and_then(|v| v.as_str().map(str::to_string))
    }

    fn f64_at(&self, row: &[Value], col: &str) -> Option<f64> {
        let v = self.idx(col).and_then(|i| row.get(i))?;
        match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|dt| dt.date())
        })
}

fn parse_snapshot(
    body: &Value,
    ticker: &str,
    board: &str,
) -> Result<SecuritySnapshot, ProviderError> {
    let securities = Table::from_block(body, "securities")?;
    let row = securities
        .data
        .first()
        .ok_or_else(|| ProviderError::InvalidTicker(ticker.to_string()))?;

    let short_name = securities
        .str_at(row, "shortname")
        .unwrap_or_else(|| ticker.to_string());
    let prev_close = securities.f64_at(row, "prevprice").unwrap_or(0.0);
    let currency = securities
        .str_at(row, "currencyid")
        .unwrap_or_else(|| "SUR".to_string());

    // LAST/VOLTODAY live in the marketdata block; off-hours they may be null.
    let (last_price, volume) = match Table::from_block(body, "marketdata") {
        Ok(md) => {
            let row = md.data.first();
            (
                row.and_then(|r| md.f64_at(r, "last")),
                row.and_then(|r| md.f64_at(r, "voltoday")),
            )
        }
        Err(_) => (None, None),
    };
    let last_price = last_price.unwrap_or(prev_close);

    let change_pct = if prev_close > 0.0 {
        (last_price - prev_close) / prev_close * 100.0
    } else {
        0.0
    };

    Ok(SecuritySnapshot {
        ticker: ticker.to_string(),
        board: board.to_string(),
        short_name,
        last_price,
        prev_close,
        change_pct,
        volume: volume.unwrap_or(0.0),
        currency,
    })
}

fn parse_candles(body: &Value, ticker: &str) -> Result<Vec<OhlcvBar>, ProviderError> {
    let candles = Table::from_block(body, "candles")?;
    let mut bars = Vec::with_capacity(candles.data.len());
    for row in &candles.data {
        let Some(date) = candles.str_at(row, "begin").as_deref().and_then(parse_date) else {
            continue;
        };
        let (Some(open), Some(high), Some(low), Some(close)) = (
            candles.f64_at(row, "open"),
            candles.f64_at(row, "high"),
            candles.f64_at(row, "low"),
            candles.f64_at(row, "close"),
        ) else {
            // Bars with missing prices are dropped silently
            tracing::debug!("Dropping incomplete candle for {ticker} at {date}");
            continue;
        };
        bars.push(OhlcvBar {
            date,
            open,
            high,
            low,
            close,
            volume: candles.f64_at(row, "volume").unwrap_or(0.0),
        });
    }
    Ok(bars)
}

fn parse_constituents(body: &Value) -> Result<Vec<IndexConstituent>, ProviderError> {
    let analytics = Table::from_block(body, "analytics")?;
    let mut members = Vec::with_capacity(analytics.data.len());
    for row in &analytics.data {
        let Some(ticker) = analytics
            .str_at(row, "ticker")
            .or_else(|| analytics.str_at(row, "secids"))
        else {
            continue;
        };
        members.push(IndexConstituent {
            short_name: analytics
                .str_at(row, "shortnames")
                .unwrap_or_else(|| ticker.clone()),
            weight_pct: analytics.f64_at(row, "weight").unwrap_or(0.0),
            ticker,
        });
    }
    members.sort_by(|a, b| {
        b.weight_pct
            .partial_cmp(&a.weight_pct)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.ticker.cmp(&b.ticker))
    });
    Ok(members)
}

fn parse_dividends(body: &Value, ticker: &str) -> Result<Vec<DividendRecord>, ProviderError> {
    let dividends = Table::from_block(body, "dividends")?;
    let mut records = Vec::with_capacity(dividends.data.len());
    for row in &dividends.data {
        let Some(date) = dividends
            .str_at(row, "registryclosedate")
            .as_deref()
            .and_then(parse_date)
        else {
            continue;
        };
        let Some(value) = dividends.f64_at(row, "value") else {
            continue;
        };
        records.push(DividendRecord {
            ticker: ticker.to_string(),
            registry_close_date: date,
            value,
            currency: dividends
                .str_at(row, "currencyid")
                .unwrap_or_else(|| "SUR".to_string()),
        });
    }
    records.sort_by_key(|r| r.registry_close_date);
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snapshot_parses_securities_and_marketdata() {
        let body = json!({
            "securities": {
                "columns": ["SECID", "SHORTNAME", "PREVPRICE", "CURRENCYID"],
                "data": [["SBER", "Сбербанк", 250.0, "SUR"]]
            },
            "marketdata": {
                "columns": ["SECID", "LAST", "VOLTODAY"],
                "data": [["SBER", 255.0, 1_000_000.0]]
            }
        });
        let snap = parse_snapshot(&body, "SBER", "TQBR").unwrap();
        assert_eq!(snap.short_name, "Сбербанк");
        assert_eq!(snap.last_price, 255.0);
        assert_eq!(snap.prev_close, 250.0);
        assert!((snap.change_pct - 2.0).abs() < 1e-10);
        assert_eq!(snap.currency, "SUR");
    }

    #[test]
    fn snapshot_falls_back_to_prev_close_off_hours() {
        let body = json!({
            "securities": {
                "columns": ["SECID", "SHORTNAME", "PREVPRICE", "CURRENCYID"],
                "data": [["GAZP", "Газпром", 170.0, "SUR"]]
            },
            "marketdata": {
                "columns": ["SECID", "LAST", "VOLTODAY"],
                "data": [["GAZP", null, null]]
            }
        });
        let snap = parse_snapshot(&body, "GAZP", "TQBR").unwrap();
        assert_eq!(snap.last_price, 170.0);
        assert_eq!(snap.change_pct, 0.0);
    }

    #[test]
    fn snapshot_empty_table_is_invalid_ticker() {
        let body = json!({
            "securities": { "columns": ["SECID"], "data": [] }
        });
        let err = parse_snapshot(&body, "NOPE", "TQBR").unwrap_err();
        assert!(matches!(err, ProviderError::InvalidTicker(_)));
    }

    #[test]
    fn candles_parse_and_drop_incomplete_rows() {
        let body = json!({
            "candles": {
                "columns": ["open", "close", "high", "low", "value", "volume", "begin", "end"],
                "data": [
                    [100.0, 102.0, 103.0, 99.0, 1.0, 500.0, "2024-01-15 00:00:00", "2024-01-15 23:59:59"],
                    [null, 101.0, 102.0, 100.0, 1.0, 400.0, "2024-01-16 00:00:00", "2024-01-16 23:59:59"],
                    [102.0, 104.0, 105.0, 101.0, 1.0, 600.0, "2024-01-17 00:00:00", "2024-01-17 23:59:59"]
                ]
            }
        });
        let bars = parse_candles(&body, "SBER").unwrap();
        assert_eq!(bars.len(), 2, "incomplete bar dropped");
        assert_eq!(
            bars[0].date,
            NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
        );
        assert_eq!(bars[1].close, 104.0);
    }

    #[test]
    fn constituents_sorted_by_weight() {
        let body = json!({
            "analytics": {
                "columns": ["indexid", "tradedate", "ticker", "shortnames", "weight"],
                "data": [
                    ["IMOEX", "2024-06-01", "GAZP", "Газпром", 9.5],
                    ["IMOEX", "2024-06-01", "SBER", "Сбербанк", 14.2],
                    ["IMOEX", "2024-06-01", "LKOH", "Лукойл", 12.1]
                ]
            }
        });
        let members = parse_constituents(&body).unwrap();
        assert_eq!(members[0].ticker, "SBER");
        assert_eq!(members[1].ticker, "LKOH");
        assert_eq!(members[2].ticker, "GAZP");
    }

    #[test]
    fn dividends_parse_and_sort() {
        let body = json!({
            "dividends": {
                "columns": ["secid", "isin", "registryclosedate", "value", "currencyid"],
                "data": [
                    ["SBER", "RU0009029540", "2024-07-11", 33.3, "SUR"],
                    ["SBER", "RU0009029540", "2023-05-11", 25.0, "SUR"]
                ]
            }
        });
        let records = parse_dividends(&body, "SBER").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0].registry_close_date,
            NaiveDate::from_ymd_opt(2023, 5, 11).unwrap()
        );
        assert_eq!(records[1].value, 33.3);
    }
}
