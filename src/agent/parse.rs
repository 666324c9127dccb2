//! Deterministic request parsing: scenario classification, ticker and
//! portfolio extraction, date windows.
//!
//! Keyword and entity rules run first in every planner mode; the advanced
//! planner only consults the LLM when these rules are ambiguous.

use chrono::NaiveDate;
use serde_json::{json, Value};

use super::scenario::ScenarioType;

/// Words that look like tickers but never are.
const STOPWORDS: &[&str] = &[
    "THE", "AND", "FOR", "VAR", "CFO", "USD", "RUB", "EUR", "CNY", "OHLC", "OHLCV", "MOEX", "ISS",
    "ETF", "IPO", "P&L", "PNL", "YTD", "RISK",
];

/// Index tickers recognised as indices rather than securities.
const INDEX_TICKERS: &[&str] = &["IMOEX", "RTSI", "MOEXBC", "MOEXFN", "MOEXOG"];

fn lower(query: &str) -> String {
    query.to_lowercase()
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Classify a user query into a scenario type. Returns `None` when the
/// rules are genuinely ambiguous (the advanced planner may then consult
/// the LLM); `classify` always resolves with a deterministic fallback.
pub fn classify_confident(query: &str) -> Option<ScenarioType> {
    let q = lower(query);
    let tickers = extract_tickers(query);
    let portfolio = parse_portfolio(query);

    if contains_any(&q, &["liquidity", "ликвидност", "covenant", "ковенант"]) {
        return Some(ScenarioType::CfoLiquidityReport);
    }
    if contains_any(&q, &["peers", "аналог", "конкурент"]) {
        return Some(ScenarioType::IssuerPeersCompare);
    }
    if contains_any(&q, &["index", "индекс"]) || tickers.iter().any(|t| is_index_ticker(t)) {
        return Some(ScenarioType::IndexRiskScan);
    }
    if contains_any(&q, &["compare", "сравн", "versus", " vs "]) && tickers.len() >= 2 {
        return Some(ScenarioType::CompareSecurities);
    }
    if !portfolio.is_empty()
        && contains_any(&q, &["drill", "детал", "подробн", "breakdown", "разбивк"])
    {
        return Some(ScenarioType::PortfolioRiskDrillDown);
    }
    if !portfolio.is_empty()
        || contains_any(&q, &["portfolio", "портфел", "rebalance", "ребаланс"])
    {
        return Some(ScenarioType::PortfolioRisk);
    }
    if tickers.len() == 1 {
        return Some(ScenarioType::SingleSecurityOverview);
    }
    None
}

pub fn classify(query: &str) -> ScenarioType {
    classify_confident(query).unwrap_or(ScenarioType::PortfolioRisk)
}

pub fn is_index_ticker(ticker: &str) -> bool {
    INDEX_TICKERS.contains(&ticker.to_uppercase().as_str())
}

fn is_ticker_token(token: &str) -> bool {
    (3..=6).contains(&token.len())
        && token.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        && token.chars().any(|c| c.is_ascii_uppercase())
        && !STOPWORDS.contains(&token)
}

/// Extract candidate tickers in order of first appearance.
pub fn extract_tickers(query: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for token in query.split(|c: char| !c.is_ascii_alphanumeric()) {
        if is_ticker_token(token) && !out.iter().any(|t| t == token) {
            out.push(token.to_string());
        }
    }
    out
}

/// Accept a token as a portfolio weight: percents up to 100, fractions
/// up to 1.5.
fn parse_weight_token(token: &str) -> Option<f64> {
    if let Some(numeric) = token.strip_suffix('%') {
        let value: f64 = numeric.parse().ok()?;
        (value > 0.0 && value <= 100.0).then_some(value)
    } else {
        let value: f64 = token.parse().ok()?;
        (value > 0.0 && value <= 1.5).then_some(value)
    }
}

/// Parse "SBER=45%, GAZP=20%, …" style portfolios from free text.
///
/// Accepts `TICKER=45%`, `TICKER 45%`, `TICKER: 0.45` separated by commas
/// or semicolons; the weight must directly follow its ticker. Percent
/// weights are detected by scale and the result renormalised to sum to 1.
pub fn parse_portfolio(query: &str) -> Vec<(String, f64)> {
    let mut entries: Vec<(String, f64)> = Vec::new();

    for chunk in query.split([',', ';', '\n']) {
        let tokens: Vec<&str> = chunk
            .split(|c: char| !(c.is_ascii_alphanumeric() || c == '.' || c == '%'))
            .filter(|t| !t.is_empty())
            .collect();
        let pair = tokens.windows(2).find_map(|pair| {
            if is_ticker_token(pair[0]) {
                parse_weight_token(pair[1]).map(|w| (pair[0].to_string(), w))
            } else {
                None
            }
        });
        if let Some((t, w)) = pair {
            if !entries.iter().any(|(existing, _)| *existing == t) {
                entries.push((t, w));
            }
        }
    }

    if entries.is_empty() {
        return entries;
    }

    // Percent scale if any weight exceeds a plausible fraction
    if entries.iter().any(|(_, w)| *w > 1.5) {
        for (_, w) in &mut entries {
            *w /= 100.0;
        }
    }
    let sum: f64 = entries.iter().map(|(_, w)| *w).sum();
    if sum > 0.0 && (sum - 1.0).abs() > 1e-9 {
        for (_, w) in &mut entries {
            *w /= sum;
        }
    }
    entries
}

/// Find an explicit `YYYY-MM-DD..YYYY-MM-DD` (or two loose ISO dates)
/// window in the query.
pub fn parse_date_range(query: &str) -> Option<(NaiveDate, NaiveDate)> {
    let mut dates: Vec<NaiveDate> = Vec::new();
    for token in query.split(|c: char| !(c.is_ascii_digit() || c == '-')) {
        if token.len() == 10 {
            if let Ok(date) = NaiveDate::parse_from_str(token, "%Y-%m-%d") {
                dates.push(date);
            }
        }
    }
    if dates.len() < 2 {
        return None;
    }
    let (a, b) = (dates[0], dates[1]);
    Some(if a <= b { (a, b) } else { (b, a) })
}

/// Keep the `top_n` heaviest positions and fold the truncated mass into
/// an `OTHERS` cash bucket so weights still sum to 1.
pub fn truncate_positions(positions: &[(String, f64)], top_n: usize) -> Value {
    let mut sorted: Vec<(String, f64)> = positions.to_vec();
    sorted.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });

    let kept = &sorted[..top_n.min(sorted.len())];
    let others_weight: f64 = sorted[top_n.min(sorted.len())..].iter().map(|(_, w)| w).sum();

    let mut rows: Vec<Value> = kept
        .iter()
        .map(|(t, w)| json!({"ticker": t, "weight": w}))
        .collect();
    if others_weight > 0.0 {
        rows.push(json!({
            "ticker": "OTHERS",
            "weight": others_weight,
            "asset_class": "cash",
        }));
    }
    json!({ "positions": rows, "truncated": others_weight > 0.0 })
}
