//! Return series construction: alignment, weight dynamics, equity curve,
//! volatility and drawdown.

use chrono::{Datelike, NaiveDate};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::data::OhlcvBar;
use crate::error::RiskError;

pub const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Weight dynamics between rebalances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RebalancePolicy {
    #[default]
    BuyAndHold,
    Monthly,
}

/// Per-ticker daily returns on the intersection of trading days.
///
/// `returns[k][t]` is ticker `k`'s simple return on `dates[t]` (the return
/// from the previous common trading day's close).
#[derive(Debug, Clone)]
pub struct AlignedReturns {
    pub tickers: Vec<String>,
    /// Dates the returns are realised on (one fewer than aligned closes).
    pub dates: Vec<NaiveDate>,
    pub returns: Vec<Vec<f64>>,
}

impl AlignedReturns {
    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }
}

/// Align series to the intersection of trading days and compute simple
/// daily returns `r_t = (C_t − C_{t−1}) / C_{t−1}`.
pub fn align_returns(series: &[(String, Vec<OhlcvBar>)]) -> Result<AlignedReturns, RiskError> {
    if series.is_empty() {
        return Err(RiskError::InvalidPortfolio("no price series".to_string()));
    }

    let mut common: HashSet<NaiveDate> = series[0].1.iter().map(|b| b.date).collect();
    for (_, bars) in &series[1..] {
        let dates: HashSet<NaiveDate> = bars.iter().map(|b| b.date).collect();
        common.retain(|d| dates.contains(d));
    }

    let mut dates: Vec<NaiveDate> = common.into_iter().collect();
    dates.sort_unstable();
    if dates.len() < 2 {
        return Err(RiskError::InsufficientData(dates.len()));
    }

    let mut tickers = Vec::with_capacity(series.len());
    let mut returns = Vec::with_capacity(series.len());
    for (ticker, bars) in series {
        let closes: Vec<f64> = {
            let by_date: std::collections::HashMap<NaiveDate, f64> =
                bars.iter().map(|b| (b.date, b.close)).collect();
            dates.iter().map(|d| by_date[d]).collect()
        };
        let mut rets = Vec::with_capacity(closes.len() - 1);
        for t in 1..closes.len() {
            let prev = closes[t - 1];
            rets.push(if prev > 0.0 {
                (closes[t] - prev) / prev
            } else {
                0.0
            });
        }
        tickers.push(ticker.clone());
        returns.push(rets);
    }

    Ok(AlignedReturns {
        tickers,
        dates: dates[1..].to_vec(),
        returns,
    })
}

/// Portfolio daily returns under the given weight policy.
///
/// Buy-and-hold weights drift with relative performance:
/// `w_{i,t} = w_{i,t−1}·(1+r_{i,t}) / (1+R_t)`. Monthly rebalancing resets
/// weights to the input weights before the first return of each calendar
/// month is applied.
pub fn portfolio_returns(
    aligned: &AlignedReturns,
    weights: &[f64],
    policy: RebalancePolicy,
) -> Vec<f64> {
    let n = aligned.tickers.len();
    debug_assert_eq!(weights.len(), n);

    let mut w = weights.to_vec();
    let mut out = Vec::with_capacity(aligned.len());
    for t in 0..aligned.len() {
        if policy == RebalancePolicy::Monthly && t > 0 {
            let prev = aligned.dates[t - 1];
            let cur = aligned.dates[t];
            if (cur.year(), cur.month()) != (prev.year(), prev.month()) {
                w.copy_from_slice(weights);
            }
        }

        let mut r_p = 0.0;
        for i in 0..n {
            r_p += w[i] * aligned.returns[i][t];
        }
        out.push(r_p);

        // Drift weights into the next day
        let growth = 1.0 + r_p;
        if growth.abs() > f64::EPSILON {
            for i in 0..n {
                w[i] = w[i] * (1.0 + aligned.returns[i][t]) / growth;
            }
        }
    }
    out
}

/// Compound total return `Π(1+R_t) − 1`.
pub fn total_return(returns: &[f64]) -> f64 {
    returns.iter().fold(1.0, |acc, r| acc * (1.0 + r)) - 1.0
}

/// Cumulative equity curve `E_t = Π(1+R_s), s ≤ t`.
pub fn equity_curve(returns: &[f64]) -> Vec<f64> {
    let mut curve = Vec::with_capacity(returns.len());
    let mut equity = 1.0;
    for r in returns {
        equity *= 1.0 + r;
        curve.push(equity);
    }
    curve
}

/// Annualised volatility: sample standard deviation times √252.
pub fn annualized_volatility(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    variance.sqrt() * TRADING_DAYS_PER_YEAR.sqrt()
}

/// Maximum drawdown of the equity curve, reported as a non-positive
/// fraction in (−1, 0].
pub fn max_drawdown(returns: &[f64]) -> f64 {
    let mut peak = 1.0f64;
    let mut equity = 1.0f64;
    let mut max_dd = 0.0f64;
    for r in returns {
        equity *= 1.0 + r;
        if equity > peak {
            peak = equity;
        }
        let dd = equity / peak - 1.0;
        if dd < max_dd {
            max_dd = dd;
        }
    }
    max_dd
}
