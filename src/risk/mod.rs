//! Portfolio risk analytics: returns, volatility, drawdown, concentration,
//! historical VaR, deterministic stress scenarios, rebalancing and
//! liquidity reporting.
//!
//! Everything in this module is pure and synchronous; data fetching happens
//! in the MCP tool layer through the provider seam. Given identical inputs
//! the outputs are bit-identical (fixed arithmetic order throughout).

pub mod concentration;
pub mod correlation;
pub mod liquidity;
pub mod portfolio;
pub mod rebalance;
pub mod returns;
pub mod stress;
pub mod var;

use garde::Validate;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::RiskError;

/// Σ weight must equal 1 within this tolerance for a portfolio input.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-4;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    Equity,
    FixedIncome,
    Credit,
    Cash,
    Fx,
}

impl AssetClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Equity => "equity",
            Self::FixedIncome => "fixed_income",
            Self::Credit => "credit",
            Self::Cash => "cash",
            Self::Fx => "fx",
        }
    }
}

/// Time-to-liquidate bucket.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum LiquidityBucket {
    #[serde(rename = "0-7d")]
    Within7d,
    #[serde(rename = "8-30d")]
    Within30d,
    #[serde(rename = "31-90d")]
    Within90d,
    #[serde(rename = "90d+")]
    Over90d,
}

impl LiquidityBucket {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Within7d => "0-7d",
            Self::Within30d => "8-30d",
            Self::Within90d => "31-90d",
            Self::Over90d => "90d+",
        }
    }

    /// Default bucket when the position does not carry one.
    pub fn default_for(class: AssetClass) -> Self {
        match class {
            AssetClass::Cash | AssetClass::Fx | AssetClass::Equity => Self::Within7d,
            AssetClass::FixedIncome => Self::Within30d,
            AssetClass::Credit => Self::Within90d,
        }
    }
}

fn default_asset_class() -> AssetClass {
    AssetClass::Equity
}

/// One portfolio position by weight.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
pub struct Position {
    /// MOEX ticker, e.g. "SBER"
    #[garde(length(min = 1, max = 12), pattern(r"^[A-Za-z0-9.\-]+$"))]
    pub ticker: String,
    /// Portfolio weight as a fraction of total value
    #[garde(range(min = 0.0, max = 1.0))]
    pub weight: f64,
    /// Asset class (default: equity)
    #[serde(default = "default_asset_class")]
    #[garde(skip)]
    pub asset_class: AssetClass,
    /// Issuer override; derived from the ticker when absent
    #[garde(inner(length(min = 1, max = 64)))]
    pub issuer: Option<String>,
    /// Position currency (default: RUB)
    #[garde(inner(length(min = 3, max = 3)))]
    pub currency: Option<String>,
    /// Time-to-liquidate bucket; defaulted per asset class when absent
    #[garde(skip)]
    pub liquidity_bucket: Option<LiquidityBucket>,
}

impl Position {
    pub fn new(ticker: &str, weight: f64, asset_class: AssetClass) -> Self {
        Self {
            ticker: ticker.to_uppercase(),
            weight,
            asset_class,
            issuer: None,
            currency: None,
            liquidity_bucket: None,
        }
    }

    pub fn is_foreign_currency(&self) -> bool {
        self.currency
            .as_deref()
            .is_some_and(|c| !matches!(c.to_uppercase().as_str(), "RUB" | "SUR"))
    }
}

/// Known preferred/ordinary share pairs sharing one issuer.
const ISSUER_PAIRS: &[(&str, &str)] = &[
    ("SBERP", "SBER"),
    ("TATNP", "TATN"),
    ("SNGSP", "SNGS"),
    ("RTKMP", "RTKM"),
    ("MTLRP", "MTLR"),
    ("BANEP", "BANE"),
];

/// Resolve the issuer for a position: explicit value wins, then the
/// preferred-share table, then the ticker itself.
pub fn issuer_of(ticker: &str, explicit: Option<&str>) -> String {
    if let Some(issuer) = explicit {
        return issuer.to_string();
    }
    let upper = ticker.to_uppercase();
    for (pref, ord) in ISSUER_PAIRS {
        if upper == *pref {
            return (*ord).to_string();
        }
    }
    upper
}

/// Severity grading shared by risk flags, dashboard metrics and alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Validate the structural portfolio invariants: non-empty, unique tickers,
/// weights in [0, 1] summing to 1 within tolerance.
pub fn validate_portfolio(positions: &[Position]) -> Result<(), RiskError> {
    if positions.is_empty() {
        return Err(RiskError::InvalidPortfolio(
            "portfolio has no positions".to_string(),
        ));
    }
    let mut seen = std::collections::HashSet::new();
    for p in positions {
        if !(0.0..=1.0).contains(&p.weight) {
            return Err(RiskError::InvalidPortfolio(format!(
                "weight {} for {} outside [0, 1]",
                p.weight, p.ticker
            )));
        }
        if !seen.insert(p.ticker.to_uppercase()) {
            return Err(RiskError::InvalidPortfolio(format!(
                "duplicate ticker: {}",
                p.ticker
            )));
        }
    }
    let sum: f64 = positions.iter().map(|p| p.weight).sum();
    if (sum - 1.0).abs() >= WEIGHT_SUM_TOLERANCE {
        return Err(RiskError::InvalidPortfolio(format!(
            "weights sum to {sum:.6}, expected 1"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn equal_weight(tickers: &[&str]) -> Vec<Position> {
        let w = 1.0 / tickers.len() as f64;
        tickers
            .iter()
            .map(|t| Position::new(t, w, AssetClass::Equity))
            .collect()
    }

    #[test]
    fn valid_portfolio_passes() {
        assert!(validate_portfolio(&equal_weight(&["SBER", "GAZP", "LKOH", "ROSN"])).is_ok());
    }

    #[test]
    fn empty_portfolio_rejected() {
        assert!(validate_portfolio(&[]).is_err());
    }

    #[test]
    fn duplicate_tickers_rejected() {
        let mut positions = equal_weight(&["SBER", "GAZP"]);
        positions[1].ticker = "SBER".to_string();
        assert!(validate_portfolio(&positions).is_err());
    }

    #[test]
    fn weight_sum_tolerance_enforced() {
        let mut positions = equal_weight(&["SBER", "GAZP"]);
        positions[0].weight = 0.55;
        assert!(validate_portfolio(&positions).is_err());

        // Within 1e-4 is fine
        positions[0].weight = 0.50005;
        positions[1].weight = 0.5;
        assert!(validate_portfolio(&positions).is_ok());
    }

    #[test]
    fn preferred_shares_share_issuer() {
        assert_eq!(issuer_of("SBERP", None), "SBER");
        assert_eq!(issuer_of("SBER", None), "SBER");
        assert_eq!(issuer_of("sberp", None), "SBER");
        assert_eq!(issuer_of("YNDX", None), "YNDX");
        assert_eq!(issuer_of("SBERP", Some("Sberbank")), "Sberbank");
    }

    #[test]
    fn foreign_currency_detection() {
        let mut p = Position::new("FXUS", 1.0, AssetClass::Fx);
        assert!(!p.is_foreign_currency());
        p.currency = Some("USD".to_string());
        assert!(p.is_foreign_currency());
        p.currency = Some("RUB".to_string());
        assert!(!p.is_foreign_currency());
    }

    #[test]
    fn liquidity_bucket_defaults() {
        assert_eq!(
            LiquidityBucket::default_for(AssetClass::Equity),
            LiquidityBucket::Within7d
        );
        assert_eq!(
            LiquidityBucket::default_for(AssetClass::Credit),
            LiquidityBucket::Within90d
        );
    }
}
