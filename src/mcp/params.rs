//! Tool parameter and response-data types.
//!
//! Every param struct is schemars-described for the MCP tool listing and
//! garde-validated before dispatch; date fields arrive as `YYYY-MM-DD`
//! strings and are parsed in the server layer.

use chrono::NaiveDate;
use garde::Validate;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::data::{Interval, OhlcvBar};
use crate::risk::portfolio::RiskPrefs;
use crate::risk::returns::RebalancePolicy;
use crate::risk::stress::{Aggregates, CovenantLimits, StressScenarioSpec};
use crate::risk::var::VarConfig;
use crate::risk::Position;

fn default_board() -> String {
    "TQBR".to_string()
}

fn default_base_currency() -> String {
    "RUB".to_string()
}

fn default_interval() -> Interval {
    Interval::Daily
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct AnalyzePortfolioRiskParams {
    /// Portfolio positions; weights must sum to 1
    #[garde(length(min = 1), dive)]
    pub positions: Vec<Position>,
    /// Window start (YYYY-MM-DD)
    #[garde(pattern(r"^[0-9]{4}-[0-9]{2}-[0-9]{2}$"))]
    pub from_date: String,
    /// Window end (YYYY-MM-DD)
    #[garde(pattern(r"^[0-9]{4}-[0-9]{2}-[0-9]{2}$"))]
    pub to_date: String,
    /// Reporting currency (default: RUB)
    #[serde(default = "default_base_currency")]
    #[garde(length(min = 3, max = 3))]
    pub base_currency: String,
    /// Weight dynamics: buy_and_hold (default) or monthly reset
    #[serde(default)]
    #[garde(skip)]
    pub rebalance: RebalancePolicy,
    /// Duration aggregates consumed by the stress engine
    #[garde(dive)]
    pub aggregates: Option<Aggregates>,
    /// Extra scenarios on top of the canonical set
    #[garde(dive)]
    pub stress_scenarios: Option<Vec<StressScenarioSpec>>,
    #[garde(dive)]
    pub var_config: Option<VarConfig>,
    #[garde(inner(range(min = 0.0)))]
    pub total_portfolio_value: Option<f64>,
    #[garde(dive)]
    pub covenant_limits: Option<CovenantLimits>,
    #[garde(dive)]
    pub risk_prefs: Option<RiskPrefs>,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct ComputeCorrelationParams {
    /// Tickers to correlate (at least 2)
    #[garde(length(min = 2, max = 30), inner(length(min = 1, max = 12), pattern(r"^[A-Za-z0-9.\-]+$")))]
    pub tickers: Vec<String>,
    #[garde(pattern(r"^[0-9]{4}-[0-9]{2}-[0-9]{2}$"))]
    pub from_date: String,
    #[garde(pattern(r"^[0-9]{4}-[0-9]{2}-[0-9]{2}$"))]
    pub to_date: String,
    /// Trading board (default: TQBR)
    #[serde(default = "default_board")]
    #[garde(length(min = 1, max = 12))]
    pub board: String,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct SnapshotParams {
    /// MOEX ticker, e.g. "SBER"
    #[garde(length(min = 1, max = 12), pattern(r"^[A-Za-z0-9.\-]+$"))]
    pub ticker: String,
    /// Trading board (default: TQBR)
    #[serde(default = "default_board")]
    #[garde(length(min = 1, max = 12))]
    pub board: String,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct OhlcvParams {
    #[garde(length(min = 1, max = 12), pattern(r"^[A-Za-z0-9.\-]+$"))]
    pub ticker: String,
    #[serde(default = "default_board")]
    #[garde(length(min = 1, max = 12))]
    pub board: String,
    #[garde(pattern(r"^[0-9]{4}-[0-9]{2}-[0-9]{2}$"))]
    pub from_date: String,
    #[garde(pattern(r"^[0-9]{4}-[0-9]{2}-[0-9]{2}$"))]
    pub to_date: String,
    /// Bar interval: "1d" (default) or "1h"
    #[serde(default = "default_interval")]
    #[garde(skip)]
    pub interval: Interval,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
pub struct IndexConstituentsParams {
    /// Index ticker; defaults to the configured index (IMOEX)
    #[garde(inner(length(min = 1, max = 12), pattern(r"^[A-Za-z0-9.\-]+$")))]
    pub index_ticker: Option<String>,
    /// Basket date (YYYY-MM-DD); latest when omitted
    #[garde(inner(pattern(r"^[0-9]{4}-[0-9]{2}-[0-9]{2}$")))]
    pub as_of: Option<String>,
}

// ---------------------------------------------------------------------------
// Response data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OhlcvSeries {
    pub ticker: String,
    pub board: String,
    pub interval: Interval,
    pub bars: Vec<OhlcvBar>,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
}

impl OhlcvSeries {
    pub fn new(ticker: String, board: String, interval: Interval, bars: Vec<OhlcvBar>) -> Self {
        Self {
            first_date: bars.first().map(|b| b.date),
            last_date: bars.last().map(|b| b.date),
            ticker,
            board,
            interval,
            bars,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ConstituentMetrics {
    pub ticker: String,
    pub short_name: String,
    pub weight_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct IndexConstituentsMetrics {
    pub index_ticker: String,
    pub as_of: Option<NaiveDate>,
    pub count: usize,
    /// Share of the basket held by the ten largest members, in percent
    pub top10_weight_pct: f64,
    /// HHI over normalised basket weights
    pub hhi: f64,
    pub constituents: Vec<ConstituentMetrics>,
}
