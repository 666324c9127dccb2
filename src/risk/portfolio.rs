//! `analyze_portfolio_risk` assembly: totals, per-instrument statistics,
//! concentrations, stress scenarios and risk flags.

use chrono::NaiveDate;
use garde::Validate;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::data::OhlcvBar;
use crate::error::RiskError;

use super::concentration::{concentrations, Concentrations};
use super::returns::{
    align_returns, annualized_volatility, equity_curve, max_drawdown, portfolio_returns,
    total_return, RebalancePolicy,
};
use super::stress::{
    canonical_scenarios, exposures, run_scenarios, Aggregates, CovenantLimits, StressResult,
    StressScenarioSpec,
};
use super::var::{var_light, VarConfig, VarLight};
use super::{validate_portfolio, Position, Severity};

/// Flag thresholds applied when the caller does not supply preferences.
const DEFAULT_TOP1_FLAG_PCT: f64 = 35.0;
const DEFAULT_HHI_FLAG: f64 = 0.25;

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, Validate)]
pub struct RiskPrefs {
    /// VaR ceiling as a fraction of portfolio value
    #[garde(inner(range(min = 0.0, max = 1.0)))]
    pub max_var_light: Option<f64>,
    /// Largest-position ceiling in percent
    #[garde(inner(range(min = 0.0, max = 100.0)))]
    pub max_top1_pct: Option<f64>,
    /// HHI ceiling on weight fractions
    #[garde(inner(range(min = 0.0, max = 1.0)))]
    pub max_hhi: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AnalyzeRequest {
    pub positions: Vec<Position>,
    pub from_date: NaiveDate,
    pub to_date: NaiveDate,
    pub base_currency: String,
    pub rebalance: RebalancePolicy,
    pub aggregates: Option<Aggregates>,
    pub stress_scenarios: Option<Vec<StressScenarioSpec>>,
    pub var_config: Option<VarConfig>,
    pub total_portfolio_value: Option<f64>,
    pub covenant_limits: Option<CovenantLimits>,
    pub risk_prefs: Option<RiskPrefs>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Totals {
    pub value: Option<f64>,
    pub total_return: f64,
    pub annualized_volatility: f64,
    /// Non-positive fraction in (−1, 0]
    pub max_drawdown: f64,
    pub var_light: f64,
    pub expected_shortfall: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct InstrumentStats {
    pub ticker: String,
    pub weight: f64,
    pub total_return: f64,
    pub annualized_volatility: f64,
    pub max_drawdown: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RiskFlag {
    pub code: String,
    pub severity: Severity,
    pub message: String,
}

/// One point of the cumulative equity curve (start value = 1.0).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EquityPoint {
    pub date: NaiveDate,
    pub equity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PortfolioAnalysis {
    pub from_date: NaiveDate,
    pub to_date: NaiveDate,
    pub base_currency: String,
    pub trading_days: usize,
    pub totals: Totals,
    pub per_instrument: Vec<InstrumentStats>,
    pub concentrations: Concentrations,
    pub stress_scenarios: Vec<StressResult>,
    pub flags: Vec<RiskFlag>,
    pub equity_curve: Vec<EquityPoint>,
}

/// Run the full analysis over prefetched per-ticker series. Series order
/// must match `req.positions` order; the arithmetic order is fixed so the
/// same input always produces bit-identical output.
pub fn analyze(
    series: &[(String, Vec<OhlcvBar>)],
    req: &AnalyzeRequest,
) -> Result<PortfolioAnalysis, RiskError> {
    validate_portfolio(&req.positions)?;
    if series.len() != req.positions.len() {
        return Err(RiskError::InvalidPortfolio(format!(
            "{} price series for {} positions",
            series.len(),
            req.positions.len()
        )));
    }

    let aligned = align_returns(series)?;
    let weights: Vec<f64> = req.positions.iter().map(|p| p.weight).collect();
    let portfolio_r = portfolio_returns(&aligned, &weights, req.rebalance);

    let var_cfg = req.var_config.clone().unwrap_or_default();
    let VarLight {
        var,
        expected_shortfall,
        ..
    } = var_light(&portfolio_r, &var_cfg);

    let totals = Totals {
        value: req.total_portfolio_value,
        total_return: total_return(&portfolio_r),
        annualized_volatility: annualized_volatility(&portfolio_r),
        max_drawdown: max_drawdown(&portfolio_r),
        var_light: var,
        expected_shortfall,
    };

    let per_instrument: Vec<InstrumentStats> = req
        .positions
        .iter()
        .enumerate()
        .map(|(i, p)| InstrumentStats {
            ticker: p.ticker.clone(),
            weight: p.weight,
            total_return: total_return(&aligned.returns[i]),
            annualized_volatility: annualized_volatility(&aligned.returns[i]),
            max_drawdown: max_drawdown(&aligned.returns[i]),
        })
        .collect();

    let conc = concentrations(&req.positions);

    let aggregates = req.aggregates.clone().unwrap_or_default();
    let expo = exposures(&req.positions);
    let mut scenario_specs = canonical_scenarios();
    if let Some(extra) = &req.stress_scenarios {
        let known: Vec<String> = scenario_specs.iter().map(|s| s.name.clone()).collect();
        scenario_specs.extend(
            extra
                .iter()
                .filter(|s| !known.contains(&s.name))
                .cloned(),
        );
    }
    let stress = run_scenarios(
        &scenario_specs,
        &expo,
        &aggregates,
        req.total_portfolio_value,
        req.covenant_limits.as_ref(),
    );

    let flags = build_flags(&conc, var, req.risk_prefs.as_ref());

    let curve: Vec<EquityPoint> = aligned
        .dates
        .iter()
        .zip(equity_curve(&portfolio_r))
        .map(|(date, equity)| EquityPoint {
            date: *date,
            equity,
        })
        .collect();

    Ok(PortfolioAnalysis {
        from_date: req.from_date,
        to_date: req.to_date,
        base_currency: req.base_currency.clone(),
        trading_days: aligned.len(),
        totals,
        per_instrument,
        concentrations: conc,
        stress_scenarios: stress,
        flags,
        equity_curve: curve,
    })
}

fn build_flags(conc: &Concentrations, var: f64, prefs: Option<&RiskPrefs>) -> Vec<RiskFlag> {
    let mut flags = Vec::new();

    let top1_limit = prefs
        .and_then(|p| p.max_top1_pct)
        .unwrap_or(DEFAULT_TOP1_FLAG_PCT);
    if conc.top1_pct > top1_limit {
        flags.push(RiskFlag {
            code: "CONCENTRATION_TOP1".to_string(),
            severity: Severity::Warning,
            message: format!(
                "largest position is {:.1}% of the portfolio (threshold {top1_limit:.1}%)",
                conc.top1_pct
            ),
        });
    }

    let hhi_limit = prefs.and_then(|p| p.max_hhi).unwrap_or(DEFAULT_HHI_FLAG);
    if conc.hhi > hhi_limit {
        flags.push(RiskFlag {
            code: "CONCENTRATION_HHI".to_string(),
            severity: Severity::Warning,
            message: format!("HHI {:.3} exceeds threshold {hhi_limit:.3}", conc.hhi),
        });
    }

    if let Some(max_var) = prefs.and_then(|p| p.max_var_light) {
        if var > max_var {
            flags.push(RiskFlag {
                code: "VAR_LIMIT".to_string(),
                severity: Severity::Critical,
                message: format!(
                    "1-day VaR {:.2}% exceeds the configured limit {:.2}%",
                    var * 100.0,
                    max_var * 100.0
                ),
            });
        }
    }

    flags
}
