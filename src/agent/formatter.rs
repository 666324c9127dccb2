//! Response assembly: narrative text, deterministic tables, dashboard and
//! debug payload built from accumulated tool results.
//!
//! The narrative is produced by the LLM when one is configured, strictly
//! constrained to the labelled tool-result JSON; without an LLM (or on
//! any LLM failure) a deterministic summary citing the same numbers is
//! used instead, so the agent works offline.

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::risk::liquidity::LiquidityReport;
use crate::risk::portfolio::PortfolioAnalysis;
use crate::risk::rebalance::RebalanceResult;

use super::dashboard::{build_dashboard, RiskDashboardSpec};
use super::llm::ChatClient;
use super::scenario::ScenarioType;
use super::session::{PlanExecutionResult, SessionContext};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OutputTable {
    pub id: String,
    pub title: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DebugInfo {
    pub plan: Value,
    pub execution: PlanExecutionResult,
    pub errors: Vec<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AgentOutput {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tables: Option<Vec<OutputTable>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dashboard: Option<RiskDashboardSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<DebugInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

const NARRATIVE_SYSTEM: &str = "You are a MOEX financial analyst writing for a business user. \
Write a concise narrative in the user's language. Cite ONLY numbers present in the TOOL_RESULTS \
JSON below; never invent figures. Do not output JSON or markdown tables.";

/// Probe tool results, in step order, for the first object carrying a
/// marker key and deserialize it.
fn find_typed<T: DeserializeOwned>(session: &SessionContext, marker: &str) -> Option<T> {
    let mut step_ids: Vec<_> = session.tool_results.keys().copied().collect();
    step_ids.sort_unstable();
    for id in step_ids {
        let value = &session.tool_results[&id];
        if value.get(marker).is_some() {
            if let Ok(typed) = serde_json::from_value(value.clone()) {
                return Some(typed);
            }
        }
    }
    None
}

fn labelled_results(session: &SessionContext) -> Value {
    let mut step_ids: Vec<_> = session.tool_results.keys().copied().collect();
    step_ids.sort_unstable();
    let mut out = serde_json::Map::new();
    for id in step_ids {
        let tool = session
            .executed
            .iter()
            .find(|s| s.step_id == id)
            .map_or("unknown", |s| s.tool.as_str());
        out.insert(format!("step_{id}_{tool}"), session.tool_results[&id].clone());
    }
    Value::Object(out)
}

pub async fn format_response(
    session: &SessionContext,
    scenario: ScenarioType,
    llm: Option<&dyn ChatClient>,
    execution: &PlanExecutionResult,
) -> AgentOutput {
    let analysis: Option<PortfolioAnalysis> = find_typed(session, "totals");
    let rebalance: Option<RebalanceResult> = find_typed(session, "trades");
    let liquidity: Option<LiquidityReport> = find_typed(session, "buckets");
    let snapshot: Option<Value> = find_typed(session, "last_price");

    let tables = build_tables(analysis.as_ref(), rebalance.as_ref(), snapshot.as_ref());

    let base_currency = analysis
        .as_ref()
        .map_or("RUB", |a| a.base_currency.as_str());
    let dashboard = build_dashboard(
        scenario,
        base_currency,
        Some(session.session_id.as_str()),
        analysis.as_ref(),
        rebalance.as_ref(),
        liquidity.as_ref(),
    );

    let fallback = deterministic_text(
        scenario,
        analysis.as_ref(),
        rebalance.as_ref(),
        liquidity.as_ref(),
        snapshot.as_ref(),
        execution,
    );
    let text = match llm {
        Some(llm) if !session.tool_results.is_empty() => {
            let user = format!(
                "User request: {}\nScenario: {}\nTOOL_RESULTS:\n{}",
                session.query,
                scenario.as_str(),
                labelled_results(session),
            );
            match llm.complete(NARRATIVE_SYSTEM, &user).await {
                Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
                _ => {
                    tracing::warn!("LLM narrative failed, using deterministic text");
                    fallback
                }
            }
        }
        _ => fallback,
    };

    // Only a fatal outcome surfaces as an error; a step history that was
    // repaired by a re-plan does not. The most recent error is the one
    // that aborted the run.
    let error_message = if execution.has_fatal_error {
        execution
            .steps
            .iter()
            .rev()
            .find(|step| step.status == super::session::StepStatus::Error)
            .map(|step| {
                format!(
                    "{}: step '{}' failed: {}",
                    step.error_category
                        .map_or("UNKNOWN", |category| category.as_str()),
                    step.tool,
                    step.digest
                )
            })
            .or_else(|| Some("run aborted".to_string()))
    } else {
        None
    };

    let debug = (session.debug || !execution.succeeded()).then(|| DebugInfo {
        plan: session
            .plan
            .as_ref()
            .and_then(|p| serde_json::to_value(p).ok())
            .unwrap_or(Value::Null),
        execution: execution.clone(),
        errors: session.errors.clone(),
        elapsed_ms: session.elapsed_ms(),
    });

    AgentOutput {
        text,
        tables,
        dashboard,
        debug,
        error_message,
    }
}

fn build_tables(
    analysis: Option<&PortfolioAnalysis>,
    rebalance: Option<&RebalanceResult>,
    snapshot: Option<&Value>,
) -> Option<Vec<OutputTable>> {
    let mut tables = Vec::new();

    if let Some(analysis) = analysis {
        tables.push(OutputTable {
            id: "positions".to_string(),
            title: "Positions".to_string(),
            columns: vec![
                "ticker".to_string(),
                "weight_pct".to_string(),
                "return_pct".to_string(),
                "volatility_pct".to_string(),
                "max_drawdown_pct".to_string(),
            ],
            rows: analysis
                .per_instrument
                .iter()
                .map(|p| {
                    vec![
                        json!(p.ticker),
                        json!(round2(p.weight * 100.0)),
                        json!(round2(p.total_return * 100.0)),
                        json!(round2(p.annualized_volatility * 100.0)),
                        json!(round2(p.max_drawdown * 100.0)),
                    ]
                })
                .collect(),
        });
        tables.push(OutputTable {
            id: "stress".to_string(),
            title: "Stress scenarios".to_string(),
            columns: vec![
                "scenario".to_string(),
                "pnl_pct".to_string(),
                "pnl_value".to_string(),
                "covenant_breaches".to_string(),
            ],
            rows: analysis
                .stress_scenarios
                .iter()
                .map(|s| {
                    vec![
                        json!(s.scenario),
                        json!(round2(s.pnl_pct * 100.0)),
                        json!(s.pnl_value),
                        json!(s.covenant_breaches.len()),
                    ]
                })
                .collect(),
        });
    }

    if let Some(rebalance) = rebalance {
        tables.push(OutputTable {
            id: "trades".to_string(),
            title: "Suggested trades".to_string(),
            columns: vec![
                "ticker".to_string(),
                "side".to_string(),
                "weight_delta_pct".to_string(),
                "estimated_value".to_string(),
            ],
            rows: rebalance
                .trades
                .iter()
                .map(|t| {
                    vec![
                        json!(t.ticker),
                        json!(t.side),
                        json!(round2(t.weight_delta * 100.0)),
                        json!(t.estimated_value),
                    ]
                })
                .collect(),
        });
    }

    if let Some(snapshot) = snapshot {
        tables.push(OutputTable {
            id: "snapshot".to_string(),
            title: "Quote".to_string(),
            columns: vec![
                "ticker".to_string(),
                "last_price".to_string(),
                "change_pct".to_string(),
                "volume".to_string(),
            ],
            rows: vec![vec![
                snapshot.get("ticker").cloned().unwrap_or(Value::Null),
                snapshot.get("last_price").cloned().unwrap_or(Value::Null),
                snapshot.get("change_pct").cloned().unwrap_or(Value::Null),
                snapshot.get("volume").cloned().unwrap_or(Value::Null),
            ]],
        });
    }

    (!tables.is_empty()).then_some(tables)
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn deterministic_text(
    scenario: ScenarioType,
    analysis: Option<&PortfolioAnalysis>,
    rebalance: Option<&RebalanceResult>,
    liquidity: Option<&LiquidityReport>,
    snapshot: Option<&Value>,
    execution: &PlanExecutionResult,
) -> String {
    let mut parts: Vec<String> = Vec::new();

    if let Some(a) = analysis {
        parts.push(format!(
            "Over {} trading days ({} to {}) the portfolio returned {:.2}% with annualised \
             volatility of {:.2}% and a maximum drawdown of {:.2}%.",
            a.trading_days,
            a.from_date,
            a.to_date,
            a.totals.total_return * 100.0,
            a.totals.annualized_volatility * 100.0,
            a.totals.max_drawdown * 100.0,
        ));
        parts.push(format!(
            "1-day VaR (95%) is {:.2}% of portfolio value (expected shortfall {:.2}%). \
             The largest position holds {:.1}% of the book (HHI {:.3}).",
            a.totals.var_light * 100.0,
            a.totals.expected_shortfall * 100.0,
            a.concentrations.top1_pct,
            a.concentrations.hhi,
        ));
        if let Some(worst) = a
            .stress_scenarios
            .iter()
            .filter(|s| s.scenario != "base_case")
            .min_by(|x, y| {
                x.pnl_pct
                    .partial_cmp(&y.pnl_pct)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
        {
            parts.push(format!(
                "The harshest stress scenario ({}) moves the portfolio by {:.2}%.",
                worst.scenario,
                worst.pnl_pct * 100.0,
            ));
        }
        for flag in &a.flags {
            parts.push(format!("Flag: {}.", flag.message));
        }
    }

    if let Some(r) = rebalance {
        parts.push(format!(
            "The rebalance suggestion makes {} trades with total turnover {:.1}% and resolves \
             {} concentration issue(s).",
            r.trades.len(),
            r.summary.total_turnover * 100.0,
            r.summary.concentration_issues_resolved,
        ));
        for warning in &r.summary.warnings {
            parts.push(format!("Warning: {warning}."));
        }
    }

    if let Some(l) = liquidity {
        parts.push(format!(
            "Quick ratio {:.2}, short-term coverage {:.2}.",
            l.quick_ratio, l.short_term_ratio,
        ));
        for recommendation in &l.recommendations {
            parts.push(format!("Recommendation: {recommendation}."));
        }
    }

    if let Some(s) = snapshot {
        if let (Some(ticker), Some(price)) = (
            s.get("ticker").and_then(Value::as_str),
            s.get("last_price").and_then(Value::as_f64),
        ) {
            let change = s.get("change_pct").and_then(Value::as_f64).unwrap_or(0.0);
            parts.push(format!(
                "{ticker} last traded at {price:.2} ({change:+.2}% against the previous close).",
            ));
        }
    }

    if parts.is_empty() {
        if let Some(error) = execution.first_error() {
            return format!(
                "The request could not be completed: step '{}' failed ({}).",
                error.tool, error.digest
            );
        }
        return format!(
            "No results were produced for the {} scenario.",
            scenario.as_str()
        );
    }
    parts.join(" ")
}
