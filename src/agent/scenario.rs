//! Scenario catalogue: named plan skeletons the planner materialises.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::plan::StepKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioType {
    SingleSecurityOverview,
    CompareSecurities,
    IndexRiskScan,
    PortfolioRisk,
    PortfolioRiskDrillDown,
    CfoLiquidityReport,
    IssuerPeersCompare,
}

impl ScenarioType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SingleSecurityOverview => "single_security_overview",
            Self::CompareSecurities => "compare_securities",
            Self::IndexRiskScan => "index_risk_scan",
            Self::PortfolioRisk => "portfolio_risk",
            Self::PortfolioRiskDrillDown => "portfolio_risk_drill_down",
            Self::CfoLiquidityReport => "cfo_liquidity_report",
            Self::IssuerPeersCompare => "issuer_peers_compare",
        }
    }

    pub fn all() -> &'static [ScenarioType] {
        &[
            Self::SingleSecurityOverview,
            Self::CompareSecurities,
            Self::IndexRiskScan,
            Self::PortfolioRisk,
            Self::PortfolioRiskDrillDown,
            Self::CfoLiquidityReport,
            Self::IssuerPeersCompare,
        ]
    }
}

impl std::str::FromStr for ScenarioType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or(())
    }
}

/// One slot of a scenario skeleton. The planner fills in concrete
/// arguments; a `fatal` step aborts the plan when it fails.
#[derive(Debug, Clone, Copy)]
pub struct TemplateStep {
    pub kind: StepKind,
    pub tool: &'static str,
    pub fatal: bool,
}

const fn mcp(tool: &'static str, fatal: bool) -> TemplateStep {
    TemplateStep {
        kind: StepKind::McpCall,
        tool,
        fatal,
    }
}

const EXPLAIN: TemplateStep = TemplateStep {
    kind: StepKind::Explanation,
    tool: "compose_answer",
    fatal: false,
};

/// Ordered skeleton for each scenario type.
pub fn template(scenario: ScenarioType) -> &'static [TemplateStep] {
    match scenario {
        ScenarioType::SingleSecurityOverview => {
            const ARR: [TemplateStep; 3] = [
                mcp("get_security_snapshot", true),
                mcp("get_ohlcv_timeseries", false),
                EXPLAIN,
            ];
            &ARR
        }
        ScenarioType::CompareSecurities => {
            // Snapshot steps are repeated per ticker by the planner
            const ARR: [TemplateStep; 3] = [
                mcp("get_security_snapshot", false),
                mcp("compute_correlation_matrix", true),
                EXPLAIN,
            ];
            &ARR
        }
        ScenarioType::IndexRiskScan => {
            const ARR: [TemplateStep; 2] =
                [mcp("get_index_constituents_metrics", true), EXPLAIN];
            &ARR
        }
        ScenarioType::PortfolioRisk => {
            const ARR: [TemplateStep; 2] = [mcp("analyze_portfolio_risk", true), EXPLAIN];
            &ARR
        }
        ScenarioType::PortfolioRiskDrillDown => {
            const ARR: [TemplateStep; 3] = [
                mcp("analyze_portfolio_risk", true),
                mcp("compute_correlation_matrix", false),
                EXPLAIN,
            ];
            &ARR
        }
        ScenarioType::CfoLiquidityReport => {
            const ARR: [TemplateStep; 2] =
                [mcp("build_cfo_liquidity_report", true), EXPLAIN];
            &ARR
        }
        ScenarioType::IssuerPeersCompare => {
            const ARR: [TemplateStep; 3] = [
                mcp("get_security_snapshot", false),
                mcp("compute_correlation_matrix", true),
                EXPLAIN,
            ];
            &ARR
        }
    }
}
