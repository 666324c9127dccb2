//! CFO liquidity report: bucket weights, coverage ratios, stress reuse
//! and recommendations.

use garde::Validate;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::RiskError;

use super::stress::{
    canonical_scenarios, exposures, run_scenarios, Aggregates, CovenantLimits, StressResult,
    StressScenarioSpec,
};
use super::{validate_portfolio, LiquidityBucket, Position};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
pub struct LiquidityRequest {
    #[garde(length(min = 1), dive)]
    pub positions: Vec<Position>,
    /// Liabilities due within 30 days, as a fraction of portfolio value
    #[garde(inner(range(min = 0.0, max = 10.0)))]
    pub short_term_liabilities_pct: Option<f64>,
    #[garde(dive)]
    pub aggregates: Option<Aggregates>,
    #[garde(dive)]
    pub stress_scenarios: Option<Vec<StressScenarioSpec>>,
    #[garde(dive)]
    pub covenant_limits: Option<CovenantLimits>,
    #[garde(inner(range(min = 0.0)))]
    pub total_portfolio_value: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BucketWeight {
    pub bucket: LiquidityBucket,
    pub weight_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LiquidityReport {
    pub buckets: Vec<BucketWeight>,
    /// 0-7d weight over short-term liabilities (or the raw share when no
    /// liabilities are given)
    pub quick_ratio: f64,
    /// ≤ 30d weight over short-term liabilities (same convention)
    pub short_term_ratio: f64,
    pub stress_scenarios: Vec<StressResult>,
    pub recommendations: Vec<String>,
}

pub fn build_liquidity_report(req: &LiquidityRequest) -> Result<LiquidityReport, RiskError> {
    validate_portfolio(&req.positions)?;

    let mut bucket_weights = [0.0f64; 4];
    for p in &req.positions {
        let bucket = p
            .liquidity_bucket
            .unwrap_or_else(|| LiquidityBucket::default_for(p.asset_class));
        let slot = match bucket {
            LiquidityBucket::Within7d => 0,
            LiquidityBucket::Within30d => 1,
            LiquidityBucket::Within90d => 2,
            LiquidityBucket::Over90d => 3,
        };
        bucket_weights[slot] += p.weight;
    }

    let buckets = vec![
        BucketWeight {
            bucket: LiquidityBucket::Within7d,
            weight_pct: bucket_weights[0] * 100.0,
        },
        BucketWeight {
            bucket: LiquidityBucket::Within30d,
            weight_pct: bucket_weights[1] * 100.0,
        },
        BucketWeight {
            bucket: LiquidityBucket::Within90d,
            weight_pct: bucket_weights[2] * 100.0,
        },
        BucketWeight {
            bucket: LiquidityBucket::Over90d,
            weight_pct: bucket_weights[3] * 100.0,
        },
    ];

    let quick = bucket_weights[0];
    let short_term = bucket_weights[0] + bucket_weights[1];
    let (quick_ratio, short_term_ratio) = match req.short_term_liabilities_pct {
        Some(liabilities) if liabilities > 0.0 => (quick / liabilities, short_term / liabilities),
        _ => (quick, short_term),
    };

    let aggregates = req.aggregates.clone().unwrap_or_default();
    let expo = exposures(&req.positions);
    let mut specs = canonical_scenarios();
    if let Some(extra) = &req.stress_scenarios {
        let known: Vec<String> = specs.iter().map(|s| s.name.clone()).collect();
        specs.extend(extra.iter().filter(|s| !known.contains(&s.name)).cloned());
    }
    let stress = run_scenarios(
        &specs,
        &expo,
        &aggregates,
        req.total_portfolio_value,
        req.covenant_limits.as_ref(),
    );

    let recommendations =
        build_recommendations(&bucket_weights, quick_ratio, req.short_term_liabilities_pct, &stress);

    Ok(LiquidityReport {
        buckets,
        quick_ratio,
        short_term_ratio,
        stress_scenarios: stress,
        recommendations,
    })
}

fn build_recommendations(
    bucket_weights: &[f64; 4],
    quick_ratio: f64,
    liabilities: Option<f64>,
    stress: &[StressResult],
) -> Vec<String> {
    let mut out = Vec::new();

    if liabilities.is_some_and(|l| l > 0.0) && quick_ratio < 1.0 {
        out.push(format!(
            "quick ratio {quick_ratio:.2} is below 1.0: liquid assets do not cover short-term liabilities"
        ));
    }
    if bucket_weights[0] < 0.05 {
        out.push(format!(
            "only {:.1}% of the portfolio is liquid within a week; consider a larger cash buffer",
            bucket_weights[0] * 100.0
        ));
    }
    if bucket_weights[3] > 0.50 {
        out.push(format!(
            "{:.1}% of the portfolio takes over 90 days to liquidate; consider reducing long-dated holdings",
            bucket_weights[3] * 100.0
        ));
    }
    let worst = stress
        .iter()
        .min_by(|a, b| a.pnl_pct.partial_cmp(&b.pnl_pct).unwrap_or(std::cmp::Ordering::Equal));
    if let Some(worst) = worst {
        if worst.pnl_pct < -0.10 {
            out.push(format!(
                "scenario {} loses {:.1}% of portfolio value; review hedges",
                worst.scenario,
                -worst.pnl_pct * 100.0
            ));
        }
        if !worst.covenant_breaches.is_empty() {
            out.push("covenant breaches under stress; see scenario details".to_string());
        }
    }
    out
}
