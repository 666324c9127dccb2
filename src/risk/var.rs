//! Historical-simulation Value-at-Risk ("Var_light") and expected
//! shortfall.

use garde::Validate;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

fn default_confidence() -> f64 {
    0.95
}

fn default_horizon_days() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
pub struct VarConfig {
    /// Confidence level (default: 0.95)
    #[serde(default = "default_confidence")]
    #[garde(range(min = 0.5, max = 0.9999))]
    pub confidence: f64,
    /// Horizon in trading days, scaled by √h (default: 1)
    #[serde(default = "default_horizon_days")]
    #[garde(range(min = 1.0, max = 252.0))]
    pub horizon_days: f64,
}

impl Default for VarConfig {
    fn default() -> Self {
        Self {
            confidence: default_confidence(),
            horizon_days: default_horizon_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct VarLight {
    /// Loss quantile as a non-negative fraction of portfolio value
    pub var: f64,
    /// Mean loss beyond the quantile; always ≥ `var`
    pub expected_shortfall: f64,
    pub confidence: f64,
    pub horizon_days: f64,
}

/// Linear-interpolation quantile of an unsorted sample at `p ∈ [0, 1]`.
fn quantile(sorted: &[f64], p: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = p.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = rank - lo as f64;
        sorted[lo] * (1.0 - frac) + sorted[hi] * frac
    }
}

/// Historical VaR: `VaR = −quantile(R, 1−c)·√h`, clamped at 0.
/// ES is the mean loss in the tail at or below the quantile.
pub fn var_light(returns: &[f64], cfg: &VarConfig) -> VarLight {
    if returns.is_empty() {
        return VarLight {
            var: 0.0,
            expected_shortfall: 0.0,
            confidence: cfg.confidence,
            horizon_days: cfg.horizon_days,
        };
    }

    let mut sorted = returns.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let q = quantile(&sorted, 1.0 - cfg.confidence);
    let scale = cfg.horizon_days.sqrt();
    let var = (-q * scale).max(0.0);

    let tail: Vec<f64> = sorted.iter().copied().filter(|r| *r <= q).collect();
    let es = if tail.is_empty() {
        var
    } else {
        let mean_tail = tail.iter().sum::<f64>() / tail.len() as f64;
        (-mean_tail * scale).max(var)
    };

    VarLight {
        var,
        expected_shortfall: es,
        confidence: cfg.confidence,
        horizon_days: cfg.horizon_days,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_is_non_negative_for_any_series() {
        for returns in [
            vec![0.01, 0.02, 0.03],
            vec![-0.05, -0.02, 0.01, 0.04],
            vec![0.0; 10],
        ] {
            let v = var_light(&returns, &VarConfig::default());
            assert!(v.var >= 0.0, "var {} for {returns:?}", v.var);
            assert!(v.expected_shortfall >= v.var);
        }
    }

    #[test]
    fn var_matches_hand_computed_quantile() {
        // 21 values: -0.10, -0.09, …, +0.10. The 5% quantile interpolates
        // between the first two sorted values: rank = 0.05·20 = 1 → -0.09.
        let returns: Vec<f64> = (-10..=10).map(|i| f64::from(i) / 100.0).collect();
        let v = var_light(&returns, &VarConfig::default());
        assert!((v.var - 0.09).abs() < 1e-12);

        // Tail is {-0.10, -0.09}; ES = 0.095
        assert!((v.expected_shortfall - 0.095).abs() < 1e-12);
    }

    #[test]
    fn horizon_scaling() {
        let returns: Vec<f64> = (-10..=10).map(|i| f64::from(i) / 100.0).collect();
        let cfg = VarConfig {
            confidence: 0.95,
            horizon_days: 4.0,
        };
        let v = var_light(&returns, &cfg);
        assert!((v.var - 0.18).abs() < 1e-12, "√4 doubles the 1-day VaR");
    }

    #[test]
    fn all_positive_returns_clamp_to_zero() {
        let v = var_light(&[0.01, 0.02, 0.005, 0.03], &VarConfig::default());
        assert_eq!(v.var, 0.0);
        assert!(v.expected_shortfall >= 0.0);
    }

    #[test]
    fn empty_series_yields_zero() {
        let v = var_light(&[], &VarConfig::default());
        assert_eq!(v.var, 0.0);
        assert_eq!(v.expected_shortfall, 0.0);
    }
}
