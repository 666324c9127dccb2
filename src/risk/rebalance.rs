//! Deterministic constraint-driven rebalancing (`suggest_rebalance`).
//!
//! The heuristic runs in bounded passes: cap violators shed weight into an
//! excess pool, the pool is redistributed to positions with headroom
//! (underweight asset classes first when class targets exist), and finally
//! all deltas are scaled down if the implied turnover exceeds the budget.
//! Constraints that survive the turnover cap are reported as warnings, not
//! failures. Ties sort lexicographically by ticker so output is stable.

use garde::Validate;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::error::RiskError;

use super::{issuer_of, AssetClass, WEIGHT_SUM_TOLERANCE};

const EPS: f64 = 1e-9;
const MAX_DISTRIBUTION_ROUNDS: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
pub struct RebalancePosition {
    #[garde(length(min = 1, max = 12), pattern(r"^[A-Za-z0-9.\-]+$"))]
    pub ticker: String,
    #[garde(range(min = 0.0, max = 1.0))]
    pub current_weight: f64,
    #[serde(default = "default_class")]
    #[garde(skip)]
    pub asset_class: AssetClass,
    #[garde(inner(length(min = 1, max = 64)))]
    pub issuer: Option<String>,
}

fn default_class() -> AssetClass {
    AssetClass::Equity
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, Validate)]
pub struct RiskProfile {
    #[garde(inner(range(min = 0.0, max = 1.0)))]
    pub max_single_position_weight: Option<f64>,
    #[garde(inner(range(min = 0.0, max = 1.0)))]
    pub max_issuer_weight: Option<f64>,
    #[garde(inner(range(min = 0.0, max = 1.0)))]
    pub max_turnover: Option<f64>,
    /// Hard per-class ceilings
    #[serde(default)]
    #[garde(skip)]
    pub max_asset_class_weights: BTreeMap<AssetClass, f64>,
    /// Soft per-class targets the heuristic steers towards
    #[serde(default)]
    #[garde(skip)]
    pub target_asset_class_weights: BTreeMap<AssetClass, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
pub struct RebalanceRequest {
    #[garde(length(min = 1), dive)]
    pub positions: Vec<RebalancePosition>,
    #[garde(inner(range(min = 0.0)))]
    pub total_portfolio_value: Option<f64>,
    #[garde(dive)]
    pub risk_profile: RiskProfile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Trade {
    pub ticker: String,
    pub side: TradeSide,
    /// Signed weight change (negative for sells)
    pub weight_delta: f64,
    pub estimated_value: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TargetWeight {
    pub ticker: String,
    pub current_weight: f64,
    pub target_weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RebalanceSummary {
    /// `½·Σ|target − current|`
    pub total_turnover: f64,
    pub concentration_issues_resolved: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RebalanceResult {
    pub targets: Vec<TargetWeight>,
    pub trades: Vec<Trade>,
    pub summary: RebalanceSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Constraint {
    Single(String),
    Issuer(String),
    ClassCap(AssetClass),
}

impl Constraint {
    fn describe(&self, profile: &RiskProfile) -> String {
        match self {
            Self::Single(ticker) => format!(
                "{ticker} above max_single_position_weight {:.4}",
                profile.max_single_position_weight.unwrap_or(1.0)
            ),
            Self::Issuer(issuer) => format!(
                "issuer {issuer} above max_issuer_weight {:.4}",
                profile.max_issuer_weight.unwrap_or(1.0)
            ),
            Self::ClassCap(class) => format!(
                "asset class {} above its ceiling {:.4}",
                class.as_str(),
                profile
                    .max_asset_class_weights
                    .get(class)
                    .copied()
                    .unwrap_or(1.0)
            ),
        }
    }
}

struct Book<'a> {
    req: &'a RebalanceRequest,
    issuers: Vec<String>,
}

impl Book<'_> {
    fn violated(&self, constraint: &Constraint, target: &[f64]) -> bool {
        let profile = &self.req.risk_profile;
        match constraint {
            Constraint::Single(ticker) => {
                let cap = profile.max_single_position_weight.unwrap_or(f64::MAX);
                self.req
                    .positions
                    .iter()
                    .zip(target)
                    .any(|(p, w)| p.ticker == *ticker && *w > cap + 1e-6)
            }
            Constraint::Issuer(issuer) => {
                let cap = profile.max_issuer_weight.unwrap_or(f64::MAX);
                let sum: f64 = self
                    .issuers
                    .iter()
                    .zip(target)
                    .filter(|(i, _)| *i == issuer)
                    .map(|(_, w)| *w)
                    .sum();
                sum > cap + 1e-6
            }
            Constraint::ClassCap(class) => {
                let Some(cap) = profile.max_asset_class_weights.get(class) else {
                    return false;
                };
                let sum: f64 = self
                    .req
                    .positions
                    .iter()
                    .zip(target)
                    .filter(|(p, _)| p.asset_class == *class)
                    .map(|(_, w)| *w)
                    .sum();
                sum > *cap + 1e-6
            }
        }
    }

    fn all_constraints(&self, target: &[f64]) -> Vec<Constraint> {
        let profile = &self.req.risk_profile;
        let mut found = Vec::new();

        if let Some(cap) = profile.max_single_position_weight {
            let mut violators: Vec<(usize, f64)> = self
                .req
                .positions
                .iter()
                .enumerate()
                .filter(|(i, _)| target[*i] > cap + EPS)
                .map(|(i, _)| (i, target[i] - cap))
                .collect();
            // Largest excess first, ties by ticker
            violators.sort_by(|a, b| {
                b.1.partial_cmp(&a.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| {
                        self.req.positions[a.0]
                            .ticker
                            .cmp(&self.req.positions[b.0].ticker)
                    })
            });
            found.extend(
                violators
                    .into_iter()
                    .map(|(i, _)| Constraint::Single(self.req.positions[i].ticker.clone())),
            );
        }

        if profile.max_issuer_weight.is_some() {
            let mut groups: Vec<String> = self
                .issuers
                .iter()
                .cloned()
                .collect::<HashSet<_>>()
                .into_iter()
                .collect();
            groups.sort();
            for issuer in groups {
                let c = Constraint::Issuer(issuer);
                if self.violated(&c, target) {
                    found.push(c);
                }
            }
        }

        for class in self.req.risk_profile.max_asset_class_weights.keys() {
            let c = Constraint::ClassCap(*class);
            if self.violated(&c, target) {
                found.push(c);
            }
        }

        found
    }
}

pub fn suggest_rebalance(req: &RebalanceRequest) -> Result<RebalanceResult, RiskError> {
    validate_rebalance_input(req)?;

    let n = req.positions.len();
    let current: Vec<f64> = req.positions.iter().map(|p| p.current_weight).collect();
    let mut target = current.clone();

    let book = Book {
        req,
        issuers: req
            .positions
            .iter()
            .map(|p| issuer_of(&p.ticker, p.issuer.as_deref()))
            .collect(),
    };
    let profile = &req.risk_profile;

    let initial_violations = book.all_constraints(&target);
    let mut pool = 0.0f64;

    // 1. Cap single positions, largest excess first.
    if let Some(cap) = profile.max_single_position_weight {
        let mut violators: Vec<usize> = (0..n).filter(|&i| target[i] > cap + EPS).collect();
        violators.sort_by(|&a, &b| {
            let ea = target[a] - cap;
            let eb = target[b] - cap;
            eb.partial_cmp(&ea)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| req.positions[a].ticker.cmp(&req.positions[b].ticker))
        });
        for i in violators {
            pool += target[i] - cap;
            target[i] = cap;
        }
    }

    // 2. Scale down issuer groups over their cap.
    if let Some(cap) = profile.max_issuer_weight {
        let mut groups: Vec<String> = book
            .issuers
            .iter()
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        groups.sort();
        for issuer in groups {
            let members: Vec<usize> = (0..n).filter(|&i| book.issuers[i] == issuer).collect();
            let sum: f64 = members.iter().map(|&i| target[i]).sum();
            if sum > cap + EPS {
                let factor = cap / sum;
                for &i in &members {
                    pool += target[i] * (1.0 - factor);
                    target[i] *= factor;
                }
            }
        }
    }

    // 3. Scale down asset classes over their ceiling.
    for (class, cap) in &profile.max_asset_class_weights {
        let members: Vec<usize> = (0..n)
            .filter(|&i| req.positions[i].asset_class == *class)
            .collect();
        let sum: f64 = members.iter().map(|&i| target[i]).sum();
        if sum > *cap + EPS {
            let factor = cap / sum;
            for &i in &members {
                pool += target[i] * (1.0 - factor);
                target[i] *= factor;
            }
        }
    }

    // 4. Shed weight from classes above their soft target.
    for (class, class_target) in &profile.target_asset_class_weights {
        let members: Vec<usize> = (0..n)
            .filter(|&i| req.positions[i].asset_class == *class)
            .collect();
        let sum: f64 = members.iter().map(|&i| target[i]).sum();
        if sum > *class_target + EPS {
            let factor = class_target / sum;
            for &i in &members {
                pool += target[i] * (1.0 - factor);
                target[i] *= factor;
            }
        }
    }

    // 5. Redistribute the excess pool.
    let mut warnings = Vec::new();
    pool = distribute(req, &mut target, pool);
    if pool > EPS {
        // No capacity anywhere: spread evenly so the weights still sum to 1.
        for w in &mut target {
            *w += pool / n as f64;
        }
        warnings.push(format!(
            "excess weight {pool:.6} could not be placed within caps and was spread evenly"
        ));
    }

    // 6. Turnover budget: scale every delta down, best effort.
    let mut turnover = half_abs_delta(&current, &target);
    if let Some(max_turnover) = profile.max_turnover {
        if turnover > max_turnover + EPS {
            let scale = if turnover > 0.0 {
                max_turnover / turnover
            } else {
                1.0
            };
            for i in 0..n {
                target[i] = current[i] + (target[i] - current[i]) * scale;
            }
            turnover = half_abs_delta(&current, &target);
        }
    }

    // 7. Report what the turnover budget left unresolved.
    let remaining = book.all_constraints(&target);
    for constraint in &remaining {
        warnings.push(constraint.describe(profile));
    }
    let concentration_issues_resolved = initial_violations
        .iter()
        .filter(|c| !remaining.contains(c))
        .count();

    let targets: Vec<TargetWeight> = req
        .positions
        .iter()
        .zip(&target)
        .map(|(p, &w)| TargetWeight {
            ticker: p.ticker.clone(),
            current_weight: p.current_weight,
            target_weight: w,
        })
        .collect();

    let mut trades: Vec<Trade> = (0..n)
        .filter(|&i| (target[i] - current[i]).abs() > 1e-6)
        .map(|i| {
            let delta = target[i] - current[i];
            Trade {
                ticker: req.positions[i].ticker.clone(),
                side: if delta < 0.0 {
                    TradeSide::Sell
                } else {
                    TradeSide::Buy
                },
                weight_delta: delta,
                estimated_value: req.total_portfolio_value.map(|v| delta * v),
            }
        })
        .collect();
    trades.sort_by(|a, b| a.ticker.cmp(&b.ticker));

    Ok(RebalanceResult {
        targets,
        trades,
        summary: RebalanceSummary {
            total_turnover: turnover,
            concentration_issues_resolved,
            warnings,
        },
    })
}

fn validate_rebalance_input(req: &RebalanceRequest) -> Result<(), RiskError> {
    if req.positions.is_empty() {
        return Err(RiskError::InvalidPortfolio(
            "no positions to rebalance".to_string(),
        ));
    }
    let mut seen = HashSet::new();
    for p in &req.positions {
        if !seen.insert(p.ticker.to_uppercase()) {
            return Err(RiskError::InvalidPortfolio(format!(
                "duplicate ticker: {}",
                p.ticker
            )));
        }
    }
    let sum: f64 = req.positions.iter().map(|p| p.current_weight).sum();
    if (sum - 1.0).abs() >= WEIGHT_SUM_TOLERANCE {
        return Err(RiskError::InvalidPortfolio(format!(
            "current weights sum to {sum:.6}, expected 1"
        )));
    }
    Ok(())
}

fn half_abs_delta(current: &[f64], target: &[f64]) -> f64 {
    0.5 * current
        .iter()
        .zip(target)
        .map(|(c, t)| (t - c).abs())
        .sum::<f64>()
}

/// Headroom a position can still absorb without breaking its own cap or
/// its class ceiling.
fn headroom(req: &RebalanceRequest, target: &[f64], i: usize) -> f64 {
    let profile = &req.risk_profile;
    let mut room = profile
        .max_single_position_weight
        .map_or(f64::MAX, |cap| (cap - target[i]).max(0.0));
    if let Some(cap) = profile
        .max_asset_class_weights
        .get(&req.positions[i].asset_class)
    {
        let class_sum: f64 = req
            .positions
            .iter()
            .zip(target)
            .filter(|(p, _)| p.asset_class == req.positions[i].asset_class)
            .map(|(_, w)| *w)
            .sum();
        room = room.min((cap - class_sum).max(0.0));
    }
    room
}

/// Distribute `pool` over positions with headroom, preferring underweight
/// classes when soft class targets exist. Returns whatever could not be
/// placed.
fn distribute(req: &RebalanceRequest, target: &mut [f64], mut pool: f64) -> f64 {
    let n = req.positions.len();
    let class_targets = &req.risk_profile.target_asset_class_weights;

    for _ in 0..MAX_DISTRIBUTION_ROUNDS {
        if pool <= EPS {
            break;
        }

        // Recipients: positions in underweight classes first when class
        // targets exist, otherwise any position with headroom.
        let underweight_class = |i: usize| -> bool {
            let class = req.positions[i].asset_class;
            class_targets.get(&class).is_none_or(|class_target| {
                let sum: f64 = req
                    .positions
                    .iter()
                    .zip(target.iter())
                    .filter(|(p, _)| p.asset_class == class)
                    .map(|(_, w)| *w)
                    .sum();
                sum < *class_target - EPS
            })
        };

        let mut recipients: Vec<(usize, f64)> = (0..n)
            .filter(|&i| underweight_class(i))
            .map(|i| (i, headroom(req, target, i)))
            .filter(|(_, h)| *h > EPS)
            .collect();
        if recipients.is_empty() {
            // Widen to anything with headroom regardless of class targets
            recipients = (0..n)
                .map(|i| (i, headroom(req, target, i)))
                .filter(|(_, h)| *h > EPS)
                .collect();
        }
        if recipients.is_empty() {
            break;
        }

        let total_headroom: f64 = recipients.iter().map(|(_, h)| h).sum();
        let placeable = pool.min(total_headroom);
        for (i, h) in &recipients {
            let give = placeable * h / total_headroom;
            target[*i] += give;
        }
        pool -= placeable;
    }
    pool
}
