//! Concentration measures: top-N weight shares, HHI and groupings.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{issuer_of, Position};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GroupWeight {
    pub key: String,
    pub weight_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Concentrations {
    pub top1_pct: f64,
    pub top3_pct: f64,
    pub top5_pct: f64,
    /// Herfindahl–Hirschman index on weight fractions
    pub hhi: f64,
    pub by_asset_class: Vec<GroupWeight>,
    pub by_issuer: Vec<GroupWeight>,
    pub by_currency: Vec<GroupWeight>,
}

fn top_n_pct(sorted_desc: &[f64], n: usize) -> f64 {
    sorted_desc.iter().take(n).sum::<f64>() * 100.0
}

fn group_weights<F>(positions: &[Position], key_of: F) -> Vec<GroupWeight>
where
    F: Fn(&Position) -> String,
{
    let mut groups: BTreeMap<String, f64> = BTreeMap::new();
    for p in positions {
        *groups.entry(key_of(p)).or_insert(0.0) += p.weight;
    }
    let mut out: Vec<GroupWeight> = groups
        .into_iter()
        .map(|(key, w)| GroupWeight {
            key,
            weight_pct: w * 100.0,
        })
        .collect();
    out.sort_by(|a, b| {
        b.weight_pct
            .partial_cmp(&a.weight_pct)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.key.cmp(&b.key))
    });
    out
}

pub fn concentrations(positions: &[Position]) -> Concentrations {
    let mut weights: Vec<f64> = positions.iter().map(|p| p.weight).collect();
    weights.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

    Concentrations {
        top1_pct: top_n_pct(&weights, 1),
        top3_pct: top_n_pct(&weights, 3),
        top5_pct: top_n_pct(&weights, 5),
        hhi: weights.iter().map(|w| w * w).sum(),
        by_asset_class: group_weights(positions, |p| p.asset_class.as_str().to_string()),
        by_issuer: group_weights(positions, |p| {
            issuer_of(&p.ticker, p.issuer.as_deref())
        }),
        by_currency: group_weights(positions, |p| {
            p.currency
                .as_deref()
                .unwrap_or("RUB")
                .to_uppercase()
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::AssetClass;

    #[test]
    fn equal_weights_yield_expected_top_n_and_hhi() {
        let positions: Vec<Position> = ["SBER", "GAZP", "LKOH", "ROSN"]
            .iter()
            .map(|t| Position::new(t, 0.25, AssetClass::Equity))
            .collect();
        let c = concentrations(&positions);
        assert!((c.top1_pct - 25.0).abs() < 1e-10);
        assert!((c.top3_pct - 75.0).abs() < 1e-10);
        assert!((c.top5_pct - 100.0).abs() < 1e-10);
        assert!((c.hhi - 0.25).abs() < 1e-12);
    }

    #[test]
    fn preferred_and_ordinary_shares_group_into_one_issuer() {
        let positions = vec![
            Position::new("SBER", 0.4, AssetClass::Equity),
            Position::new("SBERP", 0.3, AssetClass::Equity),
            Position::new("GAZP", 0.3, AssetClass::Equity),
        ];
        let c = concentrations(&positions);
        assert_eq!(c.by_issuer[0].key, "SBER");
        assert!((c.by_issuer[0].weight_pct - 70.0).abs() < 1e-10);
    }

    #[test]
    fn currency_groups_default_to_rub() {
        let mut usd = Position::new("FXUS", 0.4, AssetClass::Fx);
        usd.currency = Some("USD".to_string());
        let positions = vec![usd, Position::new("SBER", 0.6, AssetClass::Equity)];
        let c = concentrations(&positions);
        assert_eq!(c.by_currency[0].key, "RUB");
        assert_eq!(c.by_currency[1].key, "USD");
    }

    #[test]
    fn asset_class_grouping_sorted_by_weight() {
        let positions = vec![
            Position::new("SBER", 0.2, AssetClass::Equity),
            Position::new("OFZ1", 0.5, AssetClass::FixedIncome),
            Position::new("CASH", 0.3, AssetClass::Cash),
        ];
        let c = concentrations(&positions);
        assert_eq!(c.by_asset_class[0].key, "fixed_income");
        assert_eq!(c.by_asset_class[1].key, "cash");
        assert_eq!(c.by_asset_class[2].key, "equity");
    }
}
