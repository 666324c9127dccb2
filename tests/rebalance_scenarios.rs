//! End-to-end rebalance scenarios through the MCP tool surface.

use serde_json::json;

use moex_agent_mcp::agent::tools::{LocalTransport, ToolTransport};

mod common;
use common::{make_server, window_2024};

async fn call_rebalance(arguments: serde_json::Value) -> serde_json::Value {
    let (from, to) = window_2024();
    let transport = LocalTransport::new(make_server(&["SBER"], from, to));
    transport
        .call("suggest_rebalance", arguments)
        .await
        .expect("suggest_rebalance failed")
}

fn target_weight(result: &serde_json::Value, ticker: &str) -> f64 {
    result["targets"]
        .as_array()
        .unwrap()
        .iter()
        .find(|t| t["ticker"] == ticker)
        .unwrap()["target_weight"]
        .as_f64()
        .unwrap()
}

#[tokio::test]
async fn concentration_reduction_scenario() {
    let result = call_rebalance(json!({
        "positions": [
            {"ticker": "SBER", "current_weight": 0.45},
            {"ticker": "GAZP", "current_weight": 0.20},
            {"ticker": "LKOH", "current_weight": 0.15},
            {"ticker": "ROSN", "current_weight": 0.10},
            {"ticker": "GMKN", "current_weight": 0.10}
        ],
        "total_portfolio_value": 10_000_000.0,
        "risk_profile": {
            "max_single_position_weight": 0.25,
            "max_turnover": 0.30
        }
    }))
    .await;

    assert!(target_weight(&result, "SBER") <= 0.25 + 1e-6);

    let trades = result["trades"].as_array().unwrap();
    let sber_sell = trades
        .iter()
        .find(|t| t["ticker"] == "SBER" && t["side"] == "sell");
    assert!(sber_sell.is_some(), "expected a SELL SBER trade: {trades:?}");

    let turnover = result["summary"]["total_turnover"].as_f64().unwrap();
    assert!(turnover <= 0.30 + 1e-6);
    assert!(
        result["summary"]["concentration_issues_resolved"]
            .as_u64()
            .unwrap()
            >= 1
    );

    // Weights still form a complete portfolio
    let sum: f64 = result["targets"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["target_weight"].as_f64().unwrap())
        .sum();
    assert!((sum - 1.0).abs() < 1e-9);

    // Sell value carries the sign of the delta
    let sell_value = sber_sell.unwrap()["estimated_value"].as_f64().unwrap();
    assert!(sell_value < 0.0);
}

#[tokio::test]
async fn low_turnover_best_effort_scenario() {
    let result = call_rebalance(json!({
        "positions": [
            {"ticker": "SBER", "current_weight": 0.35},
            {"ticker": "GAZP", "current_weight": 0.25},
            {"ticker": "LKOH", "current_weight": 0.20},
            {"ticker": "OFZ", "current_weight": 0.20, "asset_class": "fixed_income"}
        ],
        "risk_profile": {
            "max_single_position_weight": 0.25,
            "max_turnover": 0.05
        }
    }))
    .await;

    let turnover = result["summary"]["total_turnover"].as_f64().unwrap();
    assert!(turnover <= 0.05 + 1e-6);

    let warnings = result["summary"]["warnings"].as_array().unwrap();
    assert!(
        !warnings.is_empty(),
        "unresolved violations must be reported as warnings"
    );
    assert!(warnings
        .iter()
        .any(|w| w.as_str().unwrap().contains("SBER")));

    let sum: f64 = result["targets"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["target_weight"].as_f64().unwrap())
        .sum();
    assert!((sum - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn rebalance_validation_error_in_envelope() {
    let (from, to) = window_2024();
    let transport = LocalTransport::new(make_server(&["SBER"], from, to));
    let err = transport
        .call(
            "suggest_rebalance",
            json!({
                "positions": [
                    {"ticker": "SBER", "current_weight": 0.5},
                    {"ticker": "GAZP", "current_weight": 0.2}
                ],
                "risk_profile": {}
            }),
        )
        .await
        .unwrap_err();
    assert_eq!(
        err.category,
        moex_agent_mcp::error::ErrorCategory::ValidationError
    );
}
