//! Re-planning behaviour: a too-large window fails once, is halved by the
//! basic strategy and succeeds on the second attempt.

use chrono::NaiveDate;
use tokio_util::sync::CancellationToken;

use moex_agent_mcp::agent::service::{A2aRequest, ChatMessage};

mod common;
use common::make_agent;

fn request(text: &str) -> A2aRequest {
    A2aRequest {
        messages: vec![ChatMessage {
            role: "user".to_string(),
            content: text.to_string(),
        }],
        locale: Some("en".to_string()),
        user_role: Some("analyst".to_string()),
        session_id: Some("replan-test".to_string()),
        metadata: None,
        debug: Some(true),
    }
}

#[tokio::test]
async fn date_range_failure_is_replanned_and_succeeds() {
    // Fixture data covers the whole span, so only the 730-day lookback
    // guard fails the first attempt.
    let from = NaiveDate::from_ymd_opt(2018, 1, 1).unwrap();
    let to = NaiveDate::from_ymd_opt(2024, 12, 31).unwrap();
    let agent = make_agent(&["SBER", "GAZP"], from, to);

    let response = agent
        .handle(
            request("Portfolio risk for SBER=50%, GAZP=50% over 2018-01-01..2024-12-31"),
            None,
            CancellationToken::new(),
        )
        .await;

    let output = response.output;
    assert!(
        output.error_message.is_none(),
        "second attempt should succeed: {:?}",
        output.error_message
    );

    let debug = output.debug.expect("debug requested");
    let steps = &debug.execution.steps;

    // First executed step is the failed analyze call
    assert_eq!(steps[0].tool, "analyze_portfolio_risk");
    assert_eq!(
        steps[0].error_category,
        Some(moex_agent_mcp::error::ErrorCategory::DateRangeTooLarge)
    );

    // A later analyze attempt completed fine
    let retried = steps
        .iter()
        .skip(1)
        .find(|s| s.tool == "analyze_portfolio_risk")
        .expect("re-planned analyze step");
    assert_eq!(
        retried.status,
        moex_agent_mcp::agent::session::StepStatus::Ok
    );
    assert!(!debug.execution.has_fatal_error);
}

#[tokio::test]
async fn replan_gives_up_after_attempt_budget() {
    // No data at all: every attempt fails with INVALID_TICKER until the
    // rewrite runs out of tickers or attempts.
    let from = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    let to = NaiveDate::from_ymd_opt(2024, 12, 1).unwrap();
    let agent = make_agent(&["SBER"], from, to);

    let response = agent
        .handle(
            request("Portfolio risk for AAAA=50%, BBBB=50% over 2024-01-01..2024-11-01"),
            None,
            CancellationToken::new(),
        )
        .await;

    assert!(response.output.error_message.is_some());
    let debug = response.output.debug.unwrap();
    assert!(debug.execution.has_fatal_error);
    // At most one basic re-plan was attempted: 2 plans × 2 steps
    assert!(debug.execution.steps.len() <= 4);
}
