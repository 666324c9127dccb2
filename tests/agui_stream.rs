//! AG-UI stream contract over a full agent run.

use tokio_util::sync::CancellationToken;

use moex_agent_mcp::agent::service::{A2aRequest, ChatMessage};
use moex_agent_mcp::agui::{check_stream_contract, concat_deltas, AgUiEvent, StreamWriter};

mod common;
use common::{make_agent, window_2024};

fn request(text: &str) -> A2aRequest {
    A2aRequest {
        messages: vec![ChatMessage {
            role: "user".to_string(),
            content: text.to_string(),
        }],
        locale: None,
        user_role: None,
        session_id: Some("agui-test".to_string()),
        metadata: None,
        debug: None,
    }
}

async fn run_with_stream(query: &str) -> (Vec<AgUiEvent>, String) {
    let (from, to) = window_2024();
    let agent = make_agent(&["SBER", "GAZP", "LKOH"], from, to);

    let cancel = CancellationToken::new();
    let (writer, mut rx) = StreamWriter::channel("run-1".to_string(), cancel.clone());
    let collector = tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    });

    let response = agent.handle(request(query), Some(writer), cancel).await;
    let events = collector.await.unwrap();
    (events, response.output.text)
}

#[tokio::test]
async fn successful_run_emits_ordered_events() {
    let (events, text) =
        run_with_stream("Portfolio risk for SBER=40%, GAZP=30%, LKOH=30% over 2024-01-01..2024-11-01")
            .await;

    check_stream_contract(&events).unwrap();

    let kinds: Vec<&str> = events.iter().map(AgUiEvent::kind).collect();
    assert_eq!(kinds[0], "RUN_STARTED");
    assert_eq!(kinds[1], "TEXT_MESSAGE_START");
    assert!(kinds.contains(&"TEXT_MESSAGE_CONTENT"));
    assert!(kinds.contains(&"STATE_SNAPSHOT"));
    assert_eq!(*kinds.last().unwrap(), "RUN_FINISHED");

    // Delta concatenation reproduces the response text exactly
    assert_eq!(concat_deltas(&events), text);

    // The snapshot carries a valid dashboard
    let snapshot = events
        .iter()
        .find_map(|e| match e {
            AgUiEvent::StateSnapshot { snapshot } => Some(snapshot),
            _ => None,
        })
        .unwrap();
    assert_eq!(snapshot["status"], "done");
    assert_eq!(snapshot["schema_valid"], true);
    assert!(snapshot["dashboard"]["charts"].as_array().is_some());
}

#[tokio::test]
async fn failed_run_ends_with_run_error() {
    let (events, _) = run_with_stream("Portfolio risk for AAAA=100%").await;

    check_stream_contract(&events).unwrap();
    match events.last().unwrap() {
        AgUiEvent::RunError { message, code } => {
            assert!(!message.is_empty());
            assert!(code.is_some());
        }
        other => panic!("expected RUN_ERROR, got {}", other.kind()),
    }

    let snapshot = events
        .iter()
        .find_map(|e| match e {
            AgUiEvent::StateSnapshot { snapshot } => Some(snapshot),
            _ => None,
        })
        .unwrap();
    assert_eq!(snapshot["status"], "error");
}

#[tokio::test]
async fn thread_id_matches_session() {
    let (events, _) =
        run_with_stream("Portfolio risk for SBER=50%, GAZP=50% over 2024-01-01..2024-11-01").await;
    match &events[0] {
        AgUiEvent::RunStarted { thread_id, run_id } => {
            assert_eq!(thread_id, "agui-test");
            assert_eq!(run_id, "run-1");
        }
        other => panic!("expected RUN_STARTED, got {}", other.kind()),
    }
}
