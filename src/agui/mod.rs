//! AG-UI incremental event protocol.
//!
//! One stream per run, written by a single writer over a bounded channel:
//! a stalled client exerts backpressure on the orchestration instead of
//! growing an unbounded buffer, and a disconnected client cancels the
//! run token. Exactly one terminal event is emitted per run.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Bounded event queue per run.
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Size of text deltas streamed through `TEXT_MESSAGE_CONTENT`.
const TEXT_DELTA_CHARS: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgUiEvent {
    #[serde(rename = "RUN_STARTED")]
    RunStarted {
        #[serde(rename = "runId")]
        run_id: String,
        #[serde(rename = "threadId")]
        thread_id: String,
    },
    #[serde(rename = "TEXT_MESSAGE_START")]
    TextMessageStart {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    #[serde(rename = "TEXT_MESSAGE_CONTENT")]
    TextMessageContent {
        #[serde(rename = "messageId")]
        message_id: String,
        delta: String,
    },
    #[serde(rename = "TEXT_MESSAGE_END")]
    TextMessageEnd {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    #[serde(rename = "STATE_SNAPSHOT")]
    StateSnapshot { snapshot: Value },
    #[serde(rename = "RUN_FINISHED")]
    RunFinished {
        #[serde(rename = "runId")]
        run_id: String,
    },
    #[serde(rename = "RUN_ERROR")]
    RunError {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl AgUiEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "RUN_STARTED",
            Self::TextMessageStart { .. } => "TEXT_MESSAGE_START",
            Self::TextMessageContent { .. } => "TEXT_MESSAGE_CONTENT",
            Self::TextMessageEnd { .. } => "TEXT_MESSAGE_END",
            Self::StateSnapshot { .. } => "STATE_SNAPSHOT",
            Self::RunFinished { .. } => "RUN_FINISHED",
            Self::RunError { .. } => "RUN_ERROR",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunFinished { .. } | Self::RunError { .. })
    }
}

/// Single writer for one run's event stream.
pub struct StreamWriter {
    tx: mpsc::Sender<AgUiEvent>,
    run_id: String,
    cancel: CancellationToken,
    terminal_sent: bool,
}

impl StreamWriter {
    /// Create a writer and the receiving end the HTTP layer drains.
    pub fn channel(
        run_id: String,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<AgUiEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        (
            Self {
                tx,
                run_id,
                cancel,
                terminal_sent: false,
            },
            rx,
        )
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Send one event. Returns false when the client is gone, in which
    /// case the run token is cancelled and the stream closed for good.
    async fn send(&mut self, event: AgUiEvent) -> bool {
        if self.terminal_sent {
            return false;
        }
        let terminal = event.is_terminal();
        if self.tx.send(event).await.is_err() {
            tracing::debug!("AG-UI client disconnected, cancelling run {}", self.run_id);
            self.terminal_sent = true;
            self.cancel.cancel();
            return false;
        }
        if terminal {
            self.terminal_sent = true;
        }
        true
    }

    pub async fn run_started(&mut self, thread_id: &str) {
        let event = AgUiEvent::RunStarted {
            run_id: self.run_id.clone(),
            thread_id: thread_id.to_string(),
        };
        self.send(event).await;
    }

    /// Stream a full text as START / CONTENT deltas / END with a fresh
    /// message id. Concatenating the deltas reproduces `text` exactly.
    pub async fn stream_text(&mut self, text: &str) {
        let message_id = Uuid::new_v4().to_string();
        if !self
            .send(AgUiEvent::TextMessageStart {
                message_id: message_id.clone(),
            })
            .await
        {
            return;
        }

        let chars: Vec<char> = text.chars().collect();
        for chunk in chars.chunks(TEXT_DELTA_CHARS) {
            let delta: String = chunk.iter().collect();
            if !self
                .send(AgUiEvent::TextMessageContent {
                    message_id: message_id.clone(),
                    delta,
                })
                .await
            {
                return;
            }
        }

        self.send(AgUiEvent::TextMessageEnd { message_id }).await;
    }

    /// Idempotent state snapshot; the last one wins on the client.
    pub async fn snapshot(&mut self, snapshot: Value) {
        self.send(AgUiEvent::StateSnapshot { snapshot }).await;
    }

    pub async fn finish(&mut self) {
        let event = AgUiEvent::RunFinished {
            run_id: self.run_id.clone(),
        };
        self.send(event).await;
    }

    pub async fn error(&mut self, message: &str, code: Option<&str>) {
        self.send(AgUiEvent::RunError {
            message: message.to_string(),
            code: code.map(str::to_string),
        })
        .await;
    }
}

/// Check the protocol contract over a finished stream: `RUN_STARTED`
/// first, balanced START/END with CONTENT in between, exactly one
/// terminal event at the end.
pub fn check_stream_contract(events: &[AgUiEvent]) -> Result<(), String> {
    if events.is_empty() {
        return Err("empty stream".to_string());
    }
    if !matches!(events[0], AgUiEvent::RunStarted { .. }) {
        return Err(format!("first event is {}", events[0].kind()));
    }

    let mut open: Option<&str> = None;
    let mut seen_messages: Vec<String> = Vec::new();
    let mut terminal = 0usize;
    for (i, event) in events.iter().enumerate() {
        if i > 0 && matches!(event, AgUiEvent::RunStarted { .. }) {
            return Err("duplicate RUN_STARTED".to_string());
        }
        match event {
            AgUiEvent::TextMessageStart { message_id } => {
                if open.is_some() {
                    return Err("nested TEXT_MESSAGE_START".to_string());
                }
                if seen_messages.contains(message_id) {
                    return Err(format!("message id {message_id} reused"));
                }
                seen_messages.push(message_id.clone());
                open = Some(message_id);
            }
            AgUiEvent::TextMessageContent { message_id, .. } => {
                if open != Some(message_id.as_str()) {
                    return Err("TEXT_MESSAGE_CONTENT outside its message".to_string());
                }
            }
            AgUiEvent::TextMessageEnd { message_id } => {
                if open != Some(message_id.as_str()) {
                    return Err("TEXT_MESSAGE_END without matching START".to_string());
                }
                open = None;
            }
            AgUiEvent::RunFinished { .. } | AgUiEvent::RunError { .. } => {
                terminal += 1;
                if i != events.len() - 1 {
                    return Err("terminal event not last".to_string());
                }
            }
            AgUiEvent::RunStarted { .. } | AgUiEvent::StateSnapshot { .. } => {}
        }
    }
    if open.is_some() {
        return Err("unterminated text message".to_string());
    }
    if terminal != 1 {
        return Err(format!("{terminal} terminal events"));
    }
    Ok(())
}

/// Concatenate all text deltas in arrival order.
pub fn concat_deltas(events: &[AgUiEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            AgUiEvent::TextMessageContent { delta, .. } => Some(delta.as_str()),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(mut rx: mpsc::Receiver<AgUiEvent>) -> Vec<AgUiEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn happy_path_stream_satisfies_contract() {
        let cancel = CancellationToken::new();
        let (mut writer, rx) = StreamWriter::channel("run-1".to_string(), cancel);

        let text = "Портфель вырос на 10% за период.".repeat(5);
        let expected = text.clone();
        let handle = tokio::spawn(drain(rx));

        writer.run_started("thread-1").await;
        writer.stream_text(&text).await;
        writer.snapshot(serde_json::json!({"status": "done"})).await;
        writer.finish().await;
        drop(writer);

        let events = handle.await.unwrap();
        check_stream_contract(&events).unwrap();
        assert_eq!(concat_deltas(&events), expected);
        assert!(matches!(events.last().unwrap(), AgUiEvent::RunFinished { .. }));
    }

    #[tokio::test]
    async fn only_one_terminal_event() {
        let cancel = CancellationToken::new();
        let (mut writer, rx) = StreamWriter::channel("run-2".to_string(), cancel);
        let handle = tokio::spawn(drain(rx));

        writer.run_started("t").await;
        writer.error("boom", Some("UNKNOWN")).await;
        writer.finish().await; // must be ignored
        drop(writer);

        let events = handle.await.unwrap();
        check_stream_contract(&events).unwrap();
        assert!(matches!(events.last().unwrap(), AgUiEvent::RunError { .. }));
    }

    #[tokio::test]
    async fn disconnect_cancels_run_token() {
        let cancel = CancellationToken::new();
        let (mut writer, rx) = StreamWriter::channel("run-3".to_string(), cancel.clone());
        drop(rx);

        writer.run_started("t").await;
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn serde_wire_shape() {
        let event = AgUiEvent::RunStarted {
            run_id: "r".to_string(),
            thread_id: "t".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "RUN_STARTED");
        assert_eq!(json["runId"], "r");
        assert_eq!(json["threadId"], "t");

        let event = AgUiEvent::TextMessageContent {
            message_id: "m".to_string(),
            delta: "abc".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "TEXT_MESSAGE_CONTENT");
        assert_eq!(json["messageId"], "m");
        assert_eq!(json["delta"], "abc");
    }

    #[test]
    fn contract_rejects_bad_streams() {
        let bad = vec![AgUiEvent::RunFinished {
            run_id: "r".to_string(),
        }];
        assert!(check_stream_contract(&bad).is_err());

        let unbalanced = vec![
            AgUiEvent::RunStarted {
                run_id: "r".to_string(),
                thread_id: "t".to_string(),
            },
            AgUiEvent::TextMessageStart {
                message_id: "m".to_string(),
            },
            AgUiEvent::RunFinished {
                run_id: "r".to_string(),
            },
        ];
        assert!(check_stream_contract(&unbalanced).is_err());
    }
}
