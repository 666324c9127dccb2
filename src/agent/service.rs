//! Agent request lifecycle: A2A envelope in, plan → execute → re-plan
//! loop, formatted output and optional AG-UI event stream out.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agui::StreamWriter;
use crate::config::AgentConfig;
use crate::error::ErrorCategory;

use super::formatter::{format_response, AgentOutput};
use super::llm::ChatClient;
use super::orchestrator::Orchestrator;
use super::plan::validate_plan;
use super::planner::{plan_limits, PlannerStrategy};
use super::session::{PlanExecutionResult, SessionContext};
use super::tools::ToolTransport;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct A2aRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub user_role: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub debug: Option<bool>,
}

impl A2aRequest {
    /// The query is the newest user-authored message.
    pub fn latest_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct A2aResponse {
    pub output: AgentOutput,
    pub session_id: String,
}

pub struct AgentService {
    cfg: AgentConfig,
    transport: Arc<dyn ToolTransport>,
    planner: Arc<dyn PlannerStrategy>,
    llm: Option<Arc<dyn ChatClient>>,
}

impl AgentService {
    pub fn new(
        cfg: AgentConfig,
        transport: Arc<dyn ToolTransport>,
        planner: Arc<dyn PlannerStrategy>,
        llm: Option<Arc<dyn ChatClient>>,
    ) -> Self {
        Self {
            cfg,
            transport,
            planner,
            llm,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.cfg
    }

    /// Run one request end to end. When `events` is given the AG-UI
    /// stream is fed incrementally; the response body is returned either
    /// way.
    pub async fn handle(
        &self,
        request: A2aRequest,
        mut events: Option<StreamWriter>,
        cancel: CancellationToken,
    ) -> A2aResponse {
        let session_id = request
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if let Some(writer) = events.as_mut() {
            writer.run_started(&session_id).await;
        }

        let Some(query) = request.latest_user_message().map(str::to_string) else {
            let output = AgentOutput {
                text: "The request contains no user message.".to_string(),
                tables: None,
                dashboard: None,
                debug: None,
                error_message: Some(format!(
                    "{}: no user message in request",
                    ErrorCategory::ValidationError.as_str()
                )),
            };
            self.emit_result(&mut events, &output).await;
            return A2aResponse { output, session_id };
        };

        let mut session = SessionContext::new(
            session_id.clone(),
            query,
            request.locale.clone().unwrap_or_else(|| "ru".to_string()),
            request
                .user_role
                .clone()
                .unwrap_or_else(|| "analyst".to_string()),
        );
        session.debug = request.debug.unwrap_or(false)
            || request
                .metadata
                .as_ref()
                .and_then(|m| m.get("debug"))
                .and_then(Value::as_bool)
                .unwrap_or(false);

        let output = match tokio::time::timeout(
            self.cfg.request_deadline,
            self.run(&mut session, &cancel),
        )
        .await
        {
            Ok(output) => output,
            Err(_) => AgentOutput {
                text: "The request exceeded the processing deadline.".to_string(),
                tables: None,
                dashboard: None,
                debug: None,
                error_message: Some(format!(
                    "{}: request deadline of {:?} exceeded",
                    ErrorCategory::IssTimeout.as_str(),
                    self.cfg.request_deadline
                )),
            },
        };

        self.emit_result(&mut events, &output).await;
        A2aResponse { output, session_id }
    }

    async fn run(&self, session: &mut SessionContext, cancel: &CancellationToken) -> AgentOutput {
        let limits = plan_limits(&self.cfg);

        let mut plan = match self.planner.build_plan(session, &self.cfg).await {
            Ok(plan) => plan,
            Err(e) => {
                return AgentOutput {
                    text: format!("I could not plan this request: {e}."),
                    tables: None,
                    dashboard: None,
                    debug: None,
                    error_message: Some(format!(
                        "{}: {e}",
                        ErrorCategory::ValidationError.as_str()
                    )),
                };
            }
        };
        if let Err(e) = validate_plan(&plan, &limits) {
            return AgentOutput {
                text: format!("The generated plan was rejected: {e}."),
                tables: None,
                dashboard: None,
                debug: None,
                error_message: Some(format!(
                    "{}: {e}",
                    ErrorCategory::ValidationError.as_str()
                )),
            };
        }

        let orchestrator = Orchestrator::new(
            Arc::clone(&self.transport),
            self.cfg.orchestrator_parallelism,
            self.cfg.step_deadline,
        );

        let mut signatures = vec![plan.signature()];
        let mut attempts = 0usize;
        let (scenario, result) = loop {
            session.plan = Some(plan.clone());
            let result = orchestrator.execute(session, &plan, cancel).await;

            if result.succeeded()
                || attempts >= self.planner.max_replan_attempts()
                || cancel.is_cancelled()
            {
                break (plan.scenario_type, result);
            }

            match self.planner.replan(session, &self.cfg, &plan, &result).await {
                Some(next)
                    if validate_plan(&next, &limits).is_ok()
                        && !signatures.contains(&next.signature()) =>
                {
                    tracing::info!(
                        "re-planning (attempt {}) after {:?}",
                        attempts + 1,
                        result.first_error().and_then(|s| s.error_category)
                    );
                    signatures.push(next.signature());
                    attempts += 1;
                    plan = next;
                }
                _ => break (plan.scenario_type, result),
            }
        };

        // The final verdict reflects the full session: a failed first
        // attempt that was successfully re-planned is a success.
        let effective = effective_result(session, &result);
        format_response(session, scenario, self.llm.as_deref(), &effective).await
    }

    async fn emit_result(&self, events: &mut Option<StreamWriter>, output: &AgentOutput) {
        let Some(writer) = events.as_mut() else {
            return;
        };

        writer.stream_text(&output.text).await;

        let (schema_valid, schema_errors) = match &output.dashboard {
            Some(dashboard) => match dashboard.validate() {
                Ok(()) => (true, None),
                Err(errors) => (false, Some(errors)),
            },
            None => (true, None),
        };
        let mut snapshot = json!({
            "dashboard": output.dashboard,
            "status": if output.error_message.is_some() { "error" } else { "done" },
            "schema_valid": schema_valid,
            "text": output.text,
        });
        if let Some(errors) = schema_errors {
            snapshot["schema_errors"] = json!(errors);
        }
        if let Some(error) = &output.error_message {
            snapshot["error"] = json!(error);
        }
        writer.snapshot(snapshot).await;

        match &output.error_message {
            Some(message) => {
                let code = message.split(':').next().map(str::to_string);
                writer.error(message, code.as_deref()).await;
            }
            None => writer.finish().await,
        }
    }
}

/// Judge the run over the whole session: the latest execution decides,
/// but its step log is the full append-only history.
fn effective_result(session: &SessionContext, last: &PlanExecutionResult) -> PlanExecutionResult {
    PlanExecutionResult {
        steps: session.executed.clone(),
        has_fatal_error: last.has_fatal_error,
        total_duration_ms: session.elapsed_ms(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::planner::BasicPlanner;
    use crate::agent::tools::LocalTransport;
    use crate::config::RiskMcpConfig;
    use crate::data::fixture::FixtureProvider;
    use crate::mcp::metrics::McpMetrics;
    use crate::mcp::server::RiskMcpServer;
    use chrono::NaiveDate;

    fn service() -> AgentService {
        let from = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let to = NaiveDate::from_ymd_opt(2024, 12, 1).unwrap();
        let provider = FixtureProvider::seeded(&["SBER", "GAZP", "LKOH", "ROSN"], from, to);
        let server = RiskMcpServer::new(
            Arc::new(provider),
            RiskMcpConfig::default(),
            Arc::new(McpMetrics::new()),
            None,
        );
        AgentService::new(
            AgentConfig::default(),
            Arc::new(LocalTransport::new(server)),
            Arc::new(BasicPlanner),
            None,
        )
    }

    fn request(text: &str) -> A2aRequest {
        A2aRequest {
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: text.to_string(),
            }],
            locale: None,
            user_role: None,
            session_id: Some("session-1".to_string()),
            metadata: None,
            debug: Some(true),
        }
    }

    #[tokio::test]
    async fn portfolio_request_end_to_end() {
        let service = service();
        let response = service
            .handle(
                request("Portfolio risk for SBER=40%, GAZP=30%, LKOH=30% over 2024-01-01..2024-11-01"),
                None,
                CancellationToken::new(),
            )
            .await;

        assert_eq!(response.session_id, "session-1");
        let output = response.output;
        assert!(output.error_message.is_none(), "{:?}", output.error_message);
        assert!(!output.text.is_empty());
        assert!(output.dashboard.is_some());
        assert!(output.debug.is_some(), "debug=true requested");
    }

    #[tokio::test]
    async fn empty_request_is_a_validation_error() {
        let service = service();
        let response = service
            .handle(
                A2aRequest {
                    messages: vec![],
                    locale: None,
                    user_role: None,
                    session_id: None,
                    metadata: None,
                    debug: None,
                },
                None,
                CancellationToken::new(),
            )
            .await;

        let message = response.output.error_message.unwrap();
        assert!(message.starts_with("VALIDATION_ERROR"));
        // A session id is minted even for failed requests
        assert!(!response.session_id.is_empty());
    }

    #[tokio::test]
    async fn unknown_ticker_portfolio_fails_cleanly() {
        let service = service();
        let response = service
            .handle(
                request("Portfolio risk for ZZZZ=60%, QQQQ=40% over 2024-01-01..2024-11-01"),
                None,
                CancellationToken::new(),
            )
            .await;

        // Both tickers are unknown; after the drop-ticker rewrite there is
        // nothing left, so the request surfaces a failure.
        assert!(response.output.error_message.is_some());
    }
}
