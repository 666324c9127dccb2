//! Tool transports: how the orchestrator reaches MCP tools.
//!
//! [`HttpMcpClient`] speaks JSON-RPC `tools/call` against one or more MCP
//! server URLs; [`LocalTransport`] fronts an in-process [`RiskMcpServer`]
//! so the agent can run without a separate MCP deployment (dev profile and
//! tests). Both produce the envelope `data` member or a classified error.

use async_trait::async_trait;
use rmcp::handler::server::wrapper::{Json, Parameters};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::ErrorCategory;
use crate::mcp::envelope::ToolEnvelope;
use crate::mcp::server::RiskMcpServer;

#[derive(Debug, Clone, thiserror::Error)]
#[error("{category}: {message}")]
pub struct ToolCallError {
    pub category: ErrorCategory,
    pub message: String,
}

impl ToolCallError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }

    pub fn unknown_tool(tool: &str) -> Self {
        Self::new(ErrorCategory::UnknownTool, format!("unknown tool: {tool}"))
    }
}

/// Transport seam between the orchestrator and the MCP tool servers.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    /// Invoke a named tool; returns the envelope `data` member.
    async fn call(&self, tool: &str, arguments: Value) -> Result<Value, ToolCallError>;
}

/// Tools known to live on the risk MCP server.
pub const RISK_MCP_TOOLS: &[&str] = &[
    "analyze_portfolio_risk",
    "suggest_rebalance",
    "compute_correlation_matrix",
    "build_cfo_liquidity_report",
    "get_security_snapshot",
    "get_ohlcv_timeseries",
    "get_index_constituents_metrics",
];

// ---------------------------------------------------------------------------
// HTTP JSON-RPC client
// ---------------------------------------------------------------------------

pub struct HttpMcpClient {
    client: reqwest::Client,
    endpoints: Vec<String>,
    next_id: AtomicU64,
}

impl HttpMcpClient {
    pub fn new(endpoints: Vec<String>, timeout: Duration) -> Result<Self, ToolCallError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ToolCallError::new(ErrorCategory::Unknown, e.to_string()))?;
        Ok(Self {
            client,
            endpoints,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call_endpoint(
        &self,
        endpoint: &str,
        tool: &str,
        arguments: &Value,
    ) -> Result<Value, ToolCallError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": "tools/call",
            "params": { "name": tool, "arguments": arguments },
        });

        let response = self
            .client
            .post(endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                let category = if e.is_timeout() {
                    ErrorCategory::IssTimeout
                } else {
                    ErrorCategory::Unknown
                };
                ToolCallError::new(category, e.to_string())
            })?;

        let payload: Value = response
            .json()
            .await
            .map_err(|e| ToolCallError::new(ErrorCategory::Unknown, e.to_string()))?;

        if let Some(error) = payload.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("rpc error");
            let category = if message.to_lowercase().contains("unknown tool")
                || message.to_lowercase().contains("not found")
            {
                ErrorCategory::UnknownTool
            } else {
                ErrorCategory::Unknown
            };
            return Err(ToolCallError::new(category, message.to_string()));
        }

        let envelope = payload
            .pointer("/result/structuredContent")
            .cloned()
            .ok_or_else(|| {
                ToolCallError::new(ErrorCategory::Unknown, "missing structuredContent")
            })?;
        envelope_data(envelope)
    }
}

/// Extract `data` from an envelope value, mapping its `error` member.
fn envelope_data(envelope: Value) -> Result<Value, ToolCallError> {
    if let Some(error) = envelope.get("error").filter(|e| !e.is_null()) {
        let category = error
            .get("error_type")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or(ErrorCategory::Unknown);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("tool error");
        return Err(ToolCallError::new(category, message.to_string()));
    }
    Ok(envelope.get("data").cloned().unwrap_or(Value::Null))
}

#[async_trait]
impl ToolTransport for HttpMcpClient {
    async fn call(&self, tool: &str, arguments: Value) -> Result<Value, ToolCallError> {
        if self.endpoints.is_empty() {
            return Err(ToolCallError::unknown_tool(tool));
        }
        let mut last_error = None;
        for endpoint in &self.endpoints {
            match self.call_endpoint(endpoint, tool, &arguments).await {
                Err(e) if e.category == ErrorCategory::UnknownTool => {
                    last_error = Some(e);
                }
                other => return other,
            }
        }
        Err(last_error.unwrap_or_else(|| ToolCallError::unknown_tool(tool)))
    }
}

// ---------------------------------------------------------------------------
// In-process transport
// ---------------------------------------------------------------------------

pub struct LocalTransport {
    server: RiskMcpServer,
}

impl LocalTransport {
    pub fn new(server: RiskMcpServer) -> Self {
        Self { server }
    }
}

fn decode_params<T: DeserializeOwned>(tool: &str, arguments: Value) -> Result<T, ToolCallError> {
    serde_json::from_value(arguments).map_err(|e| {
        ToolCallError::new(
            ErrorCategory::ValidationError,
            format!("{tool}: invalid arguments: {e}"),
        )
    })
}

fn unwrap_envelope<T: Serialize>(Json(envelope): Json<ToolEnvelope<T>>) -> Result<Value, ToolCallError> {
    if let Some(error) = envelope.error {
        return Err(ToolCallError::new(error.error_type, error.message));
    }
    serde_json::to_value(envelope.data)
        .map_err(|e| ToolCallError::new(ErrorCategory::Unknown, e.to_string()))
}

#[async_trait]
impl ToolTransport for LocalTransport {
    async fn call(&self, tool: &str, arguments: Value) -> Result<Value, ToolCallError> {
        match tool {
            "analyze_portfolio_risk" => unwrap_envelope(
                self.server
                    .analyze_portfolio_risk(Parameters(decode_params(tool, arguments)?))
                    .await,
            ),
            "suggest_rebalance" => unwrap_envelope(
                self.server
                    .suggest_rebalance_tool(Parameters(decode_params(tool, arguments)?))
                    .await,
            ),
            "compute_correlation_matrix" => unwrap_envelope(
                self.server
                    .compute_correlation_matrix(Parameters(decode_params(tool, arguments)?))
                    .await,
            ),
            "build_cfo_liquidity_report" => unwrap_envelope(
                self.server
                    .build_cfo_liquidity_report_tool(Parameters(decode_params(tool, arguments)?))
                    .await,
            ),
            "get_security_snapshot" => unwrap_envelope(
                self.server
                    .get_security_snapshot(Parameters(decode_params(tool, arguments)?))
                    .await,
            ),
            "get_ohlcv_timeseries" => unwrap_envelope(
                self.server
                    .get_ohlcv_timeseries(Parameters(decode_params(tool, arguments)?))
                    .await,
            ),
            "get_index_constituents_metrics" => unwrap_envelope(
                self.server
                    .get_index_constituents_metrics(Parameters(decode_params(tool, arguments)?))
                    .await,
            ),
            _ => Err(ToolCallError::unknown_tool(tool)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskMcpConfig;
    use crate::data::fixture::FixtureProvider;
    use crate::mcp::metrics::McpMetrics;
    use chrono::NaiveDate;
    use std::sync::Arc;

    fn local_transport() -> LocalTransport {
        let from = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let to = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let provider = FixtureProvider::seeded(&["SBER", "GAZP"], from, to);
        LocalTransport::new(RiskMcpServer::new(
            Arc::new(provider),
            RiskMcpConfig::default(),
            Arc::new(McpMetrics::new()),
            None,
        ))
    }

    #[tokio::test]
    async fn local_transport_round_trip() {
        let transport = local_transport();
        let data = transport
            .call(
                "get_security_snapshot",
                json!({"ticker": "SBER"}),
            )
            .await
            .unwrap();
        assert_eq!(data["ticker"], "SBER");
    }

    #[tokio::test]
    async fn local_transport_maps_tool_errors() {
        let transport = local_transport();
        let err = transport
            .call("get_security_snapshot", json!({"ticker": "ZZZZ"}))
            .await
            .unwrap_err();
        assert_eq!(err.category, ErrorCategory::InvalidTicker);
    }

    #[tokio::test]
    async fn unknown_tool_classified() {
        let transport = local_transport();
        let err = transport.call("no_such_tool", json!({})).await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::UnknownTool);
    }

    #[test]
    fn envelope_data_extraction() {
        let ok = json!({"metadata": {}, "data": {"x": 1}});
        assert_eq!(envelope_data(ok).unwrap()["x"], 1);

        let failed = json!({
            "metadata": {},
            "data": null,
            "error": {"error_type": "RATE_LIMIT", "message": "slow down"}
        });
        let err = envelope_data(failed).unwrap_err();
        assert_eq!(err.category, ErrorCategory::RateLimit);
    }
}
