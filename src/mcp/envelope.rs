//! The uniform tool response envelope `{metadata, data, metrics?, error?}`.
//!
//! Every tool returns this shape whether it succeeded or failed; failures
//! carry a classified [`ToolErrorInfo`] and never a stack trace.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::error::ErrorCategory;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolMetadata {
    pub as_of: DateTime<Utc>,
    pub tool: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ToolMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_hits: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_misses: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolErrorInfo {
    pub error_type: ErrorCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
}

impl ToolErrorInfo {
    pub fn new(error_type: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            error_type,
            field: None,
            message: message.into(),
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: ErrorCategory::ValidationError,
            field: Some(field.into()),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolEnvelope<T> {
    pub metadata: ToolMetadata,
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ToolMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolErrorInfo>,
}

impl<T> ToolEnvelope<T> {
    pub fn ok(tool: &str, started: Instant, data: T) -> Self {
        Self {
            metadata: metadata(tool, started),
            data: Some(data),
            metrics: None,
            error: None,
        }
    }

    pub fn fail(tool: &str, started: Instant, error: ToolErrorInfo) -> Self {
        Self {
            metadata: metadata(tool, started),
            data: None,
            metrics: None,
            error: Some(error),
        }
    }

    pub fn with_metrics(mut self, metrics: ToolMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

fn metadata(tool: &str, started: Instant) -> ToolMetadata {
    ToolMetadata {
        as_of: Utc::now(),
        tool: tool.to_string(),
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_envelope_shape() {
        let env = ToolEnvelope::ok("get_security_snapshot", Instant::now(), 42u32);
        assert!(env.is_ok());
        assert_eq!(env.data, Some(42));
        assert_eq!(env.metadata.tool, "get_security_snapshot");

        let json = serde_json::to_value(&env).unwrap();
        assert!(json.get("error").is_none(), "error omitted when absent");
        assert!(json.get("metrics").is_none());
    }

    #[test]
    fn error_envelope_shape() {
        let env: ToolEnvelope<u32> = ToolEnvelope::fail(
            "analyze_portfolio_risk",
            Instant::now(),
            ToolErrorInfo::validation("positions", "weights sum to 0.9"),
        );
        assert!(!env.is_ok());

        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["error"]["error_type"], "VALIDATION_ERROR");
        assert_eq!(json["error"]["field"], "positions");
        assert!(json["data"].is_null());
    }

    #[test]
    fn round_trip() {
        let env = ToolEnvelope::ok("t", Instant::now(), vec![1.0, 2.0])
            .with_metrics(ToolMetrics {
                cache_hits: Some(3),
                cache_misses: Some(1),
            });
        let json = serde_json::to_string(&env).unwrap();
        let back: ToolEnvelope<Vec<f64>> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.data, Some(vec![1.0, 2.0]));
        assert_eq!(back.metrics.unwrap().cache_hits, Some(3));
    }
}
