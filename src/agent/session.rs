//! Per-request session state and structured execution records.

use chrono::NaiveDate;
use rustc_hash::FxHashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;

use crate::error::ErrorCategory;

use super::plan::{Plan, StepId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Ok,
    Error,
    Skipped,
}

/// Immutable record of one executed plan step. Once appended to the
/// session it is never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExecutedStep {
    pub step_id: StepId,
    pub tool: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,
    pub duration_ms: u64,
    /// Small human-readable result or error digest
    pub digest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PlanExecutionResult {
    pub steps: Vec<ExecutedStep>,
    pub has_fatal_error: bool,
    pub total_duration_ms: u64,
}

impl PlanExecutionResult {
    pub fn succeeded(&self) -> bool {
        !self.has_fatal_error && self.steps.iter().all(|s| s.status != StepStatus::Error)
    }

    /// The first errored step in completion order, if any.
    pub fn first_error(&self) -> Option<&ExecutedStep> {
        self.steps.iter().find(|s| s.status == StepStatus::Error)
    }
}

/// Per-request context: immutable input, the current plan, the append-only
/// execution log and accumulated tool results keyed by step id.
pub struct SessionContext {
    pub session_id: String,
    pub query: String,
    pub locale: String,
    pub user_role: String,
    pub debug: bool,
    /// Reference date for default windows
    pub today: NaiveDate,
    pub plan: Option<Plan>,
    pub executed: Vec<ExecutedStep>,
    pub tool_results: FxHashMap<StepId, Value>,
    pub errors: Vec<String>,
    started: Instant,
}

impl SessionContext {
    pub fn new(session_id: String, query: String, locale: String, user_role: String) -> Self {
        Self {
            session_id,
            query,
            locale,
            user_role,
            debug: false,
            today: chrono::Utc::now().date_naive(),
            plan: None,
            executed: Vec::new(),
            tool_results: FxHashMap::default(),
            errors: Vec::new(),
            started: Instant::now(),
        }
    }

    /// Append a step record (never mutated afterwards) and its result.
    pub fn record_step(&mut self, step: ExecutedStep, result: Option<Value>) {
        if step.status == StepStatus::Error {
            self.errors.push(format!(
                "step {} ({}): {}",
                step.step_id, step.tool, step.digest
            ));
        }
        if let Some(value) = result {
            self.tool_results.insert(step.step_id, value);
        }
        self.executed.push(step);
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}
