//! Tool orchestrator: executes a validated plan against a transport.
//!
//! Steps run in dependency order; independent steps interleave up to the
//! configured parallelism. Each step gets a deadline and a structured
//! catch that classifies failures into the error taxonomy. Completion
//! order, not plan order, determines the `ExecutedStep` log. A failed
//! fatal step (or a fatal error category) stops the run; dependents of
//! any failed step are skipped.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::ErrorCategory;

use super::parse::truncate_positions;
use super::plan::{Plan, StepId, StepKind};
use super::session::{ExecutedStep, PlanExecutionResult, SessionContext, StepStatus};
use super::tools::{ToolCallError, ToolTransport};

const DIGEST_LIMIT: usize = 160;

pub struct Orchestrator {
    transport: Arc<dyn ToolTransport>,
    parallelism: usize,
    step_deadline: Duration,
}

enum StepOutcome {
    Ok(Value),
    Err(ErrorCategory, String),
}

#[derive(Clone, Copy, PartialEq)]
enum StepState {
    Pending,
    Running,
    Done,
    Failed,
    Skipped,
}

impl Orchestrator {
    pub fn new(transport: Arc<dyn ToolTransport>, parallelism: usize, step_deadline: Duration) -> Self {
        Self {
            transport,
            parallelism: parallelism.max(1),
            step_deadline,
        }
    }

    pub async fn execute(
        &self,
        session: &mut SessionContext,
        plan: &Plan,
        cancel: &CancellationToken,
    ) -> PlanExecutionResult {
        let started = Instant::now();
        let n = plan.steps.len();
        let parallelism = plan.parallelism.unwrap_or(self.parallelism).max(1);
        let backoff = plan.backoff_ms.map(Duration::from_millis);

        let mut state = vec![StepState::Pending; n];
        let mut indegree = vec![0usize; n];
        let mut dependents: Vec<Vec<StepId>> = vec![Vec::new(); n];
        for step in &plan.steps {
            indegree[step.step_id] = step.depends_on.len();
            for &dep in &step.depends_on {
                dependents[dep].push(step.step_id);
            }
        }
        let mut ready: Vec<StepId> = (0..n).filter(|&i| indegree[i] == 0).collect();
        ready.sort_unstable();

        let mut join_set: JoinSet<(StepId, StepOutcome, Duration)> = JoinSet::new();
        let mut executed: Vec<ExecutedStep> = Vec::new();
        let mut fatal = false;

        loop {
            if cancel.is_cancelled() {
                fatal = true;
            }

            // Launch ready steps up to the parallelism budget
            while !fatal && join_set.len() < parallelism && !ready.is_empty() {
                let id = ready.remove(0);
                state[id] = StepState::Running;
                let step = &plan.steps[id];

                match resolve_refs(&step.arguments, session) {
                    Err(message) => {
                        let record = ExecutedStep {
                            step_id: id,
                            tool: step.tool.clone(),
                            status: StepStatus::Error,
                            error_category: Some(ErrorCategory::ValidationError),
                            duration_ms: 0,
                            digest: truncate(&message),
                        };
                        state[id] = StepState::Failed;
                        if step.fatal {
                            fatal = true;
                        }
                        skip_dependents(id, &dependents, &mut state);
                        executed.push(record.clone());
                        session.record_step(record, None);
                    }
                    Ok(arguments) => {
                        let transport = Arc::clone(&self.transport);
                        let kind = step.kind;
                        let tool = step.tool.clone();
                        let deadline = self.step_deadline;
                        let cancel = cancel.clone();
                        join_set.spawn(async move {
                            let step_started = Instant::now();
                            if let Some(delay) = backoff {
                                tokio::time::sleep(delay).await;
                            }
                            let outcome = tokio::select! {
                                () = cancel.cancelled() => {
                                    StepOutcome::Err(ErrorCategory::Unknown, "cancelled".to_string())
                                }
                                result = tokio::time::timeout(
                                    deadline,
                                    run_step(kind, &tool, arguments, transport),
                                ) => match result {
                                    Err(_) => StepOutcome::Err(
                                        ErrorCategory::IssTimeout,
                                        "step deadline exceeded".to_string(),
                                    ),
                                    Ok(Ok(value)) => StepOutcome::Ok(value),
                                    Ok(Err(e)) => StepOutcome::Err(e.category, e.message),
                                },
                            };
                            (id, outcome, step_started.elapsed())
                        });
                    }
                }
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            let Ok((id, outcome, duration)) = joined else {
                fatal = true;
                continue;
            };
            let step = &plan.steps[id];

            match outcome {
                StepOutcome::Ok(value) => {
                    state[id] = StepState::Done;
                    let record = ExecutedStep {
                        step_id: id,
                        tool: step.tool.clone(),
                        status: StepStatus::Ok,
                        error_category: None,
                        duration_ms: duration.as_millis() as u64,
                        digest: digest_of(&value),
                    };
                    executed.push(record.clone());
                    session.record_step(record, Some(value));

                    for &next in &dependents[id] {
                        if state[next] == StepState::Pending {
                            indegree[next] -= 1;
                            if indegree[next] == 0 {
                                ready.push(next);
                                ready.sort_unstable();
                            }
                        }
                    }
                }
                StepOutcome::Err(category, message) => {
                    state[id] = StepState::Failed;
                    if step.fatal || category.is_fatal() {
                        fatal = true;
                    }
                    skip_dependents(id, &dependents, &mut state);
                    let record = ExecutedStep {
                        step_id: id,
                        tool: step.tool.clone(),
                        status: StepStatus::Error,
                        error_category: Some(category),
                        duration_ms: duration.as_millis() as u64,
                        digest: truncate(&message),
                    };
                    executed.push(record.clone());
                    session.record_step(record, None);
                }
            }
        }

        // Everything never started is recorded as skipped, in id order.
        for id in 0..n {
            if matches!(state[id], StepState::Pending | StepState::Skipped) {
                let record = ExecutedStep {
                    step_id: id,
                    tool: plan.steps[id].tool.clone(),
                    status: StepStatus::Skipped,
                    error_category: None,
                    duration_ms: 0,
                    digest: "not executed".to_string(),
                };
                executed.push(record.clone());
                session.record_step(record, None);
            }
        }

        PlanExecutionResult {
            steps: executed,
            has_fatal_error: fatal,
            total_duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

fn skip_dependents(id: StepId, dependents: &[Vec<StepId>], state: &mut [StepState]) {
    let mut stack = vec![id];
    while let Some(current) = stack.pop() {
        for &next in &dependents[current] {
            if state[next] == StepState::Pending {
                state[next] = StepState::Skipped;
                stack.push(next);
            }
        }
    }
}

async fn run_step(
    kind: StepKind,
    tool: &str,
    arguments: Value,
    transport: Arc<dyn ToolTransport>,
) -> Result<Value, ToolCallError> {
    match kind {
        StepKind::McpCall => transport.call(tool, arguments).await,
        StepKind::LimitPortfolio => {
            let positions: Vec<(String, f64)> = arguments
                .get("positions")
                .and_then(Value::as_array)
                .map(|rows| {
                    rows.iter()
                        .filter_map(|p| {
                            Some((
                                p.get("ticker")?.as_str()?.to_string(),
                                p.get("weight")?.as_f64()?,
                            ))
                        })
                        .collect()
                })
                .unwrap_or_default();
            if positions.is_empty() {
                return Err(ToolCallError::new(
                    ErrorCategory::ValidationError,
                    "limit_portfolio: no positions",
                ));
            }
            let top_n = arguments
                .get("top_n")
                .and_then(Value::as_u64)
                .unwrap_or(10) as usize;
            Ok(truncate_positions(&positions, top_n))
        }
        // No retrieval backend is wired in this deployment
        StepKind::RagSearch => Ok(json!({"documents": []})),
        StepKind::Explanation => Ok(json!({"deferred": true})),
    }
}

/// Replace `{"$ref": {"step": N, "path": "a.b"}}` placeholders with values
/// from earlier step results.
fn resolve_refs(arguments: &Value, session: &SessionContext) -> Result<Value, String> {
    match arguments {
        Value::Object(map) => {
            if let Some(reference) = map.get("$ref") {
                if map.len() == 1 {
                    return resolve_one(reference, session);
                }
            }
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                out.insert(key.clone(), resolve_refs(value, session)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => items
            .iter()
            .map(|v| resolve_refs(v, session))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}

fn resolve_one(reference: &Value, session: &SessionContext) -> Result<Value, String> {
    let step = reference
        .get("step")
        .and_then(Value::as_u64)
        .ok_or_else(|| "$ref missing step".to_string())? as StepId;
    let path = reference.get("path").and_then(Value::as_str).unwrap_or("");

    let mut current = session
        .tool_results
        .get(&step)
        .ok_or_else(|| format!("$ref to step {step} with no result"))?;
    for part in path.split('.').filter(|p| !p.is_empty()) {
        current = current
            .get(part)
            .ok_or_else(|| format!("$ref path '{path}' missing at '{part}'"))?;
    }
    Ok(current.clone())
}

fn digest_of(value: &Value) -> String {
    let summary = match value {
        Value::Object(map) => {
            let keys: Vec<&str> = map.keys().take(6).map(String::as_str).collect();
            format!("object{{{}}}", keys.join(","))
        }
        Value::Array(items) => format!("array[{}]", items.len()),
        other => other.to_string(),
    };
    truncate(&summary)
}

fn truncate(s: &str) -> String {
    if s.len() <= DIGEST_LIMIT {
        s.to_string()
    } else {
        let mut end = DIGEST_LIMIT;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}
