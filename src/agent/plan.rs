//! Plan representation and validation.
//!
//! A plan is an arena of steps addressed by integer id with dependency
//! edges; re-planning always produces a fresh arena. Arguments may embed
//! `{"$ref": {"step": N, "path": "a.b"}}` placeholders the orchestrator
//! resolves against earlier step results.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use thiserror::Error;

use super::scenario::ScenarioType;

pub type StepId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    McpCall,
    LimitPortfolio,
    RagSearch,
    Explanation,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PlannedStep {
    pub step_id: StepId,
    pub kind: StepKind,
    /// Tool name for `mcp_call`, otherwise a descriptive label
    pub tool: String,
    pub arguments: Value,
    pub depends_on: Vec<StepId>,
    /// Failing this step aborts the plan regardless of error category
    #[serde(default)]
    pub fatal: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Plan {
    pub scenario_type: ScenarioType,
    pub steps: Vec<PlannedStep>,
    /// Parallelism override set by re-planning (e.g. after RATE_LIMIT)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<usize>,
    /// Delay before each tool call, set by re-planning
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_ms: Option<u64>,
}

impl Plan {
    pub fn new(scenario_type: ScenarioType) -> Self {
        Self {
            scenario_type,
            steps: Vec::new(),
            parallelism: None,
            backoff_ms: None,
        }
    }

    pub fn push(
        &mut self,
        kind: StepKind,
        tool: &str,
        arguments: Value,
        depends_on: Vec<StepId>,
        fatal: bool,
    ) -> StepId {
        let step_id = self.steps.len();
        self.steps.push(PlannedStep {
            step_id,
            kind,
            tool: tool.to_string(),
            arguments,
            depends_on,
            fatal,
        });
        step_id
    }

    /// Stable signature used to reject duplicate re-plans. Execution
    /// policy (parallelism, backoff) is part of the signature so a
    /// slowed-down retry of the same steps is not considered a duplicate.
    pub fn signature(&self) -> Vec<(String, String)> {
        let mut sig: Vec<(String, String)> = self
            .steps
            .iter()
            .map(|s| {
                (
                    s.tool.clone(),
                    format!("{}|{:?}", s.arguments, s.depends_on),
                )
            })
            .collect();
        if self.parallelism.is_some() || self.backoff_ms.is_some() {
            sig.push((
                "__policy".to_string(),
                format!("{:?}|{:?}", self.parallelism, self.backoff_ms),
            ));
        }
        sig
    }
}

/// Relative execution cost per tool, summed against the plan ceiling.
fn cost_rank(tool: &str) -> u32 {
    match tool {
        "analyze_portfolio_risk" | "compute_correlation_matrix" => 3,
        "get_ohlcv_timeseries" | "build_cfo_liquidity_report" | "get_index_constituents_metrics" => 2,
        _ => 1,
    }
}

#[derive(Debug, Clone)]
pub struct PlanLimits {
    pub max_steps: usize,
    pub max_tickers: usize,
    pub max_cost: u32,
}

impl Default for PlanLimits {
    fn default() -> Self {
        Self {
            max_steps: 12,
            max_tickers: 10,
            max_cost: 24,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("plan has {0} steps, limit is {1}")]
    TooManySteps(usize, usize),
    #[error("plan references {0} tickers, limit is {1}")]
    TooManyTickers(usize, usize),
    #[error("step {0} depends on unknown step {1}")]
    UnknownDependency(StepId, StepId),
    #[error("step {0} depends on a later step {1}")]
    ForwardDependency(StepId, StepId),
    #[error("plan contains a dependency cycle")]
    Cyclic,
    #[error("plan cost {0} exceeds the ceiling {1}")]
    CostCeiling(u32, u32),
    #[error("could not build a plan: {0}")]
    Unplannable(String),
}

/// Validate a plan and return a topological execution order.
///
/// Dependencies must reference earlier steps (which also rules out
/// cycles); Kahn's algorithm is still run as a belt-and-braces check and
/// to produce the order.
pub fn validate_plan(plan: &Plan, limits: &PlanLimits) -> Result<Vec<StepId>, PlanError> {
    let n = plan.steps.len();
    if n > limits.max_steps {
        return Err(PlanError::TooManySteps(n, limits.max_steps));
    }

    for step in &plan.steps {
        for &dep in &step.depends_on {
            if dep >= n {
                return Err(PlanError::UnknownDependency(step.step_id, dep));
            }
            if dep >= step.step_id {
                return Err(PlanError::ForwardDependency(step.step_id, dep));
            }
        }
    }

    let tickers = referenced_tickers(plan);
    if tickers.len() > limits.max_tickers {
        return Err(PlanError::TooManyTickers(tickers.len(), limits.max_tickers));
    }

    let cost: u32 = plan.steps.iter().map(|s| cost_rank(&s.tool)).sum();
    if cost > limits.max_cost {
        return Err(PlanError::CostCeiling(cost, limits.max_cost));
    }

    // Kahn's algorithm
    let mut indegree = vec![0usize; n];
    let mut dependents: Vec<Vec<StepId>> = vec![Vec::new(); n];
    for step in &plan.steps {
        indegree[step.step_id] = step.depends_on.len();
        for &dep in &step.depends_on {
            dependents[dep].push(step.step_id);
        }
    }
    // Ready list kept descending so pop() yields the lowest id first
    let mut ready: Vec<StepId> = (0..n).filter(|&i| indegree[i] == 0).collect();
    ready.sort_unstable_by(|a, b| b.cmp(a));
    let mut order = Vec::with_capacity(n);
    while let Some(id) = ready.pop() {
        order.push(id);
        for &next in &dependents[id] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push(next);
            }
        }
        ready.sort_unstable_by(|a, b| b.cmp(a));
    }
    if order.len() != n {
        return Err(PlanError::Cyclic);
    }
    Ok(order)
}

/// Collect the distinct tickers a plan's arguments reference.
/// `limit_portfolio` steps are exempt: their input is the oversized list
/// they exist to truncate.
pub fn referenced_tickers(plan: &Plan) -> HashSet<String> {
    let mut tickers = HashSet::new();
    for step in &plan.steps {
        if step.kind == StepKind::LimitPortfolio {
            continue;
        }
        collect_tickers(&step.arguments, &mut tickers);
    }
    tickers
}

fn collect_tickers(value: &Value, out: &mut HashSet<String>) {
    match value {
        Value::Object(map) => {
            for (key, v) in map {
                match key.as_str() {
                    "ticker" | "index_ticker" => {
                        if let Some(t) = v.as_str() {
                            out.insert(t.to_uppercase());
                        }
                    }
                    "tickers" => {
                        if let Some(arr) = v.as_array() {
                            for t in arr.iter().filter_map(Value::as_str) {
                                out.insert(t.to_uppercase());
                            }
                        }
                    }
                    _ => collect_tickers(v, out),
                }
            }
        }
        Value::Array(arr) => {
            for v in arr {
                collect_tickers(v, out);
            }
        }
        _ => {}
    }
}

/// Build an argument placeholder resolved from an earlier step's result.
pub fn step_ref(step: StepId, path: &str) -> Value {
    serde_json::json!({ "$ref": { "step": step, "path": path } })
}
