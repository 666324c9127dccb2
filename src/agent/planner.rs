//! Planner strategies: Basic (pure heuristics), Advanced (LLM-assisted
//! with validation and fallback) and External (delegated endpoint with
//! fallback). Strategies are a capability set `{build_plan, replan}`
//! selected by configuration and wired by injection.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::config::{AgentConfig, PlannerMode};
use crate::error::ErrorCategory;

use super::llm::{extract_json, ChatClient};
use super::parse;
use super::plan::{step_ref, Plan, PlanError, PlanLimits, StepKind, validate_plan};
use super::scenario::{template, ScenarioType, TemplateStep};
use super::session::{PlanExecutionResult, SessionContext};

/// Default analysis window when the query does not carry one.
const DEFAULT_WINDOW_DAYS: i64 = 365;
/// Backoff injected by the RATE_LIMIT rewrite.
const RATE_LIMIT_BACKOFF_MS: u64 = 500;
/// ISS rejects windows longer than this; the date-range rewrite clamps
/// to it so one halving is always enough.
const MAX_PROVIDER_LOOKBACK_DAYS: i64 = 730;

pub fn plan_limits(cfg: &AgentConfig) -> PlanLimits {
    PlanLimits {
        max_steps: cfg.max_plan_steps,
        max_tickers: cfg.max_tickers_per_request,
        ..PlanLimits::default()
    }
}

#[async_trait]
pub trait PlannerStrategy: Send + Sync {
    async fn build_plan(
        &self,
        session: &SessionContext,
        cfg: &AgentConfig,
    ) -> Result<Plan, PlanError>;

    /// Produce a replacement plan after a failed execution, or `None` when
    /// no rewrite applies.
    async fn replan(
        &self,
        session: &SessionContext,
        cfg: &AgentConfig,
        plan: &Plan,
        result: &PlanExecutionResult,
    ) -> Option<Plan>;

    fn max_replan_attempts(&self) -> usize;
}

/// Select and wire a strategy from configuration.
pub fn make_planner(
    cfg: &AgentConfig,
    llm: Option<Arc<dyn ChatClient>>,
) -> Arc<dyn PlannerStrategy> {
    match cfg.planner_mode {
        PlannerMode::Basic => Arc::new(BasicPlanner),
        PlannerMode::Advanced => Arc::new(AdvancedPlanner { llm }),
        PlannerMode::ExternalAgent => match &cfg.external_planner_url {
            Some(url) => Arc::new(ExternalPlanner::new(url.clone())),
            None => {
                tracing::warn!("PLANNER_MODE=external_agent without EXTERNAL_PLANNER_URL, using basic");
                Arc::new(BasicPlanner)
            }
        },
    }
}

// ---------------------------------------------------------------------------
// Shared plan construction
// ---------------------------------------------------------------------------

fn window_for(session: &SessionContext) -> (NaiveDate, NaiveDate) {
    parse::parse_date_range(&session.query).unwrap_or_else(|| {
        (
            session.today - ChronoDuration::days(DEFAULT_WINDOW_DAYS),
            session.today,
        )
    })
}

fn position_rows(portfolio: &[(String, f64)]) -> Vec<Value> {
    portfolio
        .iter()
        .map(|(t, w)| json!({"ticker": t, "weight": w}))
        .collect()
}

/// Materialise the scenario's template into a concrete plan. The
/// catalogue supplies the ordered tool skeleton and fatality markers;
/// this function binds arguments from the parsed request.
pub fn build_for_scenario(
    scenario: ScenarioType,
    session: &SessionContext,
    cfg: &AgentConfig,
) -> Result<Plan, PlanError> {
    let skeleton = template(scenario);
    let anchor: &TemplateStep = skeleton
        .iter()
        .find(|s| s.fatal)
        .expect("every template has a fatal anchor");
    let explain: &TemplateStep = skeleton.last().expect("templates are non-empty");

    let (from, to) = window_for(session);
    let (from_s, to_s) = (from.to_string(), to.to_string());
    let tickers = parse::extract_tickers(&session.query);
    let mut portfolio = parse::parse_portfolio(&session.query);
    if portfolio.is_empty() && !tickers.is_empty() {
        let w = 1.0 / tickers.len() as f64;
        portfolio = tickers.iter().map(|t| (t.clone(), w)).collect();
    }

    let mut plan = Plan::new(scenario);
    match scenario {
        ScenarioType::PortfolioRisk | ScenarioType::PortfolioRiskDrillDown => {
            if portfolio.is_empty() {
                return Err(PlanError::Unplannable(
                    "no tickers or portfolio found in the request".to_string(),
                ));
            }

            let analyze_id = if portfolio.len() > cfg.max_tickers_per_request {
                let limit_id = plan.push(
                    StepKind::LimitPortfolio,
                    "limit_portfolio",
                    json!({
                        "positions": position_rows(&portfolio),
                        "top_n": cfg.max_tickers_per_request,
                    }),
                    vec![],
                    false,
                );
                plan.push(
                    StepKind::McpCall,
                    anchor.tool,
                    json!({
                        "positions": step_ref(limit_id, "positions"),
                        "from_date": from_s,
                        "to_date": to_s,
                    }),
                    vec![limit_id],
                    anchor.fatal,
                )
            } else {
                plan.push(
                    StepKind::McpCall,
                    anchor.tool,
                    json!({
                        "positions": position_rows(&portfolio),
                        "from_date": from_s,
                        "to_date": to_s,
                    }),
                    vec![],
                    anchor.fatal,
                )
            };

            let mut explain_deps = vec![analyze_id];
            if scenario == ScenarioType::PortfolioRiskDrillDown && portfolio.len() >= 2 {
                let corr_tickers: Vec<String> = portfolio
                    .iter()
                    .take(cfg.max_tickers_per_request)
                    .map(|(t, _)| t.clone())
                    .collect();
                let corr_id = plan.push(
                    StepKind::McpCall,
                    skeleton[1].tool,
                    json!({
                        "tickers": corr_tickers,
                        "from_date": from_s,
                        "to_date": to_s,
                    }),
                    vec![],
                    skeleton[1].fatal,
                );
                explain_deps.push(corr_id);
            }
            plan.push(
                StepKind::Explanation,
                explain.tool,
                json!({}),
                explain_deps,
                false,
            );
        }

        ScenarioType::SingleSecurityOverview => {
            let ticker = tickers.first().ok_or_else(|| {
                PlanError::Unplannable("no ticker found in the request".to_string())
            })?;
            let snap_id = plan.push(
                StepKind::McpCall,
                skeleton[0].tool,
                json!({"ticker": ticker}),
                vec![],
                skeleton[0].fatal,
            );
            let ohlcv_id = plan.push(
                StepKind::McpCall,
                skeleton[1].tool,
                json!({
                    "ticker": ticker,
                    "from_date": from_s,
                    "to_date": to_s,
                }),
                vec![],
                skeleton[1].fatal,
            );
            plan.push(
                StepKind::Explanation,
                explain.tool,
                json!({}),
                vec![snap_id, ohlcv_id],
                false,
            );
        }

        ScenarioType::CompareSecurities | ScenarioType::IssuerPeersCompare => {
            if tickers.len() < 2 {
                return Err(PlanError::Unplannable(
                    "need at least two tickers to compare".to_string(),
                ));
            }
            let subset: Vec<String> = tickers
                .iter()
                .take(cfg.max_tickers_per_request)
                .cloned()
                .collect();
            let mut explain_deps = Vec::new();
            for ticker in &subset {
                explain_deps.push(plan.push(
                    StepKind::McpCall,
                    skeleton[0].tool,
                    json!({"ticker": ticker}),
                    vec![],
                    skeleton[0].fatal,
                ));
            }
            let corr_id = plan.push(
                StepKind::McpCall,
                anchor.tool,
                json!({
                    "tickers": subset,
                    "from_date": from_s,
                    "to_date": to_s,
                }),
                vec![],
                anchor.fatal,
            );
            explain_deps.push(corr_id);
            plan.push(
                StepKind::Explanation,
                explain.tool,
                json!({}),
                explain_deps,
                false,
            );
        }

        ScenarioType::IndexRiskScan => {
            let index = tickers.iter().find(|t| parse::is_index_ticker(t));
            let arguments = match index {
                Some(index) => json!({"index_ticker": index}),
                None => json!({}),
            };
            let metrics_id = plan.push(
                StepKind::McpCall,
                anchor.tool,
                arguments,
                vec![],
                anchor.fatal,
            );
            plan.push(
                StepKind::Explanation,
                explain.tool,
                json!({}),
                vec![metrics_id],
                false,
            );
        }

        ScenarioType::CfoLiquidityReport => {
            if portfolio.is_empty() {
                return Err(PlanError::Unplannable(
                    "a liquidity report needs portfolio positions".to_string(),
                ));
            }
            let report_id = plan.push(
                StepKind::McpCall,
                anchor.tool,
                json!({"positions": position_rows(&portfolio)}),
                vec![],
                anchor.fatal,
            );
            plan.push(
                StepKind::Explanation,
                explain.tool,
                json!({}),
                vec![report_id],
                false,
            );
        }
    }

    Ok(plan)
}

// ---------------------------------------------------------------------------
// Basic strategy
// ---------------------------------------------------------------------------

pub struct BasicPlanner;

#[async_trait]
impl PlannerStrategy for BasicPlanner {
    async fn build_plan(
        &self,
        session: &SessionContext,
        cfg: &AgentConfig,
    ) -> Result<Plan, PlanError> {
        build_for_scenario(parse::classify(&session.query), session, cfg)
    }

    async fn replan(
        &self,
        _session: &SessionContext,
        _cfg: &AgentConfig,
        plan: &Plan,
        result: &PlanExecutionResult,
    ) -> Option<Plan> {
        heuristic_rewrite(plan, result)
    }

    fn max_replan_attempts(&self) -> usize {
        1
    }
}

/// Category-keyed rewrites shared by every strategy's fallback path.
pub fn heuristic_rewrite(plan: &Plan, result: &PlanExecutionResult) -> Option<Plan> {
    let failed = result.first_error()?;
    let category = failed.error_category?;
    match category {
        ErrorCategory::DateRangeTooLarge => halve_windows(plan),
        ErrorCategory::TooManyTickers => shrink_tickers(plan, failed.step_id),
        ErrorCategory::RateLimit => {
            let mut next = plan.clone();
            next.parallelism = Some(1);
            next.backoff_ms = Some(RATE_LIMIT_BACKOFF_MS);
            Some(next)
        }
        ErrorCategory::IssTimeout => {
            // Serialise everything so a single request is in flight at a time
            let mut next = plan.clone();
            next.parallelism = Some(1);
            for i in 1..next.steps.len() {
                if !next.steps[i].depends_on.contains(&(i - 1)) {
                    next.steps[i].depends_on.push(i - 1);
                    next.steps[i].depends_on.sort_unstable();
                }
            }
            Some(next)
        }
        ErrorCategory::InvalidTicker => drop_ticker(plan, &failed.digest),
        _ => None,
    }
}

fn parse_window(args: &Value) -> Option<(NaiveDate, NaiveDate)> {
    let from = args.get("from_date")?.as_str()?;
    let to = args.get("to_date")?.as_str()?;
    Some((
        NaiveDate::parse_from_str(from, "%Y-%m-%d").ok()?,
        NaiveDate::parse_from_str(to, "%Y-%m-%d").ok()?,
    ))
}

/// Halve every dated window in the plan, keeping the recent half and
/// clamping to the provider lookback cap.
fn halve_windows(plan: &Plan) -> Option<Plan> {
    let mut next = plan.clone();
    let mut touched = false;
    for step in &mut next.steps {
        if let Some((from, to)) = parse_window(&step.arguments) {
            let half = ((to - from).num_days() / 2).min(MAX_PROVIDER_LOOKBACK_DAYS);
            if half < 1 {
                continue;
            }
            let new_from = to - ChronoDuration::days(half);
            step.arguments["from_date"] = Value::String(new_from.to_string());
            touched = true;
        }
    }
    touched.then_some(next)
}

/// Keep the heaviest half of any positions list on the failing step and
/// the front half of plain ticker lists.
fn shrink_tickers(plan: &Plan, failed_step: usize) -> Option<Plan> {
    let mut next = plan.clone();
    let step = next.steps.get_mut(failed_step)?;
    let mut touched = false;

    if let Some(positions) = step.arguments.get("positions").and_then(Value::as_array) {
        let parsed: Vec<(String, f64)> = positions
            .iter()
            .filter_map(|p| {
                Some((
                    p.get("ticker")?.as_str()?.to_string(),
                    p.get("weight")?.as_f64()?,
                ))
            })
            .collect();
        if parsed.len() > 1 {
            let keep = parsed.len().div_ceil(2);
            let truncated = parse::truncate_positions(&parsed, keep);
            step.arguments["positions"] = truncated["positions"].clone();
            touched = true;
        }
    }
    if let Some(tickers) = step.arguments.get("tickers").and_then(Value::as_array) {
        if tickers.len() > 2 {
            let keep = tickers.len().div_ceil(2).max(2);
            step.arguments["tickers"] = Value::Array(tickers[..keep].to_vec());
            touched = true;
        }
    }
    touched.then_some(next)
}

/// Remove a ticker named in the failure digest from every argument list.
fn drop_ticker(plan: &Plan, digest: &str) -> Option<Plan> {
    let offender = parse::extract_tickers(digest).into_iter().next()?;
    let mut next = plan.clone();
    let mut touched = false;

    for step in &mut next.steps {
        if let Some(positions) = step.arguments.get_mut("positions").and_then(Value::as_array_mut) {
            let before = positions.len();
            positions.retain(|p| {
                p.get("ticker").and_then(Value::as_str) != Some(offender.as_str())
            });
            if positions.len() != before && !positions.is_empty() {
                // Renormalise the survivors
                let sum: f64 = positions
                    .iter()
                    .filter_map(|p| p.get("weight").and_then(Value::as_f64))
                    .sum();
                if sum > 0.0 {
                    for p in positions.iter_mut() {
                        if let Some(w) = p.get("weight").and_then(Value::as_f64) {
                            p["weight"] = json!(w / sum);
                        }
                    }
                }
                touched = true;
            }
        }
        if let Some(tickers) = step.arguments.get_mut("tickers").and_then(Value::as_array_mut) {
            let before = tickers.len();
            tickers.retain(|t| t.as_str() != Some(offender.as_str()));
            if tickers.len() != before && tickers.len() >= 2 {
                touched = true;
            }
        }
    }
    touched.then_some(next)
}

// ---------------------------------------------------------------------------
// Advanced strategy (LLM-assisted)
// ---------------------------------------------------------------------------

/// Strict JSON schema for LLM plan output.
#[derive(Debug, Deserialize)]
struct LlmPlan {
    scenario_type: Option<String>,
    steps: Vec<LlmStep>,
}

#[derive(Debug, Deserialize)]
struct LlmStep {
    tool: String,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    arguments: Value,
    #[serde(default)]
    depends_on: Vec<usize>,
    #[serde(default)]
    fatal: bool,
}

fn plan_from_llm(value: &Value, fallback_scenario: ScenarioType) -> Option<Plan> {
    let parsed: LlmPlan = serde_json::from_value(value.clone()).ok()?;
    let scenario = parsed
        .scenario_type
        .as_deref()
        .and_then(|s| s.parse().ok())
        .unwrap_or(fallback_scenario);

    let mut plan = Plan::new(scenario);
    for step in parsed.steps {
        let kind = match step.kind.as_deref() {
            Some("limit_portfolio") => StepKind::LimitPortfolio,
            Some("rag_search") => StepKind::RagSearch,
            Some("explanation") => StepKind::Explanation,
            _ => StepKind::McpCall,
        };
        plan.push(kind, &step.tool, step.arguments, step.depends_on, step.fatal);
    }
    (!plan.steps.is_empty()).then_some(plan)
}

pub struct AdvancedPlanner {
    pub llm: Option<Arc<dyn ChatClient>>,
}

const CLASSIFY_SYSTEM: &str = "You classify financial analysis requests for the Moscow Exchange. \
Respond with exactly one JSON object: {\"scenario_type\": \"<type>\"}. No prose.";

const REPLAN_SYSTEM: &str = "You repair failed tool execution plans for a MOEX financial agent. \
Respond with exactly one JSON object: {\"scenario_type\": \"...\", \"steps\": [{\"tool\": \"...\", \
\"kind\": \"mcp_call\", \"arguments\": {...}, \"depends_on\": [], \"fatal\": false}]}. \
Use only the tools listed in the prompt, respect the limits, and fix the reported error. No prose.";

#[async_trait]
impl PlannerStrategy for AdvancedPlanner {
    async fn build_plan(
        &self,
        session: &SessionContext,
        cfg: &AgentConfig,
    ) -> Result<Plan, PlanError> {
        if let Some(scenario) = parse::classify_confident(&session.query) {
            return build_for_scenario(scenario, session, cfg);
        }
        // Ambiguous: let the model pick the scenario, keep plan building
        // deterministic.
        if let Some(llm) = &self.llm {
            let user = format!(
                "Request: {}\nAllowed scenario types: {}",
                session.query,
                ScenarioType::all()
                    .iter()
                    .map(|t| t.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            );
            if let Ok(text) = llm.complete(CLASSIFY_SYSTEM, &user).await {
                if let Some(scenario) = extract_json(&text)
                    .and_then(|v| v.get("scenario_type")?.as_str().map(str::to_string))
                    .and_then(|s| s.parse::<ScenarioType>().ok())
                {
                    return build_for_scenario(scenario, session, cfg);
                }
            }
            tracing::warn!("LLM classification failed, falling back to heuristics");
        }
        BasicPlanner.build_plan(session, cfg).await
    }

    async fn replan(
        &self,
        session: &SessionContext,
        cfg: &AgentConfig,
        plan: &Plan,
        result: &PlanExecutionResult,
    ) -> Option<Plan> {
        if let Some(llm) = &self.llm {
            let user = format!(
                "Request: {}\nAvailable tools: {}\nLimits: max_steps={}, max_tickers={}\n\
                 Current plan: {}\nExecution result: {}",
                session.query,
                super::tools::RISK_MCP_TOOLS.join(", "),
                cfg.max_plan_steps,
                cfg.max_tickers_per_request,
                serde_json::to_string(plan).unwrap_or_default(),
                serde_json::to_string(result).unwrap_or_default(),
            );
            if let Ok(text) = llm.complete(REPLAN_SYSTEM, &user).await {
                if let Some(candidate) =
                    extract_json(&text).and_then(|v| plan_from_llm(&v, plan.scenario_type))
                {
                    if validate_plan(&candidate, &plan_limits(cfg)).is_ok() {
                        return Some(candidate);
                    }
                    tracing::warn!("LLM re-plan failed validation, falling back to heuristics");
                }
            }
        }
        heuristic_rewrite(plan, result)
    }

    fn max_replan_attempts(&self) -> usize {
        2
    }
}

// ---------------------------------------------------------------------------
// External strategy (delegated endpoint)
// ---------------------------------------------------------------------------

pub struct ExternalPlanner {
    url: String,
    client: reqwest::Client,
}

impl ExternalPlanner {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    async fn delegate(&self, payload: &Value, fallback: ScenarioType) -> Option<Plan> {
        let response = self.client.post(&self.url).json(payload).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        let body: Value = response.json().await.ok()?;
        plan_from_llm(&body, fallback)
    }
}

#[async_trait]
impl PlannerStrategy for ExternalPlanner {
    async fn build_plan(
        &self,
        session: &SessionContext,
        cfg: &AgentConfig,
    ) -> Result<Plan, PlanError> {
        let payload = json!({
            "query": session.query,
            "locale": session.locale,
            "limits": {"max_steps": cfg.max_plan_steps, "max_tickers": cfg.max_tickers_per_request},
        });
        let fallback = parse::classify(&session.query);
        if let Some(plan) = self.delegate(&payload, fallback).await {
            if validate_plan(&plan, &plan_limits(cfg)).is_ok() {
                return Ok(plan);
            }
            tracing::warn!("external planner produced an invalid plan, falling back");
        }
        BasicPlanner.build_plan(session, cfg).await
    }

    async fn replan(
        &self,
        session: &SessionContext,
        cfg: &AgentConfig,
        plan: &Plan,
        result: &PlanExecutionResult,
    ) -> Option<Plan> {
        let payload = json!({
            "query": session.query,
            "plan": plan,
            "result": result,
            "limits": {"max_steps": cfg.max_plan_steps, "max_tickers": cfg.max_tickers_per_request},
        });
        if let Some(candidate) = self.delegate(&payload, plan.scenario_type).await {
            if validate_plan(&candidate, &plan_limits(cfg)).is_ok() {
                return Some(candidate);
            }
        }
        heuristic_rewrite(plan, result)
    }

    fn max_replan_attempts(&self) -> usize {
        2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::session::{ExecutedStep, StepStatus};

    fn session(query: &str) -> SessionContext {
        let mut s = SessionContext::new(
            "s".to_string(),
            query.to_string(),
            "en".to_string(),
            "analyst".to_string(),
        );
        s.today = NaiveDate::from_ymd_opt(2024, 12, 1).unwrap();
        s
    }

    fn failed_step(step_id: usize, category: ErrorCategory, digest: &str) -> PlanExecutionResult {
        PlanExecutionResult {
            steps: vec![ExecutedStep {
                step_id,
                tool: "analyze_portfolio_risk".to_string(),
                status: StepStatus::Error,
                error_category: Some(category),
                duration_ms: 10,
                digest: digest.to_string(),
            }],
            has_fatal_error: true,
            total_duration_ms: 10,
        }
    }

    #[tokio::test]
    async fn portfolio_plan_built_from_query() {
        let s = session("Analyze my portfolio: SBER=45%, GAZP=30%, LKOH=25% over 2024-01-01..2024-12-01");
        let plan = BasicPlanner
            .build_plan(&s, &AgentConfig::default())
            .await
            .unwrap();

        assert_eq!(plan.scenario_type, ScenarioType::PortfolioRisk);
        assert_eq!(plan.steps[0].tool, "analyze_portfolio_risk");
        assert!(plan.steps[0].fatal);
        assert_eq!(plan.steps[0].arguments["from_date"], "2024-01-01");
        let positions = plan.steps[0].arguments["positions"].as_array().unwrap();
        assert_eq!(positions.len(), 3);
        // Plan validates under default limits
        assert!(validate_plan(&plan, &plan_limits(&AgentConfig::default())).is_ok());
    }

    #[tokio::test]
    async fn oversized_portfolio_gets_limit_step() {
        let entries: Vec<String> = (0..12).map(|i| format!("TK{i}A=8%")).collect();
        let s = session(&format!("portfolio risk for {}", entries.join(", ")));
        let plan = BasicPlanner
            .build_plan(&s, &AgentConfig::default())
            .await
            .unwrap();

        assert_eq!(plan.steps[0].kind, StepKind::LimitPortfolio);
        assert_eq!(plan.steps[1].tool, "analyze_portfolio_risk");
        assert!(plan.steps[1].arguments["positions"].get("$ref").is_some());
        assert_eq!(plan.steps[1].depends_on, vec![0]);
    }

    #[tokio::test]
    async fn unplannable_without_tickers() {
        let s = session("help me make money");
        // classify() falls back to portfolio_risk, which needs positions
        let err = BasicPlanner
            .build_plan(&s, &AgentConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PlanError::Unplannable(_)));
    }

    #[tokio::test]
    async fn date_range_rewrite_halves_window() {
        let s = session("portfolio SBER=50%, GAZP=50% over 2018-01-01..2024-12-31");
        let plan = BasicPlanner
            .build_plan(&s, &AgentConfig::default())
            .await
            .unwrap();
        let result = failed_step(0, ErrorCategory::DateRangeTooLarge, "window too large");
        let next = BasicPlanner
            .replan(&s, &AgentConfig::default(), &plan, &result)
            .await
            .unwrap();

        let from =
            NaiveDate::parse_from_str(next.steps[0].arguments["from_date"].as_str().unwrap(), "%Y-%m-%d")
                .unwrap();
        let to =
            NaiveDate::parse_from_str(next.steps[0].arguments["to_date"].as_str().unwrap(), "%Y-%m-%d")
                .unwrap();
        // Halved, clamped to the 730-day provider cap
        assert_eq!((to - from).num_days(), 730);
        assert_eq!(to, NaiveDate::from_ymd_opt(2024, 12, 31).unwrap());
        assert_ne!(next.signature(), plan.signature());
    }

    #[tokio::test]
    async fn rate_limit_rewrite_slows_down() {
        let s = session("portfolio SBER=50%, GAZP=50%");
        let plan = BasicPlanner
            .build_plan(&s, &AgentConfig::default())
            .await
            .unwrap();
        let result = failed_step(0, ErrorCategory::RateLimit, "429");
        let next = BasicPlanner
            .replan(&s, &AgentConfig::default(), &plan, &result)
            .await
            .unwrap();

        assert_eq!(next.parallelism, Some(1));
        assert_eq!(next.backoff_ms, Some(500));
        // Policy participates in the signature, so this is not a duplicate
        assert_ne!(next.signature(), plan.signature());
    }

    #[tokio::test]
    async fn invalid_ticker_rewrite_drops_offender() {
        let s = session("portfolio SBER=50%, ZZZZ=50%");
        let plan = BasicPlanner
            .build_plan(&s, &AgentConfig::default())
            .await
            .unwrap();
        let result = failed_step(
            0,
            ErrorCategory::InvalidTicker,
            "Unknown or malformed ticker: ZZZZ",
        );
        let next = BasicPlanner
            .replan(&s, &AgentConfig::default(), &plan, &result)
            .await
            .unwrap();

        let positions = next.steps[0].arguments["positions"].as_array().unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0]["ticker"], "SBER");
        assert!((positions[0]["weight"].as_f64().unwrap() - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn fatal_categories_produce_no_rewrite() {
        let s = session("portfolio SBER=50%, GAZP=50%");
        let plan = BasicPlanner
            .build_plan(&s, &AgentConfig::default())
            .await
            .unwrap();
        let result = failed_step(0, ErrorCategory::ValidationError, "bad input");
        assert!(BasicPlanner
            .replan(&s, &AgentConfig::default(), &plan, &result)
            .await
            .is_none());
    }

    #[test]
    fn llm_plan_parsing_and_validation() {
        let value = serde_json::json!({
            "scenario_type": "portfolio_risk",
            "steps": [
                {"tool": "analyze_portfolio_risk", "kind": "mcp_call",
                 "arguments": {"positions": [{"ticker": "SBER", "weight": 1.0}],
                               "from_date": "2024-01-01", "to_date": "2024-06-01"},
                 "depends_on": [], "fatal": true},
                {"tool": "compose_answer", "kind": "explanation",
                 "arguments": {}, "depends_on": [0]}
            ]
        });
        let plan = plan_from_llm(&value, ScenarioType::PortfolioRisk).unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[1].kind, StepKind::Explanation);
        assert!(validate_plan(&plan, &PlanLimits::default()).is_ok());
    }

    #[test]
    fn llm_garbage_rejected() {
        assert!(plan_from_llm(
            &serde_json::json!({"steps": "not an array"}),
            ScenarioType::PortfolioRisk
        )
        .is_none());
        assert!(plan_from_llm(&serde_json::json!({"steps": []}), ScenarioType::PortfolioRisk).is_none());
    }
}
