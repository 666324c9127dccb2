//! Environment-driven configuration for the agent and MCP services.
//!
//! Every knob has a default; unparseable values fall back to the default
//! with a warning rather than aborting startup.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

/// Parse an environment variable, falling back to `default` when unset
/// or unparseable.
fn env_parse<T>(name: &str, default: T) -> T
where
    T: FromStr + Display + Copy,
{
    match std::env::var(name) {
        Ok(raw) => match raw.parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!("Invalid {name}={raw}, using default {default}");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// MOEX ISS data-provider configuration.
///
/// | Env Var | Default | Purpose |
/// |---------|---------|---------|
/// | `MOEX_ISS_BASE_URL` | `https://iss.moex.com` | ISS endpoint root |
/// | `MOEX_ISS_RATE_LIMIT_RPS` | `3` | Token-bucket refill rate |
/// | `MOEX_ISS_TIMEOUT_SECONDS` | `10` | Per-request network deadline |
/// | `MOEX_ISS_MAX_LOOKBACK_DAYS` | `730` | Hard cap on any requested window |
/// | `ENABLE_CACHE` | `true` | TTL cache on/off |
/// | `CACHE_TTL_SECONDS` | `30` | Cache entry lifetime |
/// | `CACHE_MAX_SIZE` | `256` | Cache entry cap |
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub rate_limit_rps: u32,
    pub timeout: Duration,
    pub max_lookback_days: i64,
    pub enable_cache: bool,
    pub cache_ttl: Duration,
    pub cache_max_size: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://iss.moex.com".to_string(),
            rate_limit_rps: 3,
            timeout: Duration::from_secs(10),
            max_lookback_days: 730,
            enable_cache: true,
            cache_ttl: Duration::from_secs(30),
            cache_max_size: 256,
        }
    }
}

impl ProviderConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: env_string("MOEX_ISS_BASE_URL", &defaults.base_url),
            rate_limit_rps: env_parse("MOEX_ISS_RATE_LIMIT_RPS", defaults.rate_limit_rps),
            timeout: Duration::from_secs(env_parse("MOEX_ISS_TIMEOUT_SECONDS", 10u64)),
            max_lookback_days: env_parse("MOEX_ISS_MAX_LOOKBACK_DAYS", defaults.max_lookback_days),
            enable_cache: env_parse("ENABLE_CACHE", true),
            cache_ttl: Duration::from_secs(env_parse("CACHE_TTL_SECONDS", 30u64)),
            cache_max_size: env_parse("CACHE_MAX_SIZE", defaults.cache_max_size),
        }
    }
}

/// Planner strategy selector (`PLANNER_MODE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlannerMode {
    #[default]
    Basic,
    Advanced,
    ExternalAgent,
}

impl FromStr for PlannerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "basic" => Ok(Self::Basic),
            "advanced" => Ok(Self::Advanced),
            "external_agent" | "external" => Ok(Self::ExternalAgent),
            other => Err(format!("unknown planner mode: {other}")),
        }
    }
}

/// Orchestrator-agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Bind address for the agent HTTP service.
    pub service_url: String,
    pub llm_api_base: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_model_main: String,
    pub llm_model_fallback: String,
    pub llm_model_dev: String,
    pub environment: String,
    /// Comma-separated MCP server URLs.
    pub mcp_urls: Vec<String>,
    pub planner_mode: PlannerMode,
    pub external_planner_url: Option<String>,
    pub max_tickers_per_request: usize,
    pub max_plan_steps: usize,
    pub orchestrator_parallelism: usize,
    pub request_deadline: Duration,
    pub step_deadline: Duration,
    pub llm_deadline: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            service_url: "0.0.0.0:8080".to_string(),
            llm_api_base: None,
            llm_api_key: None,
            llm_model_main: "gpt-4o".to_string(),
            llm_model_fallback: "gpt-4o-mini".to_string(),
            llm_model_dev: "gpt-4o-mini".to_string(),
            environment: "dev".to_string(),
            mcp_urls: Vec::new(),
            planner_mode: PlannerMode::Basic,
            external_planner_url: None,
            max_tickers_per_request: 10,
            max_plan_steps: 12,
            orchestrator_parallelism: 4,
            request_deadline: Duration::from_secs(60),
            step_deadline: Duration::from_secs(20),
            llm_deadline: Duration::from_secs(30),
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let planner_mode = env_opt("PLANNER_MODE")
            .and_then(|raw| match raw.parse() {
                Ok(mode) => Some(mode),
                Err(e) => {
                    tracing::warn!("Invalid PLANNER_MODE: {e}, using basic");
                    None
                }
            })
            .unwrap_or_default();

        Self {
            service_url: env_string("AGENT_SERVICE_URL", &defaults.service_url),
            llm_api_base: env_opt("LLM_API_BASE"),
            llm_api_key: env_opt("LLM_API_KEY"),
            llm_model_main: env_string("LLM_MODEL_MAIN", &defaults.llm_model_main),
            llm_model_fallback: env_string("LLM_MODEL_FALLBACK", &defaults.llm_model_fallback),
            llm_model_dev: env_string("LLM_MODEL_DEV", &defaults.llm_model_dev),
            environment: env_string("ENVIRONMENT", &defaults.environment),
            mcp_urls: env_opt("MCP_URL")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            planner_mode,
            external_planner_url: env_opt("EXTERNAL_PLANNER_URL"),
            max_tickers_per_request: env_parse(
                "MAX_TICKERS_PER_REQUEST",
                defaults.max_tickers_per_request,
            ),
            max_plan_steps: env_parse("MAX_PLAN_STEPS", defaults.max_plan_steps),
            orchestrator_parallelism: env_parse(
                "ORCHESTRATOR_PARALLELISM",
                defaults.orchestrator_parallelism,
            ),
            request_deadline: Duration::from_secs(env_parse("REQUEST_DEADLINE_SECONDS", 60u64)),
            step_deadline: Duration::from_secs(env_parse("STEP_DEADLINE_SECONDS", 20u64)),
            llm_deadline: Duration::from_secs(env_parse("LLM_DEADLINE_SECONDS", 30u64)),
        }
    }
}

/// Risk MCP server configuration.
#[derive(Debug, Clone)]
pub struct RiskMcpConfig {
    pub host: String,
    pub port: u16,
    pub max_portfolio_tickers: usize,
    pub max_correlation_tickers: usize,
    pub max_peers: usize,
    pub max_lookback_days: i64,
    pub default_index_ticker: String,
    /// Per-tool concurrent execution cap.
    pub tool_concurrency: usize,
    /// Process-wide concurrent execution cap.
    pub global_concurrency: usize,
    /// Per-call handler deadline.
    pub tool_deadline: Duration,
}

impl Default for RiskMcpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8765,
            max_portfolio_tickers: 10,
            max_correlation_tickers: 15,
            max_peers: 8,
            max_lookback_days: 730,
            default_index_ticker: "IMOEX".to_string(),
            tool_concurrency: 4,
            global_concurrency: 16,
            tool_deadline: Duration::from_secs(20),
        }
    }
}

impl RiskMcpConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env_string("RISK_MCP_HOST", &defaults.host),
            port: env_parse("RISK_MCP_PORT", defaults.port),
            max_portfolio_tickers: env_parse(
                "RISK_MAX_PORTFOLIO_TICKERS",
                defaults.max_portfolio_tickers,
            ),
            max_correlation_tickers: env_parse(
                "RISK_MAX_CORRELATION_TICKERS",
                defaults.max_correlation_tickers,
            ),
            max_peers: env_parse("RISK_MAX_PEERS", defaults.max_peers),
            max_lookback_days: env_parse("RISK_MAX_LOOKBACK_DAYS", defaults.max_lookback_days),
            default_index_ticker: env_string(
                "RISK_DEFAULT_INDEX_TICKER",
                &defaults.default_index_ticker,
            ),
            tool_concurrency: env_parse("RISK_TOOL_CONCURRENCY", defaults.tool_concurrency),
            global_concurrency: env_parse("RISK_GLOBAL_CONCURRENCY", defaults.global_concurrency),
            tool_deadline: Duration::from_secs(env_parse("RISK_TOOL_DEADLINE_SECONDS", 20u64)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_defaults() {
        let cfg = ProviderConfig::default();
        assert_eq!(cfg.rate_limit_rps, 3);
        assert_eq!(cfg.timeout, Duration::from_secs(10));
        assert_eq!(cfg.max_lookback_days, 730);
        assert!(cfg.enable_cache);
        assert_eq!(cfg.cache_max_size, 256);
    }

    #[test]
    fn planner_mode_parsing() {
        assert_eq!("basic".parse::<PlannerMode>().unwrap(), PlannerMode::Basic);
        assert_eq!(
            "advanced".parse::<PlannerMode>().unwrap(),
            PlannerMode::Advanced
        );
        assert_eq!(
            "external_agent".parse::<PlannerMode>().unwrap(),
            PlannerMode::ExternalAgent
        );
        assert!("noop".parse::<PlannerMode>().is_err());
    }

    #[test]
    fn agent_defaults() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.max_tickers_per_request, 10);
        assert_eq!(cfg.max_plan_steps, 12);
        assert_eq!(cfg.orchestrator_parallelism, 4);
        assert_eq!(cfg.request_deadline, Duration::from_secs(60));
    }
}
