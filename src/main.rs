use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::{self, EnvFilter};

use moex_agent_mcp::agent::http::router;
use moex_agent_mcp::agent::llm::{ChatClient, HttpChatClient};
use moex_agent_mcp::agent::planner::make_planner;
use moex_agent_mcp::agent::tools::{HttpMcpClient, LocalTransport, ToolTransport};
use moex_agent_mcp::agent::AgentService;
use moex_agent_mcp::config::{AgentConfig, ProviderConfig, RiskMcpConfig};
use moex_agent_mcp::data::cached::CachedProvider;
use moex_agent_mcp::data::fixture::FixtureProvider;
use moex_agent_mcp::data::iss::IssProvider;
use moex_agent_mcp::data::MarketDataProvider;
use moex_agent_mcp::mcp::metrics::McpMetrics;
use moex_agent_mcp::mcp::server::RiskMcpServer;

/// Build the tool transport: remote MCP servers when `MCP_URL` is set,
/// otherwise an in-process dispatcher in front of the same tool core.
fn build_transport(cfg: &AgentConfig) -> Result<Arc<dyn ToolTransport>> {
    if !cfg.mcp_urls.is_empty() {
        tracing::info!("Using MCP servers: {}", cfg.mcp_urls.join(", "));
        let client = HttpMcpClient::new(cfg.mcp_urls.clone(), cfg.step_deadline)
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        return Ok(Arc::new(client));
    }

    let risk_cfg = RiskMcpConfig::from_env();
    let provider: Arc<dyn MarketDataProvider> = if cfg.environment == "dev" {
        let to = chrono::Utc::now().date_naive();
        let from = to - chrono::Duration::days(risk_cfg.max_lookback_days);
        tracing::info!("ENVIRONMENT=dev: in-process tools over fixture data");
        Arc::new(FixtureProvider::seeded(
            &["SBER", "GAZP", "LKOH", "ROSN", "GMKN", "NVTK", "TATN", "YDEX"],
            from,
            to,
        ))
    } else {
        let provider_cfg = ProviderConfig::from_env();
        let iss = IssProvider::new(provider_cfg.clone()).map_err(|e| anyhow::anyhow!("{e}"))?;
        if provider_cfg.enable_cache {
            Arc::new(CachedProvider::new(
                iss,
                provider_cfg.cache_ttl,
                provider_cfg.cache_max_size,
            ))
        } else {
            Arc::new(iss)
        }
    };

    let server = RiskMcpServer::new(provider, risk_cfg, Arc::new(McpMetrics::new()), None);
    Ok(Arc::new(LocalTransport::new(server)))
}

/// `AGENT_SERVICE_URL` may carry a scheme; the bind address is what is
/// left after stripping it.
fn bind_addr(service_url: &str) -> String {
    let stripped = service_url
        .trim_start_matches("http://")
        .trim_start_matches("https://");
    let stripped = stripped.split('/').next().unwrap_or(stripped);
    if let Ok(port) = std::env::var("PORT") {
        if let Some(host) = stripped.split(':').next() {
            return format!("{host}:{port}");
        }
    }
    stripped.to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cfg = AgentConfig::from_env();

    let transport = build_transport(&cfg)?;
    let llm: Option<Arc<dyn ChatClient>> = HttpChatClient::from_config(&cfg)
        .map(|client| Arc::new(client) as Arc<dyn ChatClient>);
    if llm.is_some() {
        tracing::info!("LLM narrative/planning enabled via {}", cfg.llm_api_base.as_deref().unwrap_or(""));
    } else {
        tracing::info!("No LLM configured; deterministic planning and narratives");
    }

    let planner = make_planner(&cfg, llm.clone());
    let service = Arc::new(AgentService::new(cfg.clone(), transport, planner, llm));
    let app = router(service);

    let addr = bind_addr(&cfg.service_url);
    tracing::info!("Starting moex-agent on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
