use anyhow::Result;
use rmcp::ServiceExt;
use std::sync::Arc;
use tracing_subscriber::{self, EnvFilter};

use moex_agent_mcp::config::{ProviderConfig, RiskMcpConfig};
use moex_agent_mcp::data::cached::CachedProvider;
use moex_agent_mcp::data::fixture::FixtureProvider;
use moex_agent_mcp::data::iss::IssProvider;
use moex_agent_mcp::data::MarketDataProvider;
use moex_agent_mcp::mcp::metrics::McpMetrics;
use moex_agent_mcp::mcp::server::RiskMcpServer;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cfg = RiskMcpConfig::from_env();
    let provider_cfg = ProviderConfig::from_env();
    let metrics = Arc::new(McpMetrics::new());

    // Dev profile runs fully offline against the deterministic fixture.
    let environment = std::env::var("ENVIRONMENT").unwrap_or_else(|_| "prod".to_string());
    let (provider, cache): (Arc<dyn MarketDataProvider>, _) = if environment == "dev" {
        let to = chrono::Utc::now().date_naive();
        let from = to - chrono::Duration::days(cfg.max_lookback_days);
        tracing::info!("ENVIRONMENT=dev: serving fixture market data");
        (
            Arc::new(FixtureProvider::seeded(
                &["SBER", "GAZP", "LKOH", "ROSN", "GMKN", "NVTK", "TATN", "YDEX"],
                from,
                to,
            )),
            None,
        )
    } else {
        let iss = IssProvider::new(provider_cfg.clone())?;
        if provider_cfg.enable_cache {
            let cached = CachedProvider::new(iss, provider_cfg.cache_ttl, provider_cfg.cache_max_size);
            let handle = cached.cache_handle();
            (Arc::new(cached), Some(handle))
        } else {
            (Arc::new(iss), None)
        }
    };

    let server = RiskMcpServer::new(provider, cfg.clone(), Arc::clone(&metrics), cache);

    if std::env::var("RISK_MCP_PORT").is_ok() || std::env::var("PORT").is_ok() {
        // HTTP mode with server-sent-event framing on /mcp
        use rmcp::transport::streamable_http_server::{
            session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
        };

        let service = StreamableHttpService::new(
            move || Ok(server.clone()),
            LocalSessionManager::default().into(),
            StreamableHttpServerConfig::default(),
        );

        let metrics_for_route = Arc::clone(&metrics);
        let app = axum::Router::new()
            .nest_service("/mcp", service)
            .route("/health", axum::routing::get(|| async { "ok" }))
            .route(
                "/metrics",
                axum::routing::get(move || {
                    let metrics = Arc::clone(&metrics_for_route);
                    async move {
                        (
                            [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
                            metrics.render(),
                        )
                    }
                }),
            );

        let port = std::env::var("PORT").unwrap_or_else(|_| cfg.port.to_string());
        let addr = format!("{}:{port}", cfg.host);
        tracing::info!("Starting risk-mcp HTTP server on {addr}");

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?;
    } else {
        // stdio mode for local development
        tracing::info!("Starting risk-mcp MCP server (stdio)");

        let service = server.serve(rmcp::transport::stdio()).await?;
        service.waiting().await?;
    }

    Ok(())
}
