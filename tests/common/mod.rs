//! Shared test fixtures: deterministic market data, an in-process risk
//! MCP server and an agent wired to it.
#![allow(dead_code)]

use chrono::NaiveDate;
use std::sync::Arc;

use moex_agent_mcp::agent::planner::BasicPlanner;
use moex_agent_mcp::agent::tools::LocalTransport;
use moex_agent_mcp::agent::AgentService;
use moex_agent_mcp::config::{AgentConfig, RiskMcpConfig};
use moex_agent_mcp::data::fixture::FixtureProvider;
use moex_agent_mcp::mcp::metrics::McpMetrics;
use moex_agent_mcp::mcp::server::RiskMcpServer;

pub fn window_2024() -> (NaiveDate, NaiveDate) {
    (
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        NaiveDate::from_ymd_opt(2024, 12, 1).unwrap(),
    )
}

pub fn make_server(tickers: &[&str], from: NaiveDate, to: NaiveDate) -> RiskMcpServer {
    RiskMcpServer::new(
        Arc::new(FixtureProvider::seeded(tickers, from, to)),
        RiskMcpConfig::default(),
        Arc::new(McpMetrics::new()),
        None,
    )
}

pub fn make_agent(tickers: &[&str], from: NaiveDate, to: NaiveDate) -> AgentService {
    let server = make_server(tickers, from, to);
    AgentService::new(
        AgentConfig::default(),
        Arc::new(LocalTransport::new(server)),
        Arc::new(BasicPlanner),
        None,
    )
}

