//! Risk MCP server: named tools over the rmcp router.
//!
//! Every tool follows the same pipeline: garde validation, the concurrency
//! gate (per-tool semaphore + global cap + deadline), the handler, then the
//! uniform envelope with metrics recorded. Failures are classified into the
//! shared error taxonomy and never leak internals.

use chrono::NaiveDate;
use garde::Validate;
use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Json, wrapper::Parameters},
    model::{Implementation, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router, ServerHandler,
};
use std::sync::Arc;
use std::time::Instant;

use crate::config::RiskMcpConfig;
use crate::data::cache::TtlCache;
use crate::data::{check_lookback, MarketDataProvider, OhlcvBar, SecuritySnapshot, DEFAULT_BOARD};
use crate::error::ErrorCategory;
use crate::risk::correlation::{correlation_matrix, CorrelationMatrix};
use crate::risk::liquidity::{build_liquidity_report, LiquidityReport, LiquidityRequest};
use crate::risk::portfolio::{analyze, AnalyzeRequest, PortfolioAnalysis};
use crate::risk::rebalance::{suggest_rebalance, RebalanceRequest, RebalanceResult};
use crate::risk::returns::align_returns;

use super::envelope::{ToolEnvelope, ToolErrorInfo, ToolMetrics};
use super::gate::{Gate, GateError};
use super::metrics::McpMetrics;
use super::params::{
    AnalyzePortfolioRiskParams, ComputeCorrelationParams, ConstituentMetrics,
    IndexConstituentsMetrics, IndexConstituentsParams, OhlcvParams, OhlcvSeries, SnapshotParams,
};

#[derive(Clone)]
pub struct RiskMcpServer {
    provider: Arc<dyn MarketDataProvider>,
    cfg: Arc<RiskMcpConfig>,
    gate: Arc<Gate>,
    metrics: Arc<McpMetrics>,
    cache: Option<Arc<TtlCache>>,
    tool_router: ToolRouter<Self>,
}

impl RiskMcpServer {
    pub fn new(
        provider: Arc<dyn MarketDataProvider>,
        cfg: RiskMcpConfig,
        metrics: Arc<McpMetrics>,
        cache: Option<Arc<TtlCache>>,
    ) -> Self {
        let gate = Arc::new(Gate::new(
            cfg.tool_concurrency,
            cfg.global_concurrency,
            cfg.tool_deadline,
        ));
        Self {
            provider,
            cfg: Arc::new(cfg),
            gate,
            metrics,
            cache,
            tool_router: Self::tool_router(),
        }
    }

    pub fn metrics(&self) -> Arc<McpMetrics> {
        Arc::clone(&self.metrics)
    }
}

// -- envelope plumbing ------------------------------------------------------

fn validation_info(report: &garde::Report) -> ToolErrorInfo {
    match report.iter().next() {
        Some((path, error)) => ToolErrorInfo::validation(path.to_string(), error.to_string()),
        None => ToolErrorInfo::new(ErrorCategory::ValidationError, "validation failed"),
    }
}

fn parse_date(field: &str, raw: &str) -> Result<NaiveDate, ToolErrorInfo> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| ToolErrorInfo::validation(field, format!("not a calendar date: {raw}")))
}

impl RiskMcpServer {
    fn cache_metrics(&self) -> Option<ToolMetrics> {
        self.cache.as_ref().map(|cache| ToolMetrics {
            cache_hits: Some(cache.hits()),
            cache_misses: Some(cache.misses()),
        })
    }

    fn reject<T>(
        &self,
        tool: &'static str,
        started: Instant,
        error: ToolErrorInfo,
    ) -> Json<ToolEnvelope<T>> {
        self.metrics
            .record(tool, started.elapsed(), Some(error.error_type));
        Json(ToolEnvelope::fail(tool, started, error))
    }

    fn finish<T>(
        &self,
        tool: &'static str,
        started: Instant,
        outcome: Result<Result<T, ToolErrorInfo>, GateError>,
    ) -> Json<ToolEnvelope<T>> {
        let mut envelope = match outcome {
            Ok(Ok(data)) => ToolEnvelope::ok(tool, started, data),
            Ok(Err(error)) => ToolEnvelope::fail(tool, started, error),
            Err(gate_error) => ToolEnvelope::fail(
                tool,
                started,
                ToolErrorInfo::new(gate_error.category(), gate_error.to_string()),
            ),
        };
        if let Some(metrics) = self.cache_metrics() {
            envelope = envelope.with_metrics(metrics);
        }
        self.metrics.record(
            tool,
            started.elapsed(),
            envelope.error.as_ref().map(|e| e.error_type),
        );
        Json(envelope)
    }

    async fn fetch_daily_series(
        &self,
        tickers: impl Iterator<Item = String>,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<(String, Vec<OhlcvBar>)>, ToolErrorInfo> {
        let mut series = Vec::new();
        for ticker in tickers {
            let bars = self
                .provider
                .ohlcv(&ticker, DEFAULT_BOARD, from, to, crate::data::Interval::Daily)
                .await
                .map_err(|e| ToolErrorInfo::new(e.category(), e.to_string()))?;
            series.push((ticker, bars));
        }
        Ok(series)
    }
}

// -- tool handlers ----------------------------------------------------------

impl RiskMcpServer {
    async fn run_analyze(
        &self,
        params: AnalyzePortfolioRiskParams,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<PortfolioAnalysis, ToolErrorInfo> {
        if params.positions.len() > self.cfg.max_portfolio_tickers {
            return Err(ToolErrorInfo::new(
                ErrorCategory::TooManyTickers,
                format!(
                    "{} positions exceed the cap of {}",
                    params.positions.len(),
                    self.cfg.max_portfolio_tickers
                ),
            ));
        }
        check_lookback(from, to, self.cfg.max_lookback_days)
            .map_err(|e| ToolErrorInfo::new(e.category(), e.to_string()))?;

        let series = self
            .fetch_daily_series(
                params.positions.iter().map(|p| p.ticker.to_uppercase()),
                from,
                to,
            )
            .await?;

        let request = AnalyzeRequest {
            positions: params.positions,
            from_date: from,
            to_date: to,
            base_currency: params.base_currency.to_uppercase(),
            rebalance: params.rebalance,
            aggregates: params.aggregates,
            stress_scenarios: params.stress_scenarios,
            var_config: params.var_config,
            total_portfolio_value: params.total_portfolio_value,
            covenant_limits: params.covenant_limits,
            risk_prefs: params.risk_prefs,
        };
        analyze(&series, &request).map_err(|e| ToolErrorInfo::new(e.category(), e.to_string()))
    }

    async fn run_correlation(
        &self,
        params: ComputeCorrelationParams,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<CorrelationMatrix, ToolErrorInfo> {
        let mut tickers: Vec<String> = params.tickers.iter().map(|t| t.to_uppercase()).collect();
        tickers.dedup();
        if tickers.len() > self.cfg.max_correlation_tickers {
            return Err(ToolErrorInfo::new(
                ErrorCategory::TooManyTickers,
                format!(
                    "{} tickers exceed the correlation cap of {}",
                    tickers.len(),
                    self.cfg.max_correlation_tickers
                ),
            ));
        }
        check_lookback(from, to, self.cfg.max_lookback_days)
            .map_err(|e| ToolErrorInfo::new(e.category(), e.to_string()))?;

        let series = self.fetch_daily_series(tickers.into_iter(), from, to).await?;
        let aligned = align_returns(&series)
            .map_err(|e| ToolErrorInfo::new(e.category(), e.to_string()))?;
        Ok(correlation_matrix(&aligned))
    }

    async fn run_index_metrics(
        &self,
        params: IndexConstituentsParams,
        as_of: Option<NaiveDate>,
    ) -> Result<IndexConstituentsMetrics, ToolErrorInfo> {
        let index = params
            .index_ticker
            .map(|t| t.to_uppercase())
            .unwrap_or_else(|| self.cfg.default_index_ticker.clone());

        let members = self
            .provider
            .constituents(&index, as_of)
            .await
            .map_err(|e| ToolErrorInfo::new(e.category(), e.to_string()))?;

        let total: f64 = members.iter().map(|m| m.weight_pct).sum();
        let (top10, hhi) = if total > 0.0 {
            let top10: f64 = members.iter().take(10).map(|m| m.weight_pct).sum::<f64>() / total;
            let hhi: f64 = members
                .iter()
                .map(|m| (m.weight_pct / total).powi(2))
                .sum();
            (top10 * 100.0, hhi)
        } else {
            (0.0, 0.0)
        };

        Ok(IndexConstituentsMetrics {
            index_ticker: index,
            as_of,
            count: members.len(),
            top10_weight_pct: top10,
            hhi,
            constituents: members
                .into_iter()
                .map(|m| ConstituentMetrics {
                    ticker: m.ticker,
                    short_name: m.short_name,
                    weight_pct: m.weight_pct,
                })
                .collect(),
        })
    }
}

#[tool_router]
impl RiskMcpServer {
    /// Full portfolio risk analysis over a historical window.
    ///
    /// Computes total/annualised return, volatility, max drawdown,
    /// historical VaR and expected shortfall, per-instrument statistics,
    /// concentration measures (top-N, HHI, groupings) and the canonical
    /// deterministic stress scenarios. Positions must carry weights summing
    /// to 1. Same input always produces the same output.
    #[tool(name = "analyze_portfolio_risk", annotations(read_only_hint = true))]
    pub async fn analyze_portfolio_risk(
        &self,
        Parameters(params): Parameters<AnalyzePortfolioRiskParams>,
    ) -> Json<ToolEnvelope<PortfolioAnalysis>> {
        const TOOL: &str = "analyze_portfolio_risk";
        let started = Instant::now();
        if let Err(report) = params.validate() {
            return self.reject(TOOL, started, validation_info(&report));
        }
        let (from, to) = match (
            parse_date("from_date", &params.from_date),
            parse_date("to_date", &params.to_date),
        ) {
            (Ok(f), Ok(t)) => (f, t),
            (Err(e), _) | (_, Err(e)) => return self.reject(TOOL, started, e),
        };
        let outcome = self.gate.run(TOOL, self.run_analyze(params, from, to)).await;
        self.finish(TOOL, started, outcome)
    }

    /// Deterministic constraint-driven rebalance suggestion.
    ///
    /// Applies single-position, issuer and asset-class caps, steers towards
    /// soft class targets, and scales all deltas down to the turnover
    /// budget (best effort; unresolved constraints become warnings, not
    /// errors). Output is stable: ties break lexicographically by ticker.
    #[tool(name = "suggest_rebalance", annotations(read_only_hint = true))]
    pub async fn suggest_rebalance_tool(
        &self,
        Parameters(params): Parameters<RebalanceRequest>,
    ) -> Json<ToolEnvelope<RebalanceResult>> {
        const TOOL: &str = "suggest_rebalance";
        let started = Instant::now();
        if let Err(report) = params.validate() {
            return self.reject(TOOL, started, validation_info(&report));
        }
        let outcome = self
            .gate
            .run(TOOL, async {
                suggest_rebalance(&params)
                    .map_err(|e| ToolErrorInfo::new(e.category(), e.to_string()))
            })
            .await;
        self.finish(TOOL, started, outcome)
    }

    /// Pearson correlation matrix of daily returns for a ticker set.
    #[tool(name = "compute_correlation_matrix", annotations(read_only_hint = true))]
    pub async fn compute_correlation_matrix(
        &self,
        Parameters(params): Parameters<ComputeCorrelationParams>,
    ) -> Json<ToolEnvelope<CorrelationMatrix>> {
        const TOOL: &str = "compute_correlation_matrix";
        let started = Instant::now();
        if let Err(report) = params.validate() {
            return self.reject(TOOL, started, validation_info(&report));
        }
        let (from, to) = match (
            parse_date("from_date", &params.from_date),
            parse_date("to_date", &params.to_date),
        ) {
            (Ok(f), Ok(t)) => (f, t),
            (Err(e), _) | (_, Err(e)) => return self.reject(TOOL, started, e),
        };
        let outcome = self
            .gate
            .run(TOOL, self.run_correlation(params, from, to))
            .await;
        self.finish(TOOL, started, outcome)
    }

    /// CFO liquidity report: time-to-liquidate buckets, quick and
    /// short-term coverage ratios, stress scenarios and recommendations.
    #[tool(name = "build_cfo_liquidity_report", annotations(read_only_hint = true))]
    pub async fn build_cfo_liquidity_report_tool(
        &self,
        Parameters(params): Parameters<LiquidityRequest>,
    ) -> Json<ToolEnvelope<LiquidityReport>> {
        const TOOL: &str = "build_cfo_liquidity_report";
        let started = Instant::now();
        if let Err(report) = params.validate() {
            return self.reject(TOOL, started, validation_info(&report));
        }
        let outcome = self
            .gate
            .run(TOOL, async {
                build_liquidity_report(&params)
                    .map_err(|e| ToolErrorInfo::new(e.category(), e.to_string()))
            })
            .await;
        self.finish(TOOL, started, outcome)
    }

    /// Point-in-time quote for a single security.
    #[tool(name = "get_security_snapshot", annotations(read_only_hint = true))]
    pub async fn get_security_snapshot(
        &self,
        Parameters(params): Parameters<SnapshotParams>,
    ) -> Json<ToolEnvelope<SecuritySnapshot>> {
        const TOOL: &str = "get_security_snapshot";
        let started = Instant::now();
        if let Err(report) = params.validate() {
            return self.reject(TOOL, started, validation_info(&report));
        }
        let outcome = self
            .gate
            .run(TOOL, async {
                self.provider
                    .snapshot(&params.ticker, &params.board)
                    .await
                    .map_err(|e| ToolErrorInfo::new(e.category(), e.to_string()))
            })
            .await;
        self.finish(TOOL, started, outcome)
    }

    /// Daily or hourly OHLCV history for one ticker.
    #[tool(name = "get_ohlcv_timeseries", annotations(read_only_hint = true))]
    pub async fn get_ohlcv_timeseries(
        &self,
        Parameters(params): Parameters<OhlcvParams>,
    ) -> Json<ToolEnvelope<OhlcvSeries>> {
        const TOOL: &str = "get_ohlcv_timeseries";
        let started = Instant::now();
        if let Err(report) = params.validate() {
            return self.reject(TOOL, started, validation_info(&report));
        }
        let (from, to) = match (
            parse_date("from_date", &params.from_date),
            parse_date("to_date", &params.to_date),
        ) {
            (Ok(f), Ok(t)) => (f, t),
            (Err(e), _) | (_, Err(e)) => return self.reject(TOOL, started, e),
        };
        let outcome = self
            .gate
            .run(TOOL, async {
                if let Err(e) = check_lookback(from, to, self.cfg.max_lookback_days) {
                    return Err(ToolErrorInfo::new(e.category(), e.to_string()));
                }
                let ticker = params.ticker.to_uppercase();
                self.provider
                    .ohlcv(&ticker, &params.board, from, to, params.interval)
                    .await
                    .map(|bars| {
                        OhlcvSeries::new(ticker, params.board.clone(), params.interval, bars)
                    })
                    .map_err(|e| ToolErrorInfo::new(e.category(), e.to_string()))
            })
            .await;
        self.finish(TOOL, started, outcome)
    }

    /// Index basket with concentration metrics (top-10 share, HHI).
    #[tool(name = "get_index_constituents_metrics", annotations(read_only_hint = true))]
    pub async fn get_index_constituents_metrics(
        &self,
        Parameters(params): Parameters<IndexConstituentsParams>,
    ) -> Json<ToolEnvelope<IndexConstituentsMetrics>> {
        const TOOL: &str = "get_index_constituents_metrics";
        let started = Instant::now();
        if let Err(report) = params.validate() {
            return self.reject(TOOL, started, validation_info(&report));
        }
        let as_of = match params.as_of.as_deref() {
            Some(raw) => match parse_date("as_of", raw) {
                Ok(d) => Some(d),
                Err(e) => return self.reject(TOOL, started, e),
            },
            None => None,
        };
        let outcome = self
            .gate
            .run(TOOL, self.run_index_metrics(params, as_of))
            .await;
        self.finish(TOOL, started, outcome)
    }
}

#[tool_handler]
impl ServerHandler for RiskMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::default(),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "risk-mcp".into(),
                title: Some("MOEX Risk Analytics".into()),
                version: "0.1.0".into(),
                description: Some(
                    "Portfolio risk analytics over MOEX market data: risk metrics, \
                     concentrations, stress scenarios, VaR, rebalancing and liquidity reports"
                        .into(),
                ),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "MOEX risk analytics tools. All responses share the envelope \
                 {metadata, data, metrics?, error?}; a failed call still returns the \
                 envelope with error.error_type set.\
                 \n\nData tools:\
                 \n- get_security_snapshot({ ticker, board? }) — latest quote.\
                 \n- get_ohlcv_timeseries({ ticker, from_date, to_date, interval? }) — \
                 daily/hourly bars; windows over 730 days are rejected with \
                 DATE_RANGE_TOO_LARGE.\
                 \n- get_index_constituents_metrics({ index_ticker?, as_of? }) — index \
                 basket with top-10 share and HHI (defaults to IMOEX).\
                 \n\nAnalytics tools:\
                 \n- analyze_portfolio_risk({ positions, from_date, to_date, rebalance?, \
                 aggregates?, var_config?, stress_scenarios? }) — returns, volatility, \
                 drawdown, VaR/ES, concentrations, stress P&L and risk flags. Weights \
                 must sum to 1; at most 10 positions per call.\
                 \n- compute_correlation_matrix({ tickers, from_date, to_date }) — \
                 Pearson matrix on aligned daily returns.\
                 \n- suggest_rebalance({ positions, risk_profile }) — deterministic \
                 constraint-driven target weights, trades and warnings.\
                 \n- build_cfo_liquidity_report({ positions, short_term_liabilities_pct? }) \
                 — liquidity buckets, coverage ratios, stress results and \
                 recommendations."
                    .into(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::fixture::FixtureProvider;

    fn server_with(provider: FixtureProvider) -> RiskMcpServer {
        RiskMcpServer::new(
            Arc::new(provider),
            RiskMcpConfig::default(),
            Arc::new(McpMetrics::new()),
            None,
        )
    }

    fn window() -> (NaiveDate, NaiveDate) {
        (
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
        )
    }

    #[tokio::test]
    async fn analyze_tool_happy_path() {
        let (from, to) = window();
        let server = server_with(FixtureProvider::seeded(&["SBER", "GAZP"], from, to));

        let params: AnalyzePortfolioRiskParams = serde_json::from_value(serde_json::json!({
            "positions": [
                {"ticker": "SBER", "weight": 0.5},
                {"ticker": "GAZP", "weight": 0.5}
            ],
            "from_date": "2024-01-01",
            "to_date": "2024-06-01"
        }))
        .unwrap();

        let Json(envelope) = server.analyze_portfolio_risk(Parameters(params)).await;
        assert!(envelope.is_ok(), "error: {:?}", envelope.error);
        let analysis = envelope.data.unwrap();
        assert!((analysis.concentrations.top1_pct - 50.0).abs() < 1e-9);
        assert_eq!(envelope.metadata.tool, "analyze_portfolio_risk");
        assert_eq!(server.metrics.calls_for("analyze_portfolio_risk"), 1);
    }

    #[tokio::test]
    async fn analyze_tool_rejects_bad_weights() {
        let (from, to) = window();
        let server = server_with(FixtureProvider::seeded(&["SBER", "GAZP"], from, to));

        let params: AnalyzePortfolioRiskParams = serde_json::from_value(serde_json::json!({
            "positions": [
                {"ticker": "SBER", "weight": 0.5},
                {"ticker": "GAZP", "weight": 0.2}
            ],
            "from_date": "2024-01-01",
            "to_date": "2024-06-01"
        }))
        .unwrap();

        let Json(envelope) = server.analyze_portfolio_risk(Parameters(params)).await;
        let error = envelope.error.unwrap();
        assert_eq!(error.error_type, ErrorCategory::ValidationError);
        assert_eq!(
            server
                .metrics
                .errors_for("analyze_portfolio_risk", ErrorCategory::ValidationError),
            1
        );
    }

    #[tokio::test]
    async fn analyze_tool_enforces_lookback() {
        let from = NaiveDate::from_ymd_opt(2018, 1, 1).unwrap();
        let to = NaiveDate::from_ymd_opt(2024, 12, 31).unwrap();
        let server = server_with(FixtureProvider::seeded(&["SBER"], from, to));

        let params: AnalyzePortfolioRiskParams = serde_json::from_value(serde_json::json!({
            "positions": [{"ticker": "SBER", "weight": 1.0}],
            "from_date": "2018-01-01",
            "to_date": "2024-12-31"
        }))
        .unwrap();

        let Json(envelope) = server.analyze_portfolio_risk(Parameters(params)).await;
        assert_eq!(
            envelope.error.unwrap().error_type,
            ErrorCategory::DateRangeTooLarge
        );
    }

    #[tokio::test]
    async fn too_many_positions_rejected() {
        let (from, to) = window();
        let tickers: Vec<String> = (0..11).map(|i| format!("TK{i}")).collect();
        let refs: Vec<&str> = tickers.iter().map(String::as_str).collect();
        let server = server_with(FixtureProvider::seeded(&refs, from, to));

        let positions: Vec<serde_json::Value> = tickers
            .iter()
            .map(|t| serde_json::json!({"ticker": t, "weight": 1.0 / 11.0}))
            .collect();
        let params: AnalyzePortfolioRiskParams = serde_json::from_value(serde_json::json!({
            "positions": positions,
            "from_date": "2024-01-01",
            "to_date": "2024-06-01"
        }))
        .unwrap();

        let Json(envelope) = server.analyze_portfolio_risk(Parameters(params)).await;
        assert_eq!(
            envelope.error.unwrap().error_type,
            ErrorCategory::TooManyTickers
        );
    }

    #[tokio::test]
    async fn snapshot_tool_unknown_ticker() {
        let (from, to) = window();
        let server = server_with(FixtureProvider::seeded(&["SBER"], from, to));

        let params: SnapshotParams =
            serde_json::from_value(serde_json::json!({"ticker": "ZZZZ"})).unwrap();
        let Json(envelope) = server.get_security_snapshot(Parameters(params)).await;
        assert_eq!(
            envelope.error.unwrap().error_type,
            ErrorCategory::InvalidTicker
        );
    }

    #[tokio::test]
    async fn index_metrics_tool_normalises_weights() {
        use crate::data::IndexConstituent;
        let (from, to) = window();
        let provider = FixtureProvider::seeded(&["SBER"], from, to).with_constituents(
            "IMOEX",
            vec![
                IndexConstituent {
                    ticker: "SBER".into(),
                    short_name: "Сбербанк".into(),
                    weight_pct: 15.0,
                },
                IndexConstituent {
                    ticker: "LKOH".into(),
                    short_name: "Лукойл".into(),
                    weight_pct: 10.0,
                },
                IndexConstituent {
                    ticker: "GAZP".into(),
                    short_name: "Газпром".into(),
                    weight_pct: 75.0,
                },
            ],
        );
        let server = server_with(provider);

        let params: IndexConstituentsParams = serde_json::from_value(serde_json::json!({})).unwrap();
        let Json(envelope) = server.get_index_constituents_metrics(Parameters(params)).await;
        let metrics = envelope.data.unwrap();
        assert_eq!(metrics.index_ticker, "IMOEX");
        assert_eq!(metrics.count, 3);
        assert!((metrics.top10_weight_pct - 100.0).abs() < 1e-9);
        let expected_hhi = 0.15f64.powi(2) + 0.10f64.powi(2) + 0.75f64.powi(2);
        assert!((metrics.hhi - expected_hhi).abs() < 1e-12);
    }
}
