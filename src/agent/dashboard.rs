//! `RiskDashboardSpec`: the validated dashboard document consumed by the
//! web UI. Every chart/table `data_ref` must resolve via dotted path into
//! the document's own `data` or `time_series` sections.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::risk::liquidity::LiquidityReport;
use crate::risk::portfolio::PortfolioAnalysis;
use crate::risk::rebalance::RebalanceResult;
use crate::risk::Severity;

use super::scenario::ScenarioType;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DashboardMetadata {
    pub as_of: DateTime<Utc>,
    pub scenario_type: String,
    pub base_currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub portfolio_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MetricSpec {
    pub id: String,
    pub label: String,
    pub value: f64,
    pub unit: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ChartType {
    Line,
    Bar,
    Pie,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SeriesSpec {
    pub id: String,
    pub label: String,
    /// Dotted path into `data` or `time_series`
    pub data_ref: String,
    /// Field of each row used for the x axis / pie label
    pub x_field: String,
    /// Field of each row used for the y axis / pie value
    pub y_field: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ChartSpec {
    pub id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub chart_type: ChartType,
    pub series: Vec<SeriesSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ColumnAlign {
    Left,
    Right,
    Center,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ColumnSpec {
    pub id: String,
    pub label: String,
    pub align: ColumnAlign,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TableSpec {
    pub id: String,
    pub title: String,
    pub columns: Vec<ColumnSpec>,
    pub data_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AlertSpec {
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub related_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RiskDashboardSpec {
    pub metadata: DashboardMetadata,
    #[serde(default)]
    pub metrics: Vec<MetricSpec>,
    #[serde(default)]
    pub charts: Vec<ChartSpec>,
    #[serde(default)]
    pub tables: Vec<TableSpec>,
    #[serde(default)]
    pub alerts: Vec<AlertSpec>,
    /// Named row sets referenced by charts and tables
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Named time-indexed row sets
    #[serde(default)]
    pub time_series: Map<String, Value>,
}

impl RiskDashboardSpec {
    /// Resolve a dotted `data_ref` against this document.
    pub fn resolve(&self, data_ref: &str) -> Option<&Value> {
        let mut parts = data_ref.split('.');
        let root = parts.next()?;
        let map = match root {
            "data" => &self.data,
            "time_series" => &self.time_series,
            _ => return None,
        };
        let mut current = map.get(parts.next()?)?;
        for part in parts {
            current = current.get(part)?;
        }
        Some(current)
    }

    /// Check every `data_ref` resolves to an array or object.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let mut check = |owner: &str, data_ref: &str| match self.resolve(data_ref) {
            Some(value) if value.is_array() || value.is_object() => {}
            Some(_) => errors.push(format!("{owner}: data_ref '{data_ref}' is not a collection")),
            None => errors.push(format!("{owner}: data_ref '{data_ref}' does not resolve")),
        };
        for chart in &self.charts {
            for series in &chart.series {
                check(&format!("chart {}", chart.id), &series.data_ref);
            }
        }
        for table in &self.tables {
            check(&format!("table {}", table.id), &table.data_ref);
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn column(id: &str, label: &str, align: ColumnAlign) -> ColumnSpec {
    ColumnSpec {
        id: id.to_string(),
        label: label.to_string(),
        align,
    }
}

/// Assemble a dashboard from whatever tool results the run produced.
/// Returns `None` when there is nothing visual to show.
pub fn build_dashboard(
    scenario: ScenarioType,
    base_currency: &str,
    portfolio_id: Option<&str>,
    analysis: Option<&PortfolioAnalysis>,
    rebalance: Option<&RebalanceResult>,
    liquidity: Option<&LiquidityReport>,
) -> Option<RiskDashboardSpec> {
    let mut spec = RiskDashboardSpec {
        metadata: DashboardMetadata {
            as_of: Utc::now(),
            scenario_type: scenario.as_str().to_string(),
            base_currency: base_currency.to_string(),
            portfolio_id: portfolio_id.map(str::to_string),
        },
        metrics: Vec::new(),
        charts: Vec::new(),
        tables: Vec::new(),
        alerts: Vec::new(),
        data: Map::new(),
        time_series: Map::new(),
    };

    if let Some(analysis) = analysis {
        spec.metrics.extend([
            MetricSpec {
                id: "total_return".to_string(),
                label: "Total return".to_string(),
                value: analysis.totals.total_return * 100.0,
                unit: "%".to_string(),
                severity: Severity::Info,
                change: None,
            },
            MetricSpec {
                id: "volatility".to_string(),
                label: "Annualised volatility".to_string(),
                value: analysis.totals.annualized_volatility * 100.0,
                unit: "%".to_string(),
                severity: Severity::Info,
                change: None,
            },
            MetricSpec {
                id: "max_drawdown".to_string(),
                label: "Max drawdown".to_string(),
                value: analysis.totals.max_drawdown * 100.0,
                unit: "%".to_string(),
                severity: if analysis.totals.max_drawdown < -0.2 {
                    Severity::Warning
                } else {
                    Severity::Info
                },
                change: None,
            },
            MetricSpec {
                id: "var_95".to_string(),
                label: "VaR (95%, 1d)".to_string(),
                value: analysis.totals.var_light * 100.0,
                unit: "%".to_string(),
                severity: Severity::Info,
                change: None,
            },
        ]);

        let positions: Vec<Value> = analysis
            .per_instrument
            .iter()
            .map(|p| {
                json!({
                    "ticker": p.ticker,
                    "weight_pct": p.weight * 100.0,
                    "return_pct": p.total_return * 100.0,
                    "volatility_pct": p.annualized_volatility * 100.0,
                })
            })
            .collect();
        spec.data.insert("positions".to_string(), Value::Array(positions));

        let stress_rows: Vec<Value> = analysis
            .stress_scenarios
            .iter()
            .map(|s| {
                json!({
                    "scenario": s.scenario,
                    "pnl_pct": s.pnl_pct * 100.0,
                    "pnl_value": s.pnl_value,
                })
            })
            .collect();
        spec.data
            .insert("stress_scenarios".to_string(), Value::Array(stress_rows));

        let curve: Vec<Value> = analysis
            .equity_curve
            .iter()
            .map(|p| json!({"date": p.date, "equity": p.equity}))
            .collect();
        spec.time_series
            .insert("equity_curve".to_string(), Value::Array(curve));

        spec.charts.extend([
            ChartSpec {
                id: "weights".to_string(),
                title: "Portfolio weights".to_string(),
                chart_type: ChartType::Pie,
                series: vec![SeriesSpec {
                    id: "weights".to_string(),
                    label: "Weight".to_string(),
                    data_ref: "data.positions".to_string(),
                    x_field: "ticker".to_string(),
                    y_field: "weight_pct".to_string(),
                }],
            },
            ChartSpec {
                id: "equity".to_string(),
                title: "Equity curve".to_string(),
                chart_type: ChartType::Line,
                series: vec![SeriesSpec {
                    id: "equity".to_string(),
                    label: "Equity".to_string(),
                    data_ref: "time_series.equity_curve".to_string(),
                    x_field: "date".to_string(),
                    y_field: "equity".to_string(),
                }],
            },
            ChartSpec {
                id: "stress".to_string(),
                title: "Stress P&L".to_string(),
                chart_type: ChartType::Bar,
                series: vec![SeriesSpec {
                    id: "stress".to_string(),
                    label: "P&L %".to_string(),
                    data_ref: "data.stress_scenarios".to_string(),
                    x_field: "scenario".to_string(),
                    y_field: "pnl_pct".to_string(),
                }],
            },
        ]);

        spec.tables.push(TableSpec {
            id: "positions".to_string(),
            title: "Positions".to_string(),
            columns: vec![
                column("ticker", "Ticker", ColumnAlign::Left),
                column("weight_pct", "Weight %", ColumnAlign::Right),
                column("return_pct", "Return %", ColumnAlign::Right),
                column("volatility_pct", "Volatility %", ColumnAlign::Right),
            ],
            data_ref: "data.positions".to_string(),
        });

        for flag in &analysis.flags {
            spec.alerts.push(AlertSpec {
                severity: flag.severity,
                message: flag.message.clone(),
                related_ids: vec![flag.code.clone()],
            });
        }
    }

    if let Some(rebalance) = rebalance {
        let trades: Vec<Value> = rebalance
            .trades
            .iter()
            .map(|t| {
                json!({
                    "ticker": t.ticker,
                    "side": t.side,
                    "weight_delta_pct": t.weight_delta * 100.0,
                    "estimated_value": t.estimated_value,
                })
            })
            .collect();
        spec.data.insert("trades".to_string(), Value::Array(trades));
        spec.tables.push(TableSpec {
            id: "trades".to_string(),
            title: "Suggested trades".to_string(),
            columns: vec![
                column("ticker", "Ticker", ColumnAlign::Left),
                column("side", "Side", ColumnAlign::Center),
                column("weight_delta_pct", "Δ Weight %", ColumnAlign::Right),
                column("estimated_value", "Est. value", ColumnAlign::Right),
            ],
            data_ref: "data.trades".to_string(),
        });
        for warning in &rebalance.summary.warnings {
            spec.alerts.push(AlertSpec {
                severity: Severity::Warning,
                message: warning.clone(),
                related_ids: Vec::new(),
            });
        }
    }

    if let Some(liquidity) = liquidity {
        let buckets: Vec<Value> = liquidity
            .buckets
            .iter()
            .map(|b| json!({"bucket": b.bucket, "weight_pct": b.weight_pct}))
            .collect();
        spec.data
            .insert("liquidity_buckets".to_string(), Value::Array(buckets));
        spec.metrics.push(MetricSpec {
            id: "quick_ratio".to_string(),
            label: "Quick ratio".to_string(),
            value: liquidity.quick_ratio,
            unit: "x".to_string(),
            severity: if liquidity.quick_ratio < 1.0 {
                Severity::Warning
            } else {
                Severity::Info
            },
            change: None,
        });
        spec.charts.push(ChartSpec {
            id: "liquidity".to_string(),
            title: "Liquidity buckets".to_string(),
            chart_type: ChartType::Bar,
            series: vec![SeriesSpec {
                id: "liquidity".to_string(),
                label: "Weight %".to_string(),
                data_ref: "data.liquidity_buckets".to_string(),
                x_field: "bucket".to_string(),
                y_field: "weight_pct".to_string(),
            }],
        });
    }

    if spec.data.is_empty() && spec.time_series.is_empty() {
        return None;
    }
    debug_assert!(spec.validate().is_ok());
    Some(spec)
}
