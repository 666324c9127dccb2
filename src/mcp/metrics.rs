//! Per-tool service counters and latency histogram with Prometheus text
//! rendering for `GET /metrics`.

use std::fmt::Write as _;
use std::time::Duration;

use dashmap::DashMap;

use crate::error::ErrorCategory;

/// Histogram bucket upper bounds in seconds.
const LATENCY_BUCKETS: [f64; 10] = [0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

#[derive(Debug, Clone)]
struct Histogram {
    counts: [u64; LATENCY_BUCKETS.len()],
    sum: f64,
    count: u64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            counts: [0; LATENCY_BUCKETS.len()],
            sum: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, seconds: f64) {
        for (i, le) in LATENCY_BUCKETS.iter().enumerate() {
            if seconds <= *le {
                self.counts[i] += 1;
            }
        }
        self.sum += seconds;
        self.count += 1;
    }
}

#[derive(Default)]
pub struct McpMetrics {
    calls: DashMap<String, u64>,
    errors: DashMap<(String, ErrorCategory), u64>,
    latency: DashMap<String, Histogram>,
}

impl McpMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, tool: &str, duration: Duration, error: Option<ErrorCategory>) {
        *self.calls.entry(tool.to_string()).or_insert(0) += 1;
        if let Some(category) = error {
            *self
                .errors
                .entry((tool.to_string(), category))
                .or_insert(0) += 1;
        }
        self.latency
            .entry(tool.to_string())
            .or_insert_with(Histogram::new)
            .observe(duration.as_secs_f64());
    }

    pub fn calls_for(&self, tool: &str) -> u64 {
        self.calls.get(tool).map(|v| *v).unwrap_or(0)
    }

    pub fn errors_for(&self, tool: &str, category: ErrorCategory) -> u64 {
        self.errors
            .get(&(tool.to_string(), category))
            .map(|v| *v)
            .unwrap_or(0)
    }

    /// Render in Prometheus text exposition format, deterministically
    /// ordered.
    pub fn render(&self) -> String {
        let mut out = String::new();

        let mut calls: Vec<(String, u64)> = self
            .calls
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        calls.sort();
        out.push_str("# TYPE tool_calls_total counter\n");
        for (tool, count) in &calls {
            let _ = writeln!(out, "tool_calls_total{{tool=\"{tool}\"}} {count}");
        }

        let mut errors: Vec<((String, ErrorCategory), u64)> = self
            .errors
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        errors.sort_by(|a, b| {
            a.0 .0
                .cmp(&b.0 .0)
                .then_with(|| a.0 .1.as_str().cmp(b.0 .1.as_str()))
        });
        out.push_str("# TYPE tool_errors_total counter\n");
        for ((tool, category), count) in &errors {
            let _ = writeln!(
                out,
                "tool_errors_total{{tool=\"{tool}\",error_type=\"{}\"}} {count}",
                category.as_str()
            );
        }

        let mut latencies: Vec<(String, Histogram)> = self
            .latency
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        latencies.sort_by(|a, b| a.0.cmp(&b.0));
        out.push_str("# TYPE mcp_http_latency_seconds histogram\n");
        for (tool, histogram) in &latencies {
            for (i, le) in LATENCY_BUCKETS.iter().enumerate() {
                let _ = writeln!(
                    out,
                    "mcp_http_latency_seconds_bucket{{tool=\"{tool}\",le=\"{le}\"}} {}",
                    histogram.counts[i]
                );
            }
            let _ = writeln!(
                out,
                "mcp_http_latency_seconds_bucket{{tool=\"{tool}\",le=\"+Inf\"}} {}",
                histogram.count
            );
            let _ = writeln!(
                out,
                "mcp_http_latency_seconds_sum{{tool=\"{tool}\"}} {}",
                histogram.sum
            );
            let _ = writeln!(
                out,
                "mcp_http_latency_seconds_count{{tool=\"{tool}\"}} {}",
                histogram.count
            );
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = McpMetrics::new();
        metrics.record("analyze_portfolio_risk", Duration::from_millis(30), None);
        metrics.record("analyze_portfolio_risk", Duration::from_millis(60), None);
        metrics.record(
            "analyze_portfolio_risk",
            Duration::from_millis(5),
            Some(ErrorCategory::RateLimit),
        );

        assert_eq!(metrics.calls_for("analyze_portfolio_risk"), 3);
        assert_eq!(
            metrics.errors_for("analyze_portfolio_risk", ErrorCategory::RateLimit),
            1
        );
        assert_eq!(
            metrics.errors_for("analyze_portfolio_risk", ErrorCategory::IssTimeout),
            0
        );
    }

    #[test]
    fn render_exposition_format() {
        let metrics = McpMetrics::new();
        metrics.record("get_security_snapshot", Duration::from_millis(20), None);
        metrics.record(
            "suggest_rebalance",
            Duration::from_millis(3),
            Some(ErrorCategory::ValidationError),
        );

        let text = metrics.render();
        assert!(text.contains("tool_calls_total{tool=\"get_security_snapshot\"} 1"));
        assert!(text.contains(
            "tool_errors_total{tool=\"suggest_rebalance\",error_type=\"VALIDATION_ERROR\"} 1"
        ));
        assert!(text.contains("mcp_http_latency_seconds_bucket{tool=\"get_security_snapshot\",le=\"0.025\"} 1"));
        assert!(text.contains("mcp_http_latency_seconds_count{tool=\"get_security_snapshot\"} 1"));
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let metrics = McpMetrics::new();
        metrics.record("t", Duration::from_millis(30), None);
        metrics.record("t", Duration::from_millis(300), None);

        let text = metrics.render();
        // 0.05 bucket sees only the 30 ms sample, 0.5 and +Inf see both
        assert!(text.contains("mcp_http_latency_seconds_bucket{tool=\"t\",le=\"0.05\"} 1"));
        assert!(text.contains("mcp_http_latency_seconds_bucket{tool=\"t\",le=\"0.5\"} 2"));
        assert!(text.contains("mcp_http_latency_seconds_bucket{tool=\"t\",le=\"+Inf\"} 2"));
    }
}
