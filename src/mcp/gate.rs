//! Concurrency gate: per-tool semaphore, process-wide cap and a bounded
//! deadline around every handler.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Semaphore;

use crate::error::ErrorCategory;

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("tool execution exceeded the {0:?} deadline")]
    Deadline(Duration),
    #[error("execution gate closed")]
    Closed,
}

impl GateError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Deadline(_) => ErrorCategory::IssTimeout,
            Self::Closed => ErrorCategory::Unknown,
        }
    }
}

pub struct Gate {
    global: Arc<Semaphore>,
    per_tool: DashMap<&'static str, Arc<Semaphore>>,
    tool_limit: usize,
    deadline: Duration,
}

impl Gate {
    pub fn new(tool_limit: usize, global_limit: usize, deadline: Duration) -> Self {
        Self {
            global: Arc::new(Semaphore::new(global_limit.max(1))),
            per_tool: DashMap::new(),
            tool_limit: tool_limit.max(1),
            deadline,
        }
    }

    /// Run `fut` holding one global and one per-tool permit, bounded by the
    /// configured deadline. Callers queue on the semaphores rather than
    /// being rejected.
    pub async fn run<T>(
        &self,
        tool: &'static str,
        fut: impl Future<Output = T>,
    ) -> Result<T, GateError> {
        let _global = self
            .global
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GateError::Closed)?;
        let tool_sem = self
            .per_tool
            .entry(tool)
            .or_insert_with(|| Arc::new(Semaphore::new(self.tool_limit)))
            .clone();
        let _tool = tool_sem
            .acquire_owned()
            .await
            .map_err(|_| GateError::Closed)?;

        tokio::time::timeout(self.deadline, fut)
            .await
            .map_err(|_| GateError::Deadline(self.deadline))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn per_tool_limit_serialises_excess_callers() {
        let gate = Arc::new(Gate::new(2, 16, Duration::from_secs(5)));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = gate.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                gate.run("analyze_portfolio_risk", async move {
                    let cur = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(cur, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_enforced() {
        let gate = Gate::new(4, 16, Duration::from_millis(50));
        let result = gate
            .run("slow_tool", async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                1
            })
            .await;
        assert!(matches!(result, Err(GateError::Deadline(_))));
        assert_eq!(
            result.unwrap_err().category(),
            ErrorCategory::IssTimeout
        );
    }

    #[tokio::test]
    async fn different_tools_use_separate_permits() {
        let gate = Arc::new(Gate::new(1, 16, Duration::from_secs(5)));
        // Both acquire concurrently; if they shared a permit this would
        // still pass but take twice as long — assert on wall-clock.
        let started = std::time::Instant::now();
        let g1 = gate.clone();
        let a = tokio::spawn(async move {
            g1.run("tool_a", tokio::time::sleep(Duration::from_millis(50)))
                .await
                .unwrap();
        });
        let g2 = gate.clone();
        let b = tokio::spawn(async move {
            g2.run("tool_b", tokio::time::sleep(Duration::from_millis(50)))
                .await
                .unwrap();
        });
        a.await.unwrap();
        b.await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(95));
    }
}
