//! Pearson correlation on aligned daily returns.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::returns::AlignedReturns;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CorrelationMatrix {
    pub tickers: Vec<String>,
    /// Row-major square matrix matching `tickers` order
    pub matrix: Vec<Vec<f64>>,
    pub observations: usize,
}

fn pearson(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    let n = a.len() as f64;
    if a.len() < 2 {
        return 0.0;
    }
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (x, y) in a.iter().zip(b) {
        let dx = x - mean_a;
        let dy = y - mean_b;
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }
    if var_a <= 0.0 || var_b <= 0.0 {
        return 0.0;
    }
    cov / (var_a.sqrt() * var_b.sqrt())
}

pub fn correlation_matrix(aligned: &AlignedReturns) -> CorrelationMatrix {
    let n = aligned.tickers.len();
    let mut matrix = vec![vec![0.0; n]; n];
    for i in 0..n {
        matrix[i][i] = 1.0;
        for j in (i + 1)..n {
            let rho = pearson(&aligned.returns[i], &aligned.returns[j]);
            matrix[i][j] = rho;
            matrix[j][i] = rho;
        }
    }
    CorrelationMatrix {
        tickers: aligned.tickers.clone(),
        matrix,
        observations: aligned.len(),
    }
}
