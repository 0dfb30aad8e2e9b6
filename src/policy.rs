//! C5 — Linear policy scorer: an affine transform over the feature
//! vector through `tanh`, optionally preceded by per-feature
//! standardization. Ported from `policy_score_on_raw` in the original
//! inference path — this is the same math the trainer optimizes and
//! the inference module calls per timeframe.

use crate::candle::Candle;
use crate::error::{AppError, AppResult};
use crate::features::{build_features, FEATURE_DIM};
use serde::{Deserialize, Serialize};

const MIN_ROWS: usize = 60;
const STD_EPS: f64 = 1e-8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Normalization {
    pub mu: Vec<f64>,
    pub sd: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub dim: usize,
    pub weights: Vec<f64>,
    pub bias: f64,
    pub norm: Option<Normalization>,
}

impl Policy {
    pub fn zeroed(dim: usize) -> Self {
        Self {
            dim,
            weights: vec![0.0; dim],
            bias: 0.0,
            norm: None,
        }
    }
}

fn column_zscore(matrix: &[Vec<f64>], row: &[f64]) -> Vec<f64> {
    let d = row.len();
    let n = matrix.len() as f64;
    let mut mean = vec![0.0; d];
    for r in matrix {
        for j in 0..d {
            mean[j] += r[j];
        }
    }
    for m in mean.iter_mut() {
        *m /= n.max(1.0);
    }
    let mut var = vec![0.0; d];
    for r in matrix {
        for j in 0..d {
            var[j] += (r[j] - mean[j]).powi(2);
        }
    }
    for v in var.iter_mut() {
        *v /= n.max(1.0);
    }
    (0..d)
        .map(|j| (row[j] - mean[j]) / var[j].sqrt().max(STD_EPS))
        .collect()
}

fn apply_norm(norm: &Normalization, row: &[f64]) -> Vec<f64> {
    row.iter()
        .enumerate()
        .map(|(j, x)| {
            let sd = norm.sd.get(j).copied().unwrap_or(1.0).max(STD_EPS);
            let mu = norm.mu.get(j).copied().unwrap_or(0.0);
            (x - mu) / sd
        })
        .collect()
}

/// Score the most recent bar of `ohlcv` against `policy`. The second
/// element of the return is `true` iff the policy's own norm block was
/// applied, `false` if inference fell back to the per-column z-score of
/// the request window.
pub fn score(ohlcv: &[Candle], policy: &Policy) -> AppResult<(f64, bool)> {
    raw_score(ohlcv, policy).map_err(|e| AppError::ScoringFailed(e.to_string()))
}

fn raw_score(ohlcv: &[Candle], policy: &Policy) -> AppResult<(f64, bool)> {
    if ohlcv.len() < MIN_ROWS {
        return Err(AppError::NotEnoughData(format!(
            "need at least {MIN_ROWS} rows, got {}",
            ohlcv.len()
        )));
    }

    let opens: Vec<f64> = ohlcv.iter().map(|c| c.open).collect();
    let highs: Vec<f64> = ohlcv.iter().map(|c| c.high).collect();
    let lows: Vec<f64> = ohlcv.iter().map(|c| c.low).collect();
    let closes: Vec<f64> = ohlcv.iter().map(|c| c.close).collect();

    let features = build_features(&opens, &highs, &lows, &closes);
    let last = features.last().expect("checked non-empty above");
    if last.len() != FEATURE_DIM {
        return Err(AppError::DimensionMismatch {
            expected: policy.dim,
            got: last.len(),
        });
    }
    if policy.dim != FEATURE_DIM {
        return Err(AppError::DimensionMismatch {
            expected: policy.dim,
            got: FEATURE_DIM,
        });
    }

    let (x, used_norm) = match &policy.norm {
        Some(norm) => (apply_norm(norm, last), true),
        None => (column_zscore(&features, last), false),
    };

    let z: f64 = policy
        .weights
        .iter()
        .zip(&x)
        .map(|(w, xi)| w * xi)
        .sum::<f64>()
        + policy.bias;
    Ok((z.tanh(), used_norm))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic_candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.3).sin() * 5.0 + i as f64 * 0.05;
                Candle {
                    ts_ms: i as i64 * 900_000,
                    open: base,
                    high: base + 1.0,
                    low: base - 1.0,
                    close: base + 0.2,
                    volume: 10.0 + i as f64,
                }
            })
            .collect()
    }

    #[test]
    fn rejects_too_few_rows() {
        let candles = synthetic_candles(10);
        let policy = Policy::zeroed(FEATURE_DIM);
        let err = score(&candles, &policy).unwrap_err();
        assert!(matches!(err, AppError::ScoringFailed(_)));
    }

    #[test]
    fn rejects_dimension_mismatch() {
        let candles = synthetic_candles(100);
        let policy = Policy::zeroed(FEATURE_DIM + 1);
        let err = score(&candles, &policy).unwrap_err();
        assert!(matches!(err, AppError::ScoringFailed(_)));
    }

    #[test]
    fn zero_weights_score_near_bias() {
        let candles = synthetic_candles(100);
        let mut policy = Policy::zeroed(FEATURE_DIM);
        policy.bias = 0.0;
        let (s, used_norm) = score(&candles, &policy).unwrap();
        assert!(s.abs() < 1e-9);
        assert!(!used_norm); // no norm block on a zeroed policy
    }

    #[test]
    fn explicit_norm_is_used_over_fallback() {
        let candles = synthetic_candles(100);
        let mut policy = Policy::zeroed(FEATURE_DIM);
        policy.weights[0] = 1.0;
        policy.norm = Some(Normalization {
            mu: vec![0.0; FEATURE_DIM],
            sd: vec![1.0; FEATURE_DIM],
        });
        let (s, used_norm) = score(&candles, &policy).unwrap();
        assert!(s.is_finite());
        assert!(used_norm);
    }
}
