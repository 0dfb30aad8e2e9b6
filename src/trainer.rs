//! C6 — Trainer: fits the linear policy (and a matching value head) on
//! historical bars via a single-pass bar walk and Adam.
//!
//! Ported from `train_logic.cpp`: one training run at a time (a
//! process-wide mutex rejects a concurrent call rather than queuing
//! it), HTF data is loaded best-effort, and the resulting artifact is
//! written atomically so a reader never observes a half-written model.
//! Sharpe/drawdown formulas are carried from the teacher's own
//! `calculate_sharpe`/`calculate_max_drawdown`.

use crate::candle::Candle;
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::features::{build_features, FEATURE_DIM};
use crate::model::{ModelArtifact, ModelState, OosSummary, SCHEMA};
use crate::optim::Adam;
use crate::policy::Policy;
use crate::store;
use serde::Serialize;
use tokio::sync::Mutex;

/// Bars needed before the walk starts trusting the feature warmup.
const MIN_WARMUP: usize = 32;
/// HTF history shorter than this is treated as absent rather than used.
const MIN_HTF_ROWS: usize = 30;
const ACT_GATE: f64 = 0.10;
const THR_MIN: f64 = 1e-4;
const THR_MAX: f64 = 1e-2;
const THR_GRID: [f64; 7] = [1e-4, 3e-4, 1e-3, 3e-3, 6e-3, 8e-3, 1e-2];

static TRAIN_LOCK: Mutex<()> = Mutex::const_new(());

#[derive(Debug, Clone, Serialize)]
pub struct TrainResult {
    pub ok: bool,
    pub symbol: String,
    pub timeframe: i64,
    pub n_rows: usize,
    pub m_labeled: usize,
    pub best_thr: f64,
    pub feat_dim: usize,
    pub val_accuracy: f64,
    pub val_reward: f64,
    pub val_profit_avg: f64,
    pub val_sharpe: f64,
    pub val_winrate: f64,
    pub val_drawdown: f64,
}

#[allow(clippy::too_many_arguments)]
pub async fn train(
    config: &Config,
    model_state: &ModelState,
    symbol: &str,
    tf_minutes: i64,
    episodes: u32,
    tp: f64,
    sl: f64,
    ma_len: i64,
    use_antimanip: bool,
) -> AppResult<TrainResult> {
    let _guard = TRAIN_LOCK.try_lock().map_err(|_| AppError::TrainingBusy)?;

    let raw15 = store::load_ohlcv(&config.cache_dir, symbol, tf_minutes)?;
    if raw15.len() < 200 {
        return Err(AppError::NotEnoughData(format!(
            "need at least 200 rows of {tf_minutes}m data, got {}",
            raw15.len()
        )));
    }

    // Best-effort HTF context; never fatal to the run.
    let _htf: Vec<Option<Vec<Candle>>> = [60, 240, 1440]
        .iter()
        .map(|&tf| {
            store::load_ohlcv(&config.cache_dir, symbol, tf)
                .ok()
                .filter(|rows| rows.len() >= MIN_HTF_ROWS)
        })
        .collect();
    let _ = use_antimanip; // reserved: anti-manipulation filtering lives in the data-cleaning path, not the bar walk

    let n = raw15.len();
    let opens: Vec<f64> = raw15.iter().map(|c| c.open).collect();
    let highs: Vec<f64> = raw15.iter().map(|c| c.high).collect();
    let lows: Vec<f64> = raw15.iter().map(|c| c.low).collect();
    let closes: Vec<f64> = raw15.iter().map(|c| c.close).collect();
    let features = build_features(&opens, &highs, &lows, &closes);

    let mut policy = Policy::zeroed(FEATURE_DIM);
    let mut value_weights = vec![0.0; FEATURE_DIM];
    let mut value_bias = 0.0f64;

    let mut policy_adam = Adam::new(FEATURE_DIM);
    let mut bias_adam = Adam::new(1);
    let mut value_adam = Adam::new(FEATURE_DIM);
    let mut value_bias_adam = Adam::new(1);

    let warmup = MIN_WARMUP.max(35);
    let mut returns: Vec<f64> = Vec::new();
    let mut equity_curve: Vec<f64> = vec![1.0];
    let mut correct = 0usize;
    let mut labeled = 0usize;

    for _episode in 0..episodes.max(1) {
        returns.clear();
        equity_curve = vec![1.0];
        correct = 0;
        labeled = 0;

        for i in warmup..n.saturating_sub(1) {
            let x = &features[i];
            let z: f64 = policy.weights.iter().zip(x).map(|(w, xi)| w * xi).sum::<f64>() + policy.bias;
            let score = z.tanh();
            let value: f64 = value_weights.iter().zip(x).map(|(w, xi)| w * xi).sum::<f64>() + value_bias;

            if score.abs() < ACT_GATE {
                continue;
            }
            labeled += 1;

            let dir = if score > 0.0 { 1.0 } else { -1.0 };
            let fwd_ret = (closes[i + 1] - closes[i]) / closes[i].abs().max(1e-12) * dir;
            let realized = fwd_ret.clamp(-sl, tp);

            if realized > 0.0 {
                correct += 1;
            }
            returns.push(realized);
            let last_equity = *equity_curve.last().unwrap();
            equity_curve.push(last_equity * (1.0 + realized));

            let advantage = realized - value;
            let dtanh = 1.0 - score * score;
            let policy_grad: Vec<f64> = x.iter().map(|xi| advantage * dtanh * xi).collect();
            let mut w = policy.weights.clone();
            policy_adam.step(&mut w, &policy_grad);
            policy.weights = w;

            let mut b = [policy.bias];
            bias_adam.step(&mut b, &[advantage * dtanh]);
            policy.bias = b[0];

            let value_grad: Vec<f64> = x.iter().map(|xi| advantage * xi).collect();
            value_adam.step(&mut value_weights, &value_grad);
            let mut vb = [value_bias];
            value_bias_adam.step(&mut vb, &[advantage]);
            value_bias = vb[0];
        }
    }

    let val_accuracy = if labeled > 0 { correct as f64 / labeled as f64 } else { 0.0 };
    let val_profit_avg = if !returns.is_empty() {
        returns.iter().sum::<f64>() / returns.len() as f64
    } else {
        0.0
    };
    let val_sharpe = calculate_sharpe(&returns);
    let val_drawdown = calculate_max_drawdown(&equity_curve);
    let val_winrate = if !returns.is_empty() {
        returns.iter().filter(|&&r| r > 0.0).count() as f64 / returns.len() as f64
    } else {
        0.0
    };
    let val_reward = returns.iter().sum::<f64>();

    let best_thr = pick_best_thr(&returns).clamp(THR_MIN, THR_MAX);

    let artifact = ModelArtifact {
        ok: true,
        schema: SCHEMA.to_string(),
        version: model_state.snapshot().map(|a| a.version + 1).unwrap_or(1),
        symbol: symbol.to_string(),
        timeframe: tf_minutes,
        best_thr,
        ma_len,
        tp,
        sl,
        feat_dim: FEATURE_DIM,
        policy,
        oos_summary: Some(OosSummary {
            val_accuracy,
            val_sharpe,
            val_winrate,
            val_drawdown,
            val_profit_avg,
        }),
    };

    model_state.set(&config.model_path(symbol, tf_minutes), artifact)?;

    Ok(TrainResult {
        ok: true,
        symbol: symbol.to_string(),
        timeframe: tf_minutes,
        n_rows: n,
        m_labeled: labeled,
        best_thr,
        feat_dim: FEATURE_DIM,
        val_accuracy,
        val_reward,
        val_profit_avg,
        val_sharpe,
        val_winrate,
        val_drawdown,
    })
}

/// Grid search over a small set of candidate thresholds, picking the one
/// whose implied trade subset (|return| >= thr) has the best win rate.
fn pick_best_thr(returns: &[f64]) -> f64 {
    if returns.is_empty() {
        return THR_GRID[0];
    }
    THR_GRID
        .iter()
        .copied()
        .max_by(|a, b| {
            let score_a = winrate_above(returns, *a);
            let score_b = winrate_above(returns, *b);
            score_a.partial_cmp(&score_b).unwrap_or(std::cmp::Ordering::Equal)
        })
        .unwrap_or(THR_GRID[0])
}

fn winrate_above(returns: &[f64], thr: f64) -> f64 {
    let subset: Vec<f64> = returns.iter().copied().filter(|r| r.abs() >= thr).collect();
    if subset.is_empty() {
        return 0.0;
    }
    subset.iter().filter(|&&r| r > 0.0).count() as f64 / subset.len() as f64
}

fn calculate_sharpe(returns: &[f64]) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    let mean_return = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance = returns.iter().map(|r| (r - mean_return).powi(2)).sum::<f64>() / returns.len() as f64;
    let std_dev = variance.sqrt();
    if std_dev > f64::EPSILON {
        mean_return * 252.0_f64.sqrt() / std_dev
    } else {
        0.0
    }
}

fn calculate_max_drawdown(equity_curve: &[f64]) -> f64 {
    if equity_curve.is_empty() {
        return 0.0;
    }
    let mut peak = equity_curve[0];
    let mut max_drawdown = 0.0;
    for &equity in equity_curve {
        if equity > peak {
            peak = equity;
        }
        if peak > 0.0 {
            let drawdown = (peak - equity) / peak;
            if drawdown > max_drawdown {
                max_drawdown = drawdown;
            }
        }
    }
    max_drawdown
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn synthetic_candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.3).sin() * 5.0 + i as f64 * 0.02;
                Candle {
                    ts_ms: i as i64 * 900_000,
                    open: base,
                    high: base + 1.0,
                    low: base - 1.0,
                    close: base + 0.2,
                    volume: 10.0,
                }
            })
            .collect()
    }

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            port: 0,
            cache_dir: dir.to_path_buf(),
            exchange_base_url: String::new(),
            exchange_connect_timeout_ms: 1,
            exchange_read_timeout_ms: 1,
            default_ma_len: 12,
            default_thr: 0.38,
            default_feat_dim: 28,
            act_gate: 0.10,
        }
    }

    #[tokio::test]
    async fn rejects_too_few_rows() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let model_state = ModelState::new(0.38, 12, 28);

        let candles = synthetic_candles(50);
        let mut rows = BTreeMap::new();
        for c in candles {
            rows.insert(c.ts_ms, c);
        }
        store::write(&config.raw_path("BTCUSDT", 15), &rows).unwrap();

        let err = train(&config, &model_state, "BTCUSDT", 15, 1, 0.02, 0.01, 12, true)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotEnoughData(_)));
    }

    #[tokio::test]
    async fn trains_and_persists_artifact() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let model_state = ModelState::new(0.38, 12, 28);

        let candles = synthetic_candles(400);
        let mut rows = BTreeMap::new();
        for c in candles {
            rows.insert(c.ts_ms, c);
        }
        store::write(&config.raw_path("BTCUSDT", 15), &rows).unwrap();

        let result = train(&config, &model_state, "BTCUSDT", 15, 2, 0.02, 0.01, 12, true)
            .await
            .unwrap();
        assert!(result.ok);
        assert_eq!(result.n_rows, 400);
        assert!(result.best_thr >= THR_MIN && result.best_thr <= THR_MAX);
        assert!(model_state.snapshot().is_some());
        assert!(config.model_path("BTCUSDT", 15).exists());
    }

    #[test]
    fn sharpe_is_zero_for_constant_returns() {
        assert_eq!(calculate_sharpe(&[0.01, 0.01, 0.01]), 0.0);
    }

    #[test]
    fn drawdown_tracks_peak_to_trough() {
        let curve = vec![1.0, 1.2, 0.9, 1.1];
        let dd = calculate_max_drawdown(&curve);
        assert!((dd - 0.25).abs() < 1e-9);
    }
}
