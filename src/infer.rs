//! C7 — Multi-timeframe inference: combine a base-timeframe policy
//! score with up to three higher-timeframe scores via an
//! agreement-weighted context multiplier.
//!
//! Ported from `infer_with_policy_mtf` in the original inference dump:
//! each HTF that's available votes on direction agreement with the
//! base score, `wctx_htf = 0.75 + 0.25 * (agree / available)` scales
//! the base score. Realized volatility (`sigma`) is reported for
//! downstream UI gating only — it never affects the LONG/SHORT/NEUTRAL
//! decision, which is solely `a_w` vs `±thr`.

use crate::candle::Candle;
use crate::error::{AppError, AppResult};
use crate::model::ModelArtifact;
use crate::policy;
use serde::Serialize;

/// Bars of trailing close-to-close returns used to estimate volatility.
const SIGMA_WINDOW: usize = 64;
/// Reported alongside `sigma` for downstream UI gating; not part of the
/// direction decision itself.
const VOL_THRESHOLD: f64 = 0.001;
/// An HTF record is "strong" once its score magnitude clears this.
const STRONG_EPS: f64 = 0.3;
pub const HTF_MINUTES: [i64; 3] = [60, 240, 1440];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
    Neutral,
}

#[derive(Debug, Clone, Serialize)]
pub struct HtfRecord {
    pub tf_minutes: i64,
    pub present: bool,
    pub score: Option<f64>,
    pub agree: Option<bool>,
    pub eps: Option<f64>,
    pub strong: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InferResult {
    pub direction: Direction,
    pub score_base: f64,
    pub used_norm: bool,
    pub weighted_score: f64,
    pub wctx_htf: f64,
    pub sigma: f64,
    pub vol_threshold: f64,
    pub gate: f64,
    pub htf: Vec<HtfRecord>,
}

fn trailing_sigma(raw15: &[Candle]) -> f64 {
    let closes: Vec<f64> = raw15.iter().map(|c| c.close).collect();
    if closes.len() < 2 {
        return 0.0;
    }
    let start = closes.len().saturating_sub(SIGMA_WINDOW + 1);
    let window = &closes[start..];
    let returns: Vec<f64> = window
        .windows(2)
        .map(|w| (w[1] - w[0]) / w[0].abs().max(1e-12))
        .collect();
    if returns.is_empty() {
        return 0.0;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    variance.sqrt()
}

/// Signal is solely a function of the weighted score against `±gate`;
/// `sigma` is never consulted here (see module docs).
fn gate_direction(weighted: f64, gate: f64) -> Direction {
    if weighted >= gate {
        Direction::Long
    } else if weighted <= -gate {
        Direction::Short
    } else {
        Direction::Neutral
    }
}

/// Multi-timeframe inference. `htf` entries are in the order of
/// [`HTF_MINUTES`] (60, 240, 1440); `None` means that timeframe's data
/// wasn't available to the caller.
pub fn infer_mtf(
    model: &ModelArtifact,
    raw15: &[Candle],
    htf: [Option<&[Candle]>; 3],
) -> AppResult<InferResult> {
    let (score_base, used_norm) = policy::score(raw15, &model.policy)?;
    let base_sign = score_base.signum();

    let mut records = Vec::with_capacity(3);
    let mut available = 0u32;
    let mut agree_count = 0u32;

    for (tf_minutes, data) in HTF_MINUTES.into_iter().zip(htf) {
        match data {
            Some(rows) => match policy::score(rows, &model.policy) {
                Ok((htf_score, _)) => {
                    available += 1;
                    let agree = htf_score.signum() == base_sign;
                    if agree {
                        agree_count += 1;
                    }
                    let eps = htf_score.abs();
                    records.push(HtfRecord {
                        tf_minutes,
                        present: true,
                        score: Some(htf_score),
                        agree: Some(agree),
                        eps: Some(eps),
                        strong: Some(eps >= STRONG_EPS),
                    });
                }
                Err(_) => records.push(HtfRecord {
                    tf_minutes,
                    present: false,
                    score: None,
                    agree: None,
                    eps: None,
                    strong: None,
                }),
            },
            None => records.push(HtfRecord {
                tf_minutes,
                present: false,
                score: None,
                agree: None,
                eps: None,
                strong: None,
            }),
        }
    }

    let wctx_htf = if available > 0 {
        0.75 + 0.25 * (agree_count as f64 / available as f64)
    } else {
        1.0
    };

    let weighted_score = score_base * wctx_htf;
    let sigma = trailing_sigma(raw15);
    let gate = model.best_thr;
    let direction = gate_direction(weighted_score, gate);

    Ok(InferResult {
        direction,
        score_base,
        used_norm,
        weighted_score,
        wctx_htf,
        sigma,
        vol_threshold: VOL_THRESHOLD,
        gate,
        htf: records,
    })
}

/// Single-timeframe inference: no HTF context, gated by a fixed
/// `act_gate` rather than the model's trained `best_thr`.
pub fn infer_single(model: &ModelArtifact, raw15: &[Candle], act_gate: f64) -> AppResult<InferResult> {
    let (score_base, used_norm) = policy::score(raw15, &model.policy)?;
    let sigma = trailing_sigma(raw15);
    let direction = gate_direction(score_base, act_gate);

    Ok(InferResult {
        direction,
        score_base,
        used_norm,
        weighted_score: score_base,
        wctx_htf: 1.0,
        sigma,
        vol_threshold: VOL_THRESHOLD,
        gate: act_gate,
        htf: Vec::new(),
    })
}

pub fn require_policy(model: Option<&ModelArtifact>) -> AppResult<&ModelArtifact> {
    model.ok_or(AppError::NoPolicyInModel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FEATURE_DIM;
    use crate::model::SCHEMA;
    use crate::policy::Policy;

    fn trending_candles(n: usize, slope: f64) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 100.0 + i as f64 * slope + (i as f64 * 0.3).sin() * 0.5;
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

    fn model_with_weight() -> ModelArtifact {
        let mut policy = Policy::zeroed(FEATURE_DIM);
        policy.weights[1] = 5.0; // weight the EMA(8)-EMA(21) diff heavily
        ModelArtifact {
            ok: true,
            schema: SCHEMA.to_string(),
            version: 1,
            symbol: "BTCUSDT".to_string(),
            timeframe: 15,
            best_thr: 0.05,
            ma_len: 12,
            tp: 0.02,
            sl: 0.01,
            feat_dim: FEATURE_DIM,
            policy,
            oos_summary: None,
        }
    }

    #[test]
    fn no_htf_data_yields_neutral_multiplier() {
        let model = model_with_weight();
        let raw15 = trending_candles(200, 0.5);
        let result = infer_mtf(&model, &raw15, [None, None, None]).unwrap();
        assert_eq!(result.wctx_htf, 1.0);
        assert!(result.htf.iter().all(|r| !r.present));
    }

    #[test]
    fn agreeing_htf_scales_score_up() {
        let model = model_with_weight();
        let raw15 = trending_candles(200, 0.5);
        let raw60 = trending_candles(200, 0.5);
        let result = infer_mtf(&model, &raw15, [Some(&raw60), None, None]).unwrap();
        assert!(result.wctx_htf >= 0.75);
        assert_eq!(result.htf[0].present, true);
    }

    #[test]
    fn low_volatility_is_reported_but_does_not_force_neutral() {
        let model = model_with_weight();
        let raw15: Vec<Candle> = (0..200)
            .map(|i| Candle {
                ts_ms: i as i64 * 900_000,
                open: 100.0,
                high: 100.0,
                low: 100.0,
                close: 100.0,
                volume: 10.0,
            })
            .collect();
        let result = infer_mtf(&model, &raw15, [None, None, None]).unwrap();
        assert!(result.sigma < VOL_THRESHOLD);
        // sigma is side-measurement only: a quiet tape with a weighted
        // score past the gate still produces a directional signal.
        assert_eq!(
            result.direction,
            if result.weighted_score >= result.gate {
                Direction::Long
            } else if result.weighted_score <= -result.gate {
                Direction::Short
            } else {
                Direction::Neutral
            }
        );
    }

    #[test]
    fn htf_strong_flag_tracks_eps_threshold() {
        let model = model_with_weight();
        let raw15 = trending_candles(200, 0.5);
        let raw60 = trending_candles(200, 0.5);
        let result = infer_mtf(&model, &raw15, [Some(&raw60), None, None]).unwrap();
        let rec = &result.htf[0];
        assert_eq!(rec.eps, rec.score.map(f64::abs));
        assert_eq!(rec.strong, Some(rec.eps.unwrap() >= 0.3));
    }

    #[test]
    fn single_tf_uses_fixed_gate_not_model_thr() {
        let model = model_with_weight();
        let raw15 = trending_candles(200, 0.5);
        let result = infer_single(&model, &raw15, 0.10).unwrap();
        assert_eq!(result.gate, 0.10);
        assert_ne!(result.gate, model.best_thr);
    }
}
