//! C9 — Pipeline orchestrator: the `/api/pipeline/prepare_train` flow,
//! composing the other components as in-process calls rather than the
//! original's HTTP self-calls (see `routes/pipeline.cpp`). Steps run in
//! a fixed order and short-circuit on the first failure, except the
//! final inference snapshot, which is explicitly non-fatal.

use crate::backfill;
use crate::config::Config;
use crate::error::AppError;
use crate::exchange::ExchangeClient;
use crate::infer;
use crate::model::ModelState;
use crate::store;
use crate::symbol::{self, CANONICAL_TFS};
use crate::trainer;
use serde::Serialize;
use serde_json::Value;

const MIN_ROWS_15M: usize = 300;
const DEFAULT_EPISODES: u32 = 3;
const DEFAULT_TP: f64 = 0.02;
const DEFAULT_SL: f64 = 0.01;
const DEFAULT_MA_LEN: i64 = 12;
const BACKFILL_MONTHS: i64 = 6;

/// Optional overrides for `/api/pipeline/prepare_train`; absent fields
/// fall back to the module defaults above.
#[derive(Debug, Clone, Default)]
pub struct PrepareTrainParams {
    pub months: Option<i64>,
    pub base_tf_minutes: Option<i64>,
    pub tp: Option<f64>,
    pub sl: Option<f64>,
    pub ma_len: Option<i64>,
    pub episodes: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Step {
    pub step: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl Step {
    fn ok(step: &str, extra: Value) -> Self {
        Self {
            step: step.to_string(),
            ok: true,
            error: None,
            extra: Some(extra),
        }
    }

    fn fail(step: &str, error: impl std::fmt::Display) -> Self {
        Self {
            step: step.to_string(),
            ok: false,
            error: Some(error.to_string()),
            extra: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub ok: bool,
    pub symbol: String,
    pub steps: Vec<Step>,
}

pub async fn prepare_train(
    config: &Config,
    model_state: &ModelState,
    exchange: &dyn ExchangeClient,
    requested_symbol: &str,
    params: PrepareTrainParams,
) -> PipelineResult {
    let symbol = symbol::normalize(requested_symbol);
    let mut steps = Vec::new();

    let months = params.months.unwrap_or(BACKFILL_MONTHS);
    let base_tf = params.base_tf_minutes.unwrap_or(15);
    let tp = params.tp.unwrap_or(DEFAULT_TP);
    let sl = params.sl.unwrap_or(DEFAULT_SL);
    let ma_len = params.ma_len.unwrap_or(DEFAULT_MA_LEN);
    let episodes = params.episodes.unwrap_or(DEFAULT_EPISODES);

    // Step 1: backfill every canonical timeframe.
    let mut backfill_ok = true;
    let mut backfill_extra = serde_json::Map::new();
    for &tf in &CANONICAL_TFS {
        match backfill::backfill(config, exchange, &symbol, tf, months).await {
            Ok(stats) => {
                if !stats.ok {
                    backfill_ok = false;
                }
                backfill_extra.insert(tf.to_string(), serde_json::to_value(&stats).unwrap());
            }
            Err(e) => {
                backfill_ok = false;
                backfill_extra.insert(tf.to_string(), Value::String(e.to_string()));
            }
        }
    }
    steps.push(if backfill_ok {
        Step::ok("backfill", Value::Object(backfill_extra))
    } else {
        Step {
            step: "backfill".to_string(),
            ok: false,
            error: Some("one or more timeframes failed to backfill".to_string()),
            extra: Some(Value::Object(backfill_extra)),
        }
    });
    if !backfill_ok {
        return PipelineResult { ok: false, symbol, steps };
    }

    // Step 2: clean — reload the raw 15m store and rewrite the clean variant.
    match store::load_ohlcv(&config.cache_dir, &symbol, 15) {
        Ok(rows) => {
            let mut map = std::collections::BTreeMap::new();
            for c in rows {
                map.insert(c.ts_ms, c);
            }
            match store::write_clean(&config.clean_path(&symbol, 15), &map) {
                Ok(()) => steps.push(Step::ok("clean", serde_json::json!({"rows": map.len()}))),
                Err(e) => {
                    steps.push(Step::fail("clean", e));
                    return PipelineResult { ok: false, symbol, steps };
                }
            }
        }
        Err(e) => {
            steps.push(Step::fail("clean", e));
            return PipelineResult { ok: false, symbol, steps };
        }
    }

    // Step 3: fill_gaps_15m.
    let clean_path_15m = config.clean_path(&symbol, 15);
    let had_gaps = store::has_gaps_15m(&clean_path_15m);
    if had_gaps {
        let _ = backfill::backfill(config, exchange, &symbol, 15, months).await;
    }
    let gaps_remaining = store::has_gaps_15m(&clean_path_15m);
    if gaps_remaining {
        steps.push(Step::fail("fill_gaps_15m", "gaps_remain"));
        return PipelineResult { ok: false, symbol, steps };
    }
    steps.push(Step::ok(
        "fill_gaps_15m",
        serde_json::json!({"had_gaps": had_gaps, "gaps_remaining": gaps_remaining}),
    ));

    // Step 4: verify_rows_15m.
    let row_count = match store::load_ohlcv(&config.cache_dir, &symbol, 15) {
        Ok(rows) => rows.len(),
        Err(e) => {
            steps.push(Step::fail("verify_rows_15m", e));
            return PipelineResult { ok: false, symbol, steps };
        }
    };
    if row_count < MIN_ROWS_15M {
        steps.push(Step::fail(
            "verify_rows_15m",
            AppError::NotEnoughData(format!("need >= {MIN_ROWS_15M} rows, got {row_count}")),
        ));
        return PipelineResult { ok: false, symbol, steps };
    }
    steps.push(Step::ok("verify_rows_15m", serde_json::json!({"rows": row_count})));

    // Step 5: train.
    let train_result = trainer::train(
        config,
        model_state,
        &symbol,
        base_tf,
        episodes,
        tp,
        sl,
        ma_len,
        true,
    )
    .await;
    match train_result {
        Ok(result) => steps.push(Step::ok("train", serde_json::to_value(&result).unwrap())),
        Err(e) => {
            steps.push(Step::fail("train", e));
            return PipelineResult { ok: false, symbol, steps };
        }
    }

    // Step 6: infer_snapshot — non-fatal; recorded even on failure.
    let snapshot = model_state.snapshot();
    let infer_outcome = match &snapshot {
        Some(model) => match store::load_ohlcv(&config.cache_dir, &symbol, base_tf) {
            Ok(raw) => infer::infer_single(model, &raw, config.act_gate),
            Err(e) => Err(e),
        },
        None => Err(AppError::NoPolicyInModel),
    };
    match infer_outcome {
        Ok(result) => steps.push(Step::ok("infer_snapshot", serde_json::to_value(&result).unwrap())),
        Err(e) => steps.push(Step {
            step: "infer_snapshot".to_string(),
            ok: false,
            error: Some(e.to_string()),
            extra: None,
        }),
    }

    PipelineResult { ok: true, symbol, steps }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle::Candle;
    use crate::exchange::MockExchangeClient;
    use crate::error::AppResult;
    use tempfile::tempdir;

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

    fn page(n: usize, start_ts: i64) -> AppResult<Vec<Candle>> {
        Ok((0..n)
            .map(|i| {
                let ts = start_ts + i as i64 * 900_000;
                let base = 100.0 + (i as f64 * 0.3).sin() * 2.0;
                Candle {
                    ts_ms: ts,
                    open: base,
                    high: base + 1.0,
                    low: base - 1.0,
                    close: base + 0.1,
                    volume: 10.0,
                }
            })
            .collect())
    }

    #[tokio::test]
    async fn short_circuits_when_backfill_fails_every_page() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let model_state = ModelState::new(0.38, 12, 28);
        let exchange = MockExchangeClient::new(vec![
            Err(AppError::UpstreamTransient("e".into())),
            Err(AppError::UpstreamTransient("e".into())),
            Err(AppError::UpstreamTransient("e".into())),
            Err(AppError::UpstreamTransient("e".into())),
            Err(AppError::UpstreamTransient("e".into())),
        ]);

        let result = prepare_train(&config, &model_state, &exchange, "btcusdt", PrepareTrainParams::default()).await;
        assert!(!result.ok);
        assert_eq!(result.steps[0].step, "backfill");
        assert!(!result.steps[0].ok);
        assert_eq!(result.steps.len(), 1);
    }

    #[tokio::test]
    async fn runs_through_train_with_enough_data() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let model_state = ModelState::new(0.38, 12, 28);
        // Each canonical TF gets one page of 400 rows then an empty page to stop.
        let exchange = MockExchangeClient::new(vec![
            page(400, 0),
            Ok(vec![]),
            page(400, 0),
            Ok(vec![]),
            page(400, 0),
            Ok(vec![]),
            page(400, 0),
            Ok(vec![]),
        ]);

        let result = prepare_train(&config, &model_state, &exchange, "BTCUSDT", PrepareTrainParams::default()).await;
        assert_eq!(result.symbol, "BTCUSDT");
        let step_names: Vec<&str> = result.steps.iter().map(|s| s.step.as_str()).collect();
        assert!(step_names.contains(&"train"));
    }
}
