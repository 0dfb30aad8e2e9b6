//! Route handlers. Each one parses its query/body, delegates to a
//! component module, and shapes the JSON response — no business logic
//! lives here.

use super::state::AppState;
use crate::error::{AppError, AppResult};
use crate::infer::InferResult;
use crate::model::ModelOverrides;
use crate::pipeline::PrepareTrainParams;
use crate::symbol::{canonical_minutes, normalize, CANONICAL_TFS};
use crate::{infer, pipeline, store};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

fn row_count(state: &AppState, symbol: &str, tf_minutes: i64) -> usize {
    store::load_ohlcv(&state.config.cache_dir, symbol, tf_minutes)
        .map(|rows| rows.len())
        .unwrap_or(0)
}

fn data_rows(state: &AppState, symbol: &str) -> serde_json::Value {
    let mut rows = serde_json::Map::new();
    for &tf in &CANONICAL_TFS {
        rows.insert(tf.to_string(), json!(row_count(state, symbol, tf)));
    }
    serde_json::Value::Object(rows)
}

#[derive(Debug, Deserialize)]
pub struct HealthQuery {
    pub symbol: Option<String>,
}

pub async fn health(State(state): State<AppState>, Query(q): Query<HealthQuery>) -> Json<serde_json::Value> {
    let rows = match q.symbol.as_deref() {
        Some(sym) => data_rows(&state, &normalize(sym)),
        None => {
            let mut empty = serde_json::Map::new();
            for &tf in &CANONICAL_TFS {
                empty.insert(tf.to_string(), json!(0));
            }
            serde_json::Value::Object(empty)
        }
    };
    Json(json!({
        "ok": true,
        "ts": chrono::Utc::now().to_rfc3339(),
        "uptime_s": state.started_at.elapsed().as_secs(),
        "data_rows": rows,
    }))
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    let metrics = state.queue.metrics().await;
    let body = format!(
        "# HELP signalboat_queue_enqueued_total Tasks enqueued since start.\n\
         # TYPE signalboat_queue_enqueued_total counter\n\
         signalboat_queue_enqueued_total {}\n\
         # HELP signalboat_queue_running Tasks currently running.\n\
         # TYPE signalboat_queue_running gauge\n\
         signalboat_queue_running {}\n\
         # HELP signalboat_queue_succeeded_total Tasks that completed successfully.\n\
         # TYPE signalboat_queue_succeeded_total counter\n\
         signalboat_queue_succeeded_total {}\n\
         # HELP signalboat_queue_failed_total Tasks that completed with an error.\n\
         # TYPE signalboat_queue_failed_total counter\n\
         signalboat_queue_failed_total {}\n\
         # HELP signalboat_queue_length Tasks waiting to run.\n\
         # TYPE signalboat_queue_length gauge\n\
         signalboat_queue_length {}\n",
        metrics.enqueued_total, metrics.running, metrics.succeeded_total, metrics.failed_total, metrics.queue_length,
    );
    ([("content-type", "text/plain; version=0.0.4")], body).into_response()
}

#[derive(Debug, Deserialize)]
pub struct BackfillQuery {
    pub symbol: String,
    pub which: Option<String>,
    pub months: Option<i64>,
}

pub async fn backfill(
    State(state): State<AppState>,
    Query(q): Query<BackfillQuery>,
) -> AppResult<Json<serde_json::Value>> {
    let symbol = normalize(&q.symbol);
    let months = q.months.unwrap_or(6);

    let tfs: Vec<i64> = match &q.which {
        Some(list) => list
            .split(',')
            .filter_map(|s| canonical_minutes(s.trim()))
            .collect(),
        None => CANONICAL_TFS.to_vec(),
    };
    let tfs = if tfs.is_empty() { CANONICAL_TFS.to_vec() } else { tfs };

    let mut health = Vec::with_capacity(tfs.len());
    let mut ok = true;
    for tf in &tfs {
        match crate::backfill::backfill(&state.config, &*state.exchange, &symbol, *tf, months).await {
            Ok(stats) => {
                if !stats.ok {
                    ok = false;
                }
                health.push(json!({"interval": tf, "ok": stats.ok, "stats": stats}));
            }
            Err(e) => {
                ok = false;
                health.push(json!({"interval": tf, "ok": false, "error": e.to_string()}));
            }
        }
    }

    Ok(Json(json!({"ok": ok, "intervals": tfs, "health": health})))
}

#[derive(Debug, Deserialize)]
pub struct TrainQuery {
    pub symbol: String,
    pub tf: Option<String>,
    pub episodes: Option<u32>,
    pub tp: Option<f64>,
    pub sl: Option<f64>,
    pub ma_len: Option<i64>,
}

pub async fn train(
    State(state): State<AppState>,
    Query(q): Query<TrainQuery>,
) -> AppResult<Json<serde_json::Value>> {
    let symbol = normalize(&q.symbol);
    let tf_minutes = q
        .tf
        .as_deref()
        .and_then(canonical_minutes)
        .unwrap_or(15);
    let model_state = state.model_state(&symbol, tf_minutes).await;

    let result = crate::trainer::train(
        &state.config,
        &model_state,
        &symbol,
        tf_minutes,
        q.episodes.unwrap_or(3),
        q.tp.unwrap_or(0.02),
        q.sl.unwrap_or(0.01),
        q.ma_len.unwrap_or(state.config.default_ma_len),
        true,
    )
    .await?;

    Ok(Json(json!({
        "ok": result.ok,
        "best_thr": result.best_thr,
        "metrics": result,
        "model_path": state.config.model_path(&symbol, tf_minutes),
    })))
}

#[derive(Debug, Deserialize)]
pub struct InferQuery {
    pub symbol: String,
    pub tf: Option<String>,
    pub mtf: Option<bool>,
}

/// Derived fields the spec requires computed at the HTTP edge, not
/// inside C7: last close, per-direction TP/SL prices, and a confidence
/// mapping off the weighted score vs gate.
fn infer_edge_fields(result: &InferResult, model: &crate::model::ModelArtifact, last_close: f64) -> serde_json::Value {
    let tp = model.tp;
    let sl = model.sl;
    let confidence = if result.gate > 0.0 {
        (result.weighted_score.abs() / result.gate).min(1.0)
    } else {
        0.0
    };
    json!({
        "thr": result.gate,
        "tp": tp,
        "sl": sl,
        "last_close": last_close,
        "tp_price_long": last_close * (1.0 + tp),
        "sl_price_long": last_close * (1.0 - sl),
        "tp_price_short": last_close * (1.0 - tp),
        "sl_price_short": last_close * (1.0 + sl),
        "confidence": confidence,
    })
}

pub async fn infer(
    State(state): State<AppState>,
    Query(q): Query<InferQuery>,
) -> AppResult<Json<serde_json::Value>> {
    let symbol = normalize(&q.symbol);
    let tf_minutes = q.tf.as_deref().and_then(canonical_minutes).unwrap_or(15);
    let model_state = state.model_state(&symbol, tf_minutes).await;
    let artifact = model_state.snapshot().ok_or(AppError::NoPolicyInModel)?;

    let raw15 = store::load_ohlcv(&state.config.cache_dir, &symbol, 15)?;
    let last_close = raw15.last().map(|c| c.close).unwrap_or(0.0);

    let result = if q.mtf.unwrap_or(true) {
        let raw60 = store::load_ohlcv(&state.config.cache_dir, &symbol, 60).ok();
        let raw240 = store::load_ohlcv(&state.config.cache_dir, &symbol, 240).ok();
        let raw1440 = store::load_ohlcv(&state.config.cache_dir, &symbol, 1440).ok();
        infer::infer_mtf(
            &artifact,
            &raw15,
            [raw60.as_deref(), raw240.as_deref(), raw1440.as_deref()],
        )?
    } else {
        infer::infer_single(&artifact, &raw15, state.config.act_gate)?
    };

    let mut body = serde_json::to_value(&result).unwrap();
    let edge = infer_edge_fields(&result, &artifact, last_close);
    let obj = body.as_object_mut().expect("InferResult serializes to an object");
    obj.insert("ok".to_string(), json!(true));
    obj.insert("signal".to_string(), serde_json::to_value(result.direction).unwrap());
    obj.insert("score15".to_string(), json!(result.score_base));
    if let serde_json::Value::Object(edge) = edge {
        obj.extend(edge);
    }

    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
pub struct SymbolTfQuery {
    pub symbol: String,
    pub tf: Option<String>,
}

pub async fn get_model(
    State(state): State<AppState>,
    Query(q): Query<SymbolTfQuery>,
) -> AppResult<Json<serde_json::Value>> {
    let symbol = normalize(&q.symbol);
    let tf_minutes = q.tf.as_deref().and_then(canonical_minutes).unwrap_or(15);
    let model_state = state.model_state(&symbol, tf_minutes).await;
    let artifact = model_state.snapshot().ok_or(AppError::NoPolicyInModel)?;
    Ok(Json(json!({
        "best_thr": artifact.best_thr,
        "ma_len": artifact.ma_len,
        "feat_dim": artifact.feat_dim,
        "symbol": artifact.symbol,
        "interval": artifact.timeframe,
        "schema": artifact.schema,
        "mode": "mtf",
    })))
}

#[derive(Debug, Deserialize)]
pub struct SetModelBody {
    pub symbol: String,
    pub tf: Option<String>,
    #[serde(flatten)]
    pub overrides: ModelOverrides,
}

pub async fn set_model(
    State(state): State<AppState>,
    Json(body): Json<SetModelBody>,
) -> AppResult<Json<serde_json::Value>> {
    let symbol = normalize(&body.symbol);
    let tf_minutes = body.tf.as_deref().and_then(canonical_minutes).unwrap_or(15);
    let model_state = state.model_state(&symbol, tf_minutes).await;
    let path = state.config.model_path(&symbol, tf_minutes);
    let applied = model_state.apply_overrides(&path, body.overrides)?;
    Ok(Json(json!({
        "ok": true,
        "applied": applied,
        "state": {
            "thr": model_state.thr(),
            "ma_len": model_state.ma_len(),
            "feat_dim": model_state.feat_dim(),
        },
        "path": path,
    })))
}

pub async fn health_ai(
    State(state): State<AppState>,
    Query(q): Query<SymbolTfQuery>,
) -> Json<serde_json::Value> {
    let symbol = normalize(&q.symbol);
    let tf_minutes = q.tf.as_deref().and_then(canonical_minutes).unwrap_or(15);
    let model_state = state.model_state(&symbol, tf_minutes).await;
    let snapshot = model_state.snapshot();

    let model = json!({
        "ok": snapshot.is_some(),
        "symbol": symbol,
        "interval": tf_minutes,
        "schema": snapshot.as_ref().map(|a| a.schema.clone()),
        "thr": model_state.thr(),
        "ma_len": model_state.ma_len(),
        "feat_dim": model_state.feat_dim(),
    });

    let data = data_rows(&state, &symbol);

    let context = match &snapshot {
        Some(artifact) => match store::load_ohlcv(&state.config.cache_dir, &symbol, 15) {
            Ok(raw15) if !raw15.is_empty() => {
                let raw60 = store::load_ohlcv(&state.config.cache_dir, &symbol, 60).ok();
                let raw240 = store::load_ohlcv(&state.config.cache_dir, &symbol, 240).ok();
                let raw1440 = store::load_ohlcv(&state.config.cache_dir, &symbol, 1440).ok();
                match infer::infer_mtf(artifact, &raw15, [raw60.as_deref(), raw240.as_deref(), raw1440.as_deref()]) {
                    Ok(result) => json!({
                        "wctx_htf": result.wctx_htf,
                        "signal": result.direction,
                    }),
                    Err(_) => json!({"wctx_htf": null, "signal": null}),
                }
            }
            _ => json!({"wctx_htf": null, "signal": null}),
        },
        None => json!({"wctx_htf": null, "signal": null}),
    };

    Json(json!({
        "ok": true,
        "model": model,
        "data": data,
        "context": context,
    }))
}

#[derive(Debug, Deserialize)]
pub struct HydrateBody {
    pub symbol: String,
    pub interval: Option<String>,
    pub intervals: Option<Vec<String>>,
    pub months: Option<i64>,
}

pub async fn hydrate(
    State(state): State<AppState>,
    Json(body): Json<HydrateBody>,
) -> Json<serde_json::Value> {
    let symbol = normalize(&body.symbol);
    let months = body.months.unwrap_or(6);

    let mut wanted: Vec<String> = body.intervals.unwrap_or_default();
    if let Some(single) = body.interval {
        wanted.push(single);
    }
    if wanted.is_empty() {
        wanted = CANONICAL_TFS.iter().map(|tf| tf.to_string()).collect();
    }

    let mut tasks = Vec::with_capacity(wanted.len());
    for interval in wanted {
        tasks.push(state.queue.enqueue(&symbol, &interval, months).await);
    }

    Json(json!({"ok": true, "symbol": symbol, "tasks": tasks}))
}

#[derive(Debug, Deserialize)]
pub struct SymbolStatusQuery {
    pub symbol: Option<String>,
    pub interval: Option<String>,
}

pub async fn symbol_status(
    State(state): State<AppState>,
    Query(q): Query<SymbolStatusQuery>,
) -> AppResult<Json<serde_json::Value>> {
    let symbol = q.symbol.as_deref().map(normalize);
    let tf_minutes = match q.interval.as_deref() {
        Some(interval) => Some(
            canonical_minutes(interval)
                .ok_or_else(|| AppError::InvalidInput(format!("unrecognized interval {interval:?}")))?,
        ),
        None => None,
    };
    let tasks = state.queue.tasks_matching(symbol.as_deref(), tf_minutes).await;
    Ok(Json(json!({"ok": true, "tasks": tasks})))
}

#[derive(Debug, Deserialize)]
pub struct TaskIdQuery {
    pub id: u64,
}

pub async fn symbol_task(
    State(state): State<AppState>,
    Query(q): Query<TaskIdQuery>,
) -> AppResult<Json<serde_json::Value>> {
    let task = state
        .queue
        .task(q.id)
        .await
        .ok_or_else(|| AppError::InvalidInput(format!("unknown task id {}", q.id)))?;
    Ok(Json(json!({"ok": true, "task": task})))
}

pub async fn symbol_metrics(State(state): State<AppState>) -> Json<serde_json::Value> {
    let metrics = state.queue.metrics().await;
    Json(serde_json::to_value(&metrics).unwrap())
}

#[derive(Debug, Deserialize)]
pub struct PrepareTrainQuery {
    pub symbol: String,
    pub months: Option<i64>,
    pub interval: Option<String>,
    pub tp: Option<f64>,
    pub sl: Option<f64>,
    pub ma: Option<i64>,
    pub episodes: Option<u32>,
}

pub async fn prepare_train(
    State(state): State<AppState>,
    Query(q): Query<PrepareTrainQuery>,
) -> Json<serde_json::Value> {
    let symbol = normalize(&q.symbol);
    let base_tf_minutes = q.interval.as_deref().and_then(canonical_minutes);
    let model_state = state.model_state(&symbol, base_tf_minutes.unwrap_or(15)).await;

    let params = PrepareTrainParams {
        months: q.months,
        base_tf_minutes,
        tp: q.tp,
        sl: q.sl,
        ma_len: q.ma,
        episodes: q.episodes,
    };

    let result = pipeline::prepare_train(&state.config, &model_state, &*state.exchange, &q.symbol, params).await;
    Json(json!({
        "ok": result.ok,
        "requested": q.symbol,
        "normalized": result.symbol,
        "steps": result.steps,
    }))
}
