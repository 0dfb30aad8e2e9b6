//! HTTP control plane: one axum router wiring every endpoint onto
//! `AppState`. Route handlers stay thin — they parse the query/body,
//! call into the component modules, and shape the JSON response; the
//! actual logic lives in `backfill`, `trainer`, `infer`, `pipeline`,
//! etc.

mod handlers;
mod state;

pub use state::AppState;

use crate::middleware::request_logging_simple;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::prometheus_metrics))
        .route("/api/backfill", get(handlers::backfill))
        .route("/api/train", get(handlers::train).post(handlers::train))
        .route("/api/infer", get(handlers::infer))
        .route("/api/model", get(handlers::get_model))
        .route("/api/model/set", post(handlers::set_model))
        .route("/api/health/ai", get(handlers::health_ai))
        .route("/api/symbol/hydrate", post(handlers::hydrate))
        .route("/api/symbol/status", get(handlers::symbol_status))
        .route("/api/symbol/task", get(handlers::symbol_task))
        .route("/api/symbol/metrics", get(handlers::symbol_metrics))
        .route("/api/pipeline/prepare_train", post(handlers::prepare_train))
        .layer(axum::middleware::from_fn(request_logging_simple))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
