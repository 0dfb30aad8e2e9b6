//! Typed error taxonomy shared by every component.
//!
//! Each kind maps to exactly one HTTP status + `error` code at the API
//! boundary (`api::error_response`). No exception-style `catch`/`unwrap`
//! is used to cross a component boundary; callers match on `AppError`.

use axum::{http::StatusCode, response::IntoResponse, response::Json, response::Response};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not enough data: {0}")]
    NotEnoughData(String),

    #[error("bad candle shape: {0}")]
    BadShape(String),

    #[error("no policy in model")]
    NoPolicyInModel,

    #[error("model invalid: {0}")]
    ModelInvalid(String),

    #[error("feature dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("features empty")]
    FeaturesEmpty,

    #[error("scoring failed: {0}")]
    ScoringFailed(String),

    #[error("training already in progress")]
    TrainingBusy,

    #[error("upstream exchange error: {0}")]
    UpstreamTransient(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("{op} exception: {what}")]
    Internal { op: String, what: String },
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::InvalidInput(_) => "invalid_input",
            AppError::NotEnoughData(_) => "not_enough_data",
            AppError::BadShape(_) => "bad_shape",
            AppError::NoPolicyInModel => "no_policy_in_model",
            AppError::ModelInvalid(_) => "model_invalid",
            AppError::DimensionMismatch { .. } => "policy_scoring_failed",
            AppError::FeaturesEmpty => "features_empty",
            AppError::ScoringFailed(_) => "policy_scoring_failed",
            AppError::TrainingBusy => "training_busy",
            AppError::UpstreamTransient(_) => "upstream_error",
            AppError::Io(_) => "io_error",
            AppError::Internal { .. } => "internal_exception",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidInput(_) | AppError::NotEnoughData(_) | AppError::BadShape(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::NoPolicyInModel
            | AppError::ModelInvalid(_)
            | AppError::DimensionMismatch { .. }
            | AppError::FeaturesEmpty
            | AppError::ScoringFailed(_)
            | AppError::Io(_)
            | AppError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::TrainingBusy => StatusCode::CONFLICT,
            AppError::UpstreamTransient(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({
            "ok": false,
            "error": self.code(),
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
