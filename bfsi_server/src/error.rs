use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use common::ErrorResponse;
use tokio::task::JoinError;

use crate::csv_preview::CsvPreviewError;
use crate::fraud::{FeatureInputError, ScoreError};

// Error handling
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Forbidden(String),
    NotFound(String),
    /// A capability whose artifacts failed to load at startup.
    Unavailable(String),
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unavailable(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            AppError::BadRequest(msg)
            | AppError::Forbidden(msg)
            | AppError::NotFound(msg)
            | AppError::Unavailable(msg)
            | AppError::Internal(msg) => msg,
        };

        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), "{}", message);
        } else {
            tracing::debug!(status = status.as_u16(), "{}", message);
        }

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Malformed bodies, wrong content types and schema mismatches are all client errors.
impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(format!("Invalid request body: {}", rejection.body_text()))
    }
}

impl From<JoinError> for AppError {
    fn from(err: JoinError) -> Self {
        AppError::Internal(format!("Worker task failed: {}", err))
    }
}

impl From<FeatureInputError> for AppError {
    fn from(err: FeatureInputError) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

impl From<ScoreError> for AppError {
    fn from(err: ScoreError) -> Self {
        match err {
            ScoreError::Dimension { .. } => AppError::BadRequest(err.to_string()),
            ScoreError::Model(msg) => AppError::Internal(format!("Prediction error: {}", msg)),
        }
    }
}

impl From<CsvPreviewError> for AppError {
    fn from(err: CsvPreviewError) -> Self {
        let message = err.to_string();
        match err {
            CsvPreviewError::Unavailable => AppError::Internal(message),
            CsvPreviewError::NotFound(_) => AppError::NotFound(message),
            CsvPreviewError::Parse(_) => AppError::BadRequest(message),
            CsvPreviewError::PermissionDenied(_) => AppError::Forbidden(message),
            CsvPreviewError::Io(_) => AppError::Internal(message),
        }
    }
}
