//! HTTP error mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use pilot_core::PilotError;
use serde_json::json;
use tracing::error;

/// An error rendered as a JSON response
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    /// Error with an explicit status
    #[must_use]
    pub fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
        }
    }

    /// HTTP status of the response
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<PilotError> for ApiError {
    fn from(err: PilotError) -> Self {
        let status = match &err {
            PilotError::Validation { .. } | PilotError::Compilation { .. } | PilotError::GraphIntegrity { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            PilotError::NotFound { .. } => StatusCode::NOT_FOUND,
            PilotError::LockConflict { .. } | PilotError::InvalidState { .. } => StatusCode::CONFLICT,
            PilotError::StepExecution { .. } => StatusCode::BAD_GATEWAY,
            PilotError::Persistence { .. } | PilotError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %err, "request failed");
        }
        Self::new(status, err.kind(), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "success": false,
            "error": self.kind,
            "message": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

/// Handler result
pub type ApiResult<T> = Result<T, ApiError>;
