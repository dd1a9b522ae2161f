use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use herald_scheduler::SchedulerError;
use serde_json::json;
use tracing::error;

/// Scheduler error rendered as `{"error": ..., "code": ...}`.
pub struct ApiError(pub SchedulerError);

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        Self(e)
    }
}

/// Malformed JSON bodies surface as validation errors.
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(SchedulerError::Validation(format!(
            "invalid request body: {}",
            rejection.body_text()
        )))
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            SchedulerError::Validation(_) => StatusCode::BAD_REQUEST,
            SchedulerError::NotFound { .. } => StatusCode::NOT_FOUND,
            SchedulerError::Conflict { .. } => StatusCode::CONFLICT,
            SchedulerError::Database(_)
            | SchedulerError::Corrupt(_)
            | SchedulerError::Task(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            error!(error = %self.0, "schedule API request failed");
            "internal error".to_string()
        } else {
            self.0.to_string()
        };
        (
            status,
            Json(json!({"error": message, "code": self.0.code()})),
        )
            .into_response()
    }
}
