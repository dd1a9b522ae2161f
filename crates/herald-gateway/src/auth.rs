use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;

use crate::app::AppState;

/// Reject `/schedule/*` requests without the configured bearer token.
///
/// With no `gateway.auth.token` configured every request passes.
pub async fn require_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    req: Request,
    next: Next,
) -> Response {
    if check_auth(&state, &headers) {
        return next.run(req).await;
    }
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": "Unauthorized. Set 'Authorization: Bearer <your-token>' header.",
            "code": "AUTH_FAILED",
        })),
    )
        .into_response()
}

/// Returns true if the request is authorised.
fn check_auth(state: &AppState, headers: &HeaderMap) -> bool {
    match &state.config.gateway.auth.token {
        None => true,
        Some(expected) => extract_bearer(headers)
            .map(|t| t == expected)
            .unwrap_or(false),
    }
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}
