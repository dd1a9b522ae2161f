use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

use crate::app::AppState;

/// GET /health: liveness probe with per-status message counts.
pub async fn health_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.schedule.store().count_by_status() {
        Ok(counts) => Ok(Json(json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "messages": counts,
        }))),
        Err(e) => {
            warn!(error = %e, "health check could not reach the database");
            Err((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "degraded",
                    "version": env!("CARGO_PKG_VERSION"),
                    "error": e.to_string(),
                })),
            ))
        }
    }
}
