//! Scheduled message management under `/schedule/messages`.
//!
//! | Method | Path                            | Result                          |
//! |--------|---------------------------------|---------------------------------|
//! | GET    | `/schedule/messages`            | list (`?statuses=a,b&limit&offset`) |
//! | GET    | `/schedule/messages/{id}`       | one message                     |
//! | POST   | `/schedule/messages`            | 201 + created message           |
//! | PUT    | `/schedule/messages/{id}`       | updated message (pending/failed)|
//! | DELETE | `/schedule/messages/{id}`       | 204 (pending/failed)            |
//! | POST   | `/schedule/messages/{id}/run`   | resolved message or 409         |

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use herald_scheduler::{MessagePayload, RunOutcome, ScheduledMessage};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use super::error::ApiError;
use crate::app::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    /// Comma-separated status filter, e.g. `pending,failed`.
    pub statuses: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// GET /schedule/messages
pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ScheduledMessage>>, ApiError> {
    let statuses: Vec<&str> = query
        .statuses
        .as_deref()
        .map(|s| s.split(',').collect())
        .unwrap_or_default();
    let jobs = state.schedule.list(&statuses, query.limit, query.offset)?;
    Ok(Json(jobs))
}

/// GET /schedule/messages/{id}
pub async fn get_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<ScheduledMessage>, ApiError> {
    Ok(Json(state.schedule.get(id)?))
}

/// POST /schedule/messages
pub async fn create_message(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<MessagePayload>, JsonRejection>,
) -> Result<(StatusCode, Json<ScheduledMessage>), ApiError> {
    let Json(payload) = payload?;
    let job = state.schedule.create(payload)?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// PUT /schedule/messages/{id}
pub async fn update_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    payload: Result<Json<MessagePayload>, JsonRejection>,
) -> Result<Json<ScheduledMessage>, ApiError> {
    let Json(payload) = payload?;
    Ok(Json(state.schedule.update(id, payload)?))
}

/// DELETE /schedule/messages/{id}
pub async fn delete_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.schedule.delete(id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /schedule/messages/{id}/run: dispatch now, bypassing `schedule_at`.
///
/// 409 when the message was already claimed, sent or failed; nothing is sent
/// twice.
pub async fn run_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    match state.schedule.run_now(id).await? {
        RunOutcome::Resolved(job) => Ok(Json(job).into_response()),
        RunOutcome::AlreadyProcessed(job) => Ok((
            StatusCode::CONFLICT,
            Json(json!({
                "error": format!("scheduled message {} is already {}", job.id, job.status),
                "code": "ALREADY_PROCESSED",
                "message": job,
            })),
        )
            .into_response()),
    }
}
