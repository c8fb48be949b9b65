//! Dispatch endpoints: request a call, inspect records.

use super::ApiError;
use crate::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

#[derive(Deserialize)]
pub struct DispatchRequest {
    pub alert_id: String,
    /// Optional operator override; defaults to the protocol's escalation
    /// ladder.
    #[serde(default)]
    pub recipient_role: Option<String>,
}

/// POST /api/v1/dispatch — returns 202 with the pending record; the call
/// itself proceeds in the background.
pub async fn create_dispatch(
    State(state): State<AppState>,
    Json(req): Json<DispatchRequest>,
) -> Result<Response, ApiError> {
    let record = state
        .engine
        .dispatch(&req.alert_id, req.recipient_role)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(record)).into_response())
}

#[derive(Deserialize)]
pub struct DispatchQuery {
    #[serde(default)]
    limit: Option<usize>,
}

/// GET /api/v1/dispatch — most recent records, newest first.
pub async fn list_dispatches(
    State(state): State<AppState>,
    Query(query): Query<DispatchQuery>,
) -> Result<Response, ApiError> {
    let limit = query.limit.unwrap_or(50).min(500);
    let records = state.engine.store().list_recent_dispatches(limit)?;
    let count = records.len();
    Ok(Json(serde_json::json!({ "dispatches": records, "count": count })).into_response())
}

/// GET /api/v1/dispatch/:id — one record, with live status as last persisted
/// by the call watchdog.
pub async fn get_dispatch(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    match state.engine.store().get_dispatch(&id)? {
        Some(record) => Ok(Json(record).into_response()),
        None => Ok((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("dispatch '{}' not found", id) })),
        )
            .into_response()),
    }
}
