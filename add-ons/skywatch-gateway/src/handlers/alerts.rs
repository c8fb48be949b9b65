//! Transcript ingestion and alert lifecycle endpoints.

use super::{bad_param, ApiError};
use crate::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use skywatch_engine::{AlertStatus, TranscriptInput};

const DEFAULT_LIST_LIMIT: usize = 50;

/// POST /api/v1/transcripts — classify a transcript; 201 with the outcome
/// when an alert was created, 200 with the classification alone otherwise.
pub async fn ingest_transcript(
    State(state): State<AppState>,
    Json(input): Json<TranscriptInput>,
) -> Result<Response, ApiError> {
    let outcome = state.engine.ingest(input).await?;
    let status = if outcome.alert.is_some() {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome)).into_response())
}

#[derive(Deserialize)]
pub struct AlertsQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

/// GET /api/v1/alerts — most recent alerts, newest first.
pub async fn list_alerts(
    State(state): State<AppState>,
    Query(query): Query<AlertsQuery>,
) -> Result<Response, ApiError> {
    let status = match query.status.as_deref() {
        Some(raw) => match AlertStatus::parse(raw) {
            Some(s) => Some(s),
            None => return Ok(bad_param(format!("unknown alert status '{}'", raw))),
        },
        None => None,
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(500);
    let alerts = state.engine.store().list_recent_alerts(limit, status)?;
    let count = alerts.len();
    Ok(Json(serde_json::json!({ "alerts": alerts, "count": count })).into_response())
}

/// GET /api/v1/alerts/:id — one alert plus its full dispatch history.
pub async fn get_alert(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let alert = state
        .engine
        .store()
        .get_alert(&id)?
        .ok_or_else(|| skywatch_engine::EngineError::AlertNotFound(id.clone()))?;
    let dispatches = state.engine.store().dispatches_for_alert(&id)?;
    Ok(Json(serde_json::json!({ "alert": alert, "dispatches": dispatches })).into_response())
}

/// POST /api/v1/alerts/:id/acknowledge
pub async fn acknowledge_alert(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let alert = state.engine.acknowledge(&id).await?;
    Ok(Json(alert).into_response())
}

/// POST /api/v1/alerts/:id/resolve — idempotent terminal transition.
pub async fn resolve_alert(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let alert = state.engine.resolve_alert(&id).await?;
    Ok(Json(alert).into_response())
}
