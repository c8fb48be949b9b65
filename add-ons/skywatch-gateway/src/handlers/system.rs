//! Health, protocol catalog, and the SSE event stream.

use super::ApiError;
use crate::AppState;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::stream::Stream;
use futures_util::StreamExt;
use skywatch_engine::EngineEvent;
use std::convert::Infallible;
use tokio_stream::wrappers::BroadcastStream;

/// GET /api/v1/health
pub async fn health(State(state): State<AppState>) -> Response {
    Json(serde_json::json!({
        "status": "ok",
        "version": skywatch_engine::version(),
        "alerts": state.engine.store().alert_count(),
        "dispatches": state.engine.store().dispatch_count(),
        "protocols": state.engine.catalog().len(),
        "simulation": state.engine.caller().is_simulated(),
    }))
    .into_response()
}

/// GET /api/v1/protocols — read-only catalog snapshot.
pub async fn list_protocols(State(state): State<AppState>) -> Response {
    let snapshot = state.engine.catalog().snapshot();
    Json(serde_json::json!({ "protocols": &*snapshot })).into_response()
}

/// POST /api/v1/protocols/reload — re-read both catalog files; a validation
/// failure leaves the running configuration untouched.
pub async fn reload_protocols(State(state): State<AppState>) -> Result<Response, ApiError> {
    let (protocols, recipients) = state.engine.reload_catalogs()?;
    Ok(Json(serde_json::json!({
        "reloaded": true,
        "protocols": protocols,
        "recipients": recipients,
    }))
    .into_response())
}

/// GET /api/v1/events — SSE stream of engine state changes for the dashboard.
/// Slow consumers that lag behind the broadcast buffer simply miss events and
/// should re-sync from the list endpoints.
pub async fn events_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.engine.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|msg| async move {
        let event = msg.ok()?;
        let name = match &event {
            EngineEvent::AlertCreated(_) => "alert_created",
            EngineEvent::AlertUpdated(_) => "alert_updated",
            EngineEvent::DispatchUpdated(_) => "dispatch_updated",
        };
        let sse = Event::default().event(name).json_data(&event).ok()?;
        Some(Ok(sse))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
