//! HTTP handlers, grouped by resource. Engine errors map onto status codes
//! here; the engine itself never sees HTTP.

pub mod alerts;
pub mod dispatch;
pub mod system;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use skywatch_engine::EngineError;

/// Engine error wrapper with the HTTP mapping. Conflicting transitions are
/// 409, unknown resources 404, configuration gaps 422, throttling 429;
/// everything else is a 500 with the message preserved for the operator.
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::AlertNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::DispatchConflict(_) | EngineError::AlertResolved(_) => {
                StatusCode::CONFLICT
            }
            EngineError::RecipientNotConfigured(_)
            | EngineError::UnknownProtocol(_)
            | EngineError::CatalogLoad(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// 422 for malformed query parameters.
pub fn bad_param(msg: impl Into<String>) -> Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(serde_json::json!({ "error": msg.into() })),
    )
        .into_response()
}
