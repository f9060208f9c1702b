use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use anima_core::AnimaError;

/// Wire error: `{kind, message, details?}` with a status derived from the
/// engine error taxonomy.
pub struct ApiError(pub AnimaError);

impl From<AnimaError> for ApiError {
    fn from(e: AnimaError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = match kind {
            "not_authorized" => StatusCode::FORBIDDEN,
            "not_found" => StatusCode::NOT_FOUND,
            "validation_error" | "unsupported_format" | "parse_failure" => StatusCode::BAD_REQUEST,
            "embedding_failure" => StatusCode::BAD_GATEWAY,
            "index_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
            "model_timeout" | "tool_timeout" => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(kind = kind, error = %self.0, "Request failed");
        } else {
            tracing::debug!(kind = kind, error = %self.0, "Request rejected");
        }

        let body = Json(json!({
            "kind": kind,
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}
