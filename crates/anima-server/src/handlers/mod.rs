pub mod analyze;
pub mod chat;
pub mod personas;
pub mod upload;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/api/personas",
            post(personas::create_persona).get(personas::list_personas),
        )
        .route(
            "/api/personas/{persona_id}",
            get(personas::get_persona)
                .patch(personas::update_persona)
                .delete(personas::delete_persona),
        )
        .route(
            "/api/personas/{persona_id}/documents",
            post(upload::upload_documents).get(personas::list_documents),
        )
        .route("/api/personas/{persona_id}/status", get(personas::corpus_status))
        .route("/api/models", get(personas::list_models))
        .route("/api/analyze", post(analyze::analyze))
        .route("/api/analyze/stream", post(analyze::analyze_stream))
        .route("/api/chat/stream", post(chat::chat_stream))
        .with_state(state)
}
