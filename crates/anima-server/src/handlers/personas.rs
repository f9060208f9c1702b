use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use anima_core::PersonaPatch;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct OwnerQuery {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CreatePersonaBody {
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// POST /api/personas
pub async fn create_persona(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreatePersonaBody>,
) -> Result<Json<Value>, ApiError> {
    let persona =
        state
            .engine
            .create_persona(&body.user_id, &body.name, body.description, body.model)?;
    Ok(Json(json!(persona)))
}

/// GET /api/personas?user_id=
pub async fn list_personas(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OwnerQuery>,
) -> Json<Value> {
    Json(json!({ "personas": state.engine.list_personas(&query.user_id) }))
}

/// GET /api/personas/{persona_id}?user_id=
pub async fn get_persona(
    State(state): State<Arc<AppState>>,
    Path(persona_id): Path<Uuid>,
    Query(query): Query<OwnerQuery>,
) -> Result<Json<Value>, ApiError> {
    let persona = state.engine.get_persona(&query.user_id, persona_id)?;
    Ok(Json(json!(persona)))
}

#[derive(Debug, Deserialize)]
pub struct UpdatePersonaBody {
    pub user_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// PATCH /api/personas/{persona_id}
pub async fn update_persona(
    State(state): State<Arc<AppState>>,
    Path(persona_id): Path<Uuid>,
    Json(body): Json<UpdatePersonaBody>,
) -> Result<Json<Value>, ApiError> {
    let patch = PersonaPatch {
        name: body.name,
        description: body.description,
        model_id: body.model,
    };
    let persona = state.engine.update_persona(&body.user_id, persona_id, patch)?;
    Ok(Json(json!(persona)))
}

/// DELETE /api/personas/{persona_id}?user_id=
pub async fn delete_persona(
    State(state): State<Arc<AppState>>,
    Path(persona_id): Path<Uuid>,
    Query(query): Query<OwnerQuery>,
) -> Result<Json<Value>, ApiError> {
    state.engine.delete_persona(&query.user_id, persona_id).await?;
    Ok(Json(json!({ "deleted": persona_id })))
}

/// GET /api/personas/{persona_id}/status?user_id=
pub async fn corpus_status(
    State(state): State<Arc<AppState>>,
    Path(persona_id): Path<Uuid>,
    Query(query): Query<OwnerQuery>,
) -> Result<Json<Value>, ApiError> {
    let status = state.engine.corpus_status(&query.user_id, persona_id)?;
    Ok(Json(json!(status)))
}

/// GET /api/personas/{persona_id}/documents?user_id=
/// Grouped per-file chunk listing for display.
pub async fn list_documents(
    State(state): State<Arc<AppState>>,
    Path(persona_id): Path<Uuid>,
    Query(query): Query<OwnerQuery>,
) -> Result<Json<Value>, ApiError> {
    let files = state
        .engine
        .list_document_chunks(&query.user_id, persona_id)
        .await?;
    Ok(Json(json!({ "files": files })))
}

/// GET /api/models
pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "models": state.engine.list_models() }))
}
