use axum::extract::{Multipart, Path, State};
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use anima_core::ingest::UploadedFile;
use anima_core::AnimaError;

use crate::error::ApiError;
use crate::state::AppState;

/// POST /api/personas/{persona_id}/documents
///
/// Multipart corpus upload: a `user_id` text field plus one part per file.
pub async fn upload_documents(
    State(state): State<Arc<AppState>>,
    Path(persona_id): Path<Uuid>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let mut user_id: Option<String> = None;
    let mut files: Vec<UploadedFile> = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        ApiError(AnimaError::ValidationError(format!(
            "malformed multipart payload: {}",
            e
        )))
    })? {
        let name = field.name().unwrap_or_default().to_string();

        if name == "user_id" {
            let value = field.text().await.map_err(|e| {
                ApiError(AnimaError::ValidationError(format!(
                    "unreadable user_id field: {}",
                    e
                )))
            })?;
            user_id = Some(value);
            continue;
        }

        let filename = match field.file_name() {
            Some(f) => f.to_string(),
            None => continue,
        };
        let mime_hint = field.content_type().map(str::to_string);
        let bytes = field.bytes().await.map_err(|e| {
            ApiError(AnimaError::ValidationError(format!(
                "unreadable file part '{}': {}",
                filename, e
            )))
        })?;

        tracing::debug!(filename = %filename, bytes = bytes.len(), "Received upload part");
        files.push(UploadedFile {
            bytes: bytes.to_vec(),
            filename,
            mime_hint,
        });
    }

    let user_id = user_id.ok_or_else(|| {
        ApiError(AnimaError::ValidationError(
            "missing user_id field in upload".into(),
        ))
    })?;

    let report = state.engine.ingest(&user_id, persona_id, files).await?;
    Ok(Json(json!(report)))
}
