use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use anima_core::{AnalysisRequest, FeedbackItem};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ContextBody {
    #[serde(default)]
    pub purpose: Option<String>,
    #[serde(default)]
    pub criteria: Vec<String>,
    #[serde(default)]
    pub feedback_history: Vec<FeedbackItem>,
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeBody {
    pub content: String,
    pub persona_id: Uuid,
    pub user_id: String,
    #[serde(default)]
    pub context: ContextBody,
    #[serde(default)]
    pub max_feedback_items: Option<usize>,
    #[serde(default)]
    pub model: Option<String>,
}

impl AnalyzeBody {
    fn into_request(self) -> (String, Uuid, AnalysisRequest) {
        let request = AnalysisRequest {
            content: self.content,
            purpose: self.context.purpose,
            criteria: self.context.criteria,
            feedback_history: self.context.feedback_history,
            max_feedback_items: self.max_feedback_items,
            model: self.model,
        };
        (self.user_id, self.persona_id, request)
    }
}

/// POST /api/analyze — unary: the full feedback array after completion.
pub async fn analyze(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AnalyzeBody>,
) -> Result<Json<Value>, ApiError> {
    let (user_id, persona_id, request) = body.into_request();
    let response = state.engine.analyze(&user_id, persona_id, request).await?;
    Ok(Json(json!(response)))
}

/// POST /api/analyze/stream — SSE frame stream ending in exactly one
/// terminal frame. Client disconnect drops the receiver, which the engine
/// observes as cancellation.
pub async fn analyze_stream(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AnalyzeBody>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (user_id, persona_id, request) = body.into_request();
    let (tx, rx) = mpsc::channel(32);

    let engine = state.engine.clone();
    tokio::spawn(async move {
        engine
            .analyze_stream(&user_id, persona_id, request, tx)
            .await;
    });

    let stream = ReceiverStream::new(rx).map(|frame| {
        Ok(Event::default()
            .json_data(&frame)
            .unwrap_or_else(|e| Event::default().data(format!("{{\"type\":\"error\",\"kind\":\"internal\",\"message\":\"{}\"}}", e))))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
