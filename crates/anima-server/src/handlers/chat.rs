use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::stream::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use anima_core::chat::{ChatTurn, HistoryMessage};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ChatBody {
    pub message: String,
    pub persona_id: Uuid,
    pub user_id: String,
    #[serde(default)]
    pub conversation_history: Vec<HistoryMessage>,
    #[serde(default)]
    pub model: Option<String>,
}

/// POST /api/chat/stream — persona-voice chat over SSE: `status`, `token`,
/// then a terminal `complete(response)` or `error`.
pub async fn chat_stream(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ChatBody>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel(64);

    let engine = state.engine.clone();
    tokio::spawn(async move {
        let turn = ChatTurn {
            message: body.message,
            history: body.conversation_history,
        };
        engine
            .chat_stream(&body.user_id, body.persona_id, turn, body.model, tx)
            .await;
    });

    let stream = ReceiverStream::new(rx).map(|frame| {
        Ok(Event::default()
            .json_data(&frame)
            .unwrap_or_else(|e| Event::default().data(format!("{{\"type\":\"error\",\"kind\":\"internal\",\"message\":\"{}\"}}", e))))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
