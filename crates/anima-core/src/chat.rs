//! Persona-voice chat: the same retrieval tools as analysis, a different
//! system prompt, incremental `token` frames, and a terminal `complete`.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::agent::prompt::build_chat_system_prompt;
use crate::agent::tools::ToolRegistry;
use crate::error::AnimaError;
use crate::frames::ChatFrame;
use crate::llm::{ChatMessage, ChatStreamEvent, GenerationOptions, LlmClient, ToolCall};
use crate::types::Persona;

/// One client-held conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: HistoryRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HistoryRole {
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub message: String,
    pub history: Vec<HistoryMessage>,
}

#[derive(Debug, Clone)]
pub struct ChatRuntimeConfig {
    pub iteration_cap: usize,
    pub tool_timeout: Duration,
}

async fn send(tx: &mpsc::Sender<ChatFrame>, frame: ChatFrame) -> bool {
    tx.send(frame).await.is_ok()
}

/// Run one chat turn to exactly one terminal frame (unless canceled).
pub async fn run_chat(
    llm: &dyn LlmClient,
    options: &GenerationOptions,
    tools: &ToolRegistry,
    persona: &Persona,
    turn: ChatTurn,
    config: &ChatRuntimeConfig,
    tx: mpsc::Sender<ChatFrame>,
) {
    if turn.message.trim().is_empty() {
        send(
            &tx,
            ChatFrame::Error {
                message: "empty message".into(),
                kind: "validation_error".into(),
            },
        )
        .await;
        return;
    }

    let corpus_available = persona.chunk_count > 0 && !tools.is_empty();
    let mut messages = vec![ChatMessage::system(build_chat_system_prompt(
        persona,
        corpus_available,
    ))];
    for past in &turn.history {
        messages.push(match past.role {
            HistoryRole::User => ChatMessage::user(past.content.clone()),
            HistoryRole::Assistant => ChatMessage::assistant(past.content.clone()),
        });
    }
    messages.push(ChatMessage::user(turn.message.clone()));

    let mut response_acc = String::new();

    for iteration in 1..=config.iteration_cap {
        let schemas = if corpus_available && iteration < config.iteration_cap {
            tools.schemas()
        } else {
            Vec::new()
        };

        let mut rx = match llm.chat_stream(&messages, &schemas, options).await {
            Ok(rx) => rx,
            Err(e) => {
                send(
                    &tx,
                    ChatFrame::Error {
                        message: e.to_string(),
                        kind: e.kind().to_string(),
                    },
                )
                .await;
                return;
            }
        };

        let mut turn_text = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();

        while let Some(event) = rx.recv().await {
            match event {
                ChatStreamEvent::ContentDelta(delta) => {
                    turn_text.push_str(&delta);
                    if !send(&tx, ChatFrame::Token { content: delta }).await {
                        return;
                    }
                }
                ChatStreamEvent::ToolCallComplete(call) => tool_calls.push(call),
                ChatStreamEvent::Done => break,
            }
        }

        if tool_calls.is_empty() {
            response_acc.push_str(&turn_text);
            send(
                &tx,
                ChatFrame::Complete {
                    response: response_acc,
                },
            )
            .await;
            return;
        }

        // The model wants corpus context before answering.
        messages.push(ChatMessage::assistant_tool_calls(tool_calls.clone()));
        for call in &tool_calls {
            let arguments: serde_json::Value =
                serde_json::from_str(&call.arguments).unwrap_or(json!({}));
            let result = match tools.get(&call.name) {
                None => json!({"error": format!("unknown tool: {}", call.name)}).to_string(),
                Some(tool) => {
                    match tokio::time::timeout(config.tool_timeout, tool.execute(arguments)).await {
                        Ok(Ok(outcome)) => {
                            if !send(
                                &tx,
                                ChatFrame::Status {
                                    message: outcome.summary.clone(),
                                    tool: Some(call.name.clone()),
                                },
                            )
                            .await
                            {
                                return;
                            }
                            outcome.payload.to_string()
                        }
                        Ok(Err(e)) => {
                            if !send(
                                &tx,
                                ChatFrame::Status {
                                    message: format!("{} failed: {}", call.name, e),
                                    tool: Some(call.name.clone()),
                                },
                            )
                            .await
                            {
                                return;
                            }
                            json!({"error": format!("{}: {}", e.kind(), e)}).to_string()
                        }
                        Err(_) => json!({"error": "timeout"}).to_string(),
                    }
                }
            };
            messages.push(ChatMessage::tool_result(&call.id, &call.name, result));
        }
    }

    let error = AnimaError::IterationCap("chat did not converge".into());
    send(
        &tx,
        ChatFrame::Error {
            message: error.to_string(),
            kind: error.kind().to_string(),
        },
    )
    .await;
}
