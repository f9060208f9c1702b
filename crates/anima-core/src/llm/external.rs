//! OpenAI-compatible chat completions client (works with OpenAI, OpenRouter,
//! Together, Ollama, and any gateway speaking the same dialect).

use anyhow::anyhow;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{
    ChatMessage, ChatResponse, ChatRole, ChatStreamEvent, GenerationOptions, LlmClient, ToolCall,
    ToolSchema,
};
use crate::config::LlmConfig;
use crate::error::AnimaError;

pub struct OpenAiCompatClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl OpenAiCompatClient {
    pub fn new(config: &LlmConfig) -> Result<Self, AnimaError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(300))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| AnimaError::Internal(anyhow!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
        })
    }

    fn build_request(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
        options: &GenerationOptions,
        stream: bool,
    ) -> Value {
        let messages: Vec<Value> = messages.iter().map(message_to_json).collect();

        let mut request = json!({
            "model": options.model,
            "messages": messages,
            "max_tokens": options.max_tokens,
            "temperature": options.temperature,
            "stream": stream,
        });

        if !tools.is_empty() {
            request["tools"] = Value::Array(
                tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect(),
            );
        }

        request
    }

    async fn send(&self, request: &Value) -> Result<reqwest::Response, AnimaError> {
        let mut builder = self.client.post(&self.endpoint).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                AnimaError::ModelTimeout(format!("request to {} timed out", self.endpoint))
            } else {
                AnimaError::Internal(anyhow!("request to {} failed: {}", self.endpoint, e))
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let preview: String = body.chars().take(300).collect();
            return Err(AnimaError::Internal(anyhow!(
                "chat API error ({}): {}",
                status,
                preview
            )));
        }

        Ok(response)
    }
}

fn message_to_json(msg: &ChatMessage) -> Value {
    match msg.role {
        ChatRole::Tool => json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id,
            "content": msg.content,
        }),
        ChatRole::Assistant if msg.tool_calls.is_some() => {
            let calls: Vec<Value> = msg
                .tool_calls
                .as_deref()
                .unwrap_or_default()
                .iter()
                .map(|tc| {
                    json!({
                        "id": tc.id,
                        "type": "function",
                        "function": { "name": tc.name, "arguments": tc.arguments },
                    })
                })
                .collect();
            json!({ "role": "assistant", "content": msg.content, "tool_calls": calls })
        }
        role => json!({
            "role": match role {
                ChatRole::System => "system",
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
                ChatRole::Tool => "tool",
            },
            "content": msg.content,
        }),
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
        options: &GenerationOptions,
    ) -> Result<ChatResponse, AnimaError> {
        let request = self.build_request(messages, tools, options, false);
        let response = self.send(&request).await?;

        let body = response
            .text()
            .await
            .map_err(|e| AnimaError::Internal(anyhow!("failed to read response body: {}", e)))?;
        let trimmed = body.trim_start();
        if trimmed.starts_with('<') {
            let preview: String = trimmed.chars().take(200).collect();
            return Err(AnimaError::Internal(anyhow!(
                "endpoint {} returned HTML instead of JSON: {}",
                self.endpoint,
                preview
            )));
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&body).map_err(|e| {
            let preview: String = body.chars().take(300).collect();
            AnimaError::Internal(anyhow!("failed to parse chat response: {}. Body: {}", e, preview))
        })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AnimaError::Internal(anyhow!("chat API returned empty choices")))?;

        if let Some(calls) = choice.message.tool_calls {
            if !calls.is_empty() {
                return Ok(ChatResponse::ToolCalls(
                    calls
                        .into_iter()
                        .map(|c| ToolCall {
                            id: c.id,
                            name: c.function.name,
                            arguments: c.function.arguments,
                        })
                        .collect(),
                ));
            }
        }

        Ok(ChatResponse::Content(choice.message.content.unwrap_or_default()))
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
        options: &GenerationOptions,
    ) -> Result<mpsc::Receiver<ChatStreamEvent>, AnimaError> {
        let request = self.build_request(messages, tools, options, true);
        let response = self.send(&request).await?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            // Streamed tool calls arrive as fragments keyed by index.
            let mut pending_calls: BTreeMap<u64, (String, String, String)> = BTreeMap::new();

            'outer: while let Some(chunk) = stream.next().await {
                let Ok(chunk) = chunk else { break };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);

                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        break 'outer;
                    }
                    let Ok(value) = serde_json::from_str::<Value>(data) else {
                        continue;
                    };
                    let delta = &value["choices"][0]["delta"];

                    if let Some(content) = delta["content"].as_str() {
                        if !content.is_empty()
                            && tx
                                .send(ChatStreamEvent::ContentDelta(content.to_string()))
                                .await
                                .is_err()
                        {
                            return;
                        }
                    }

                    if let Some(calls) = delta["tool_calls"].as_array() {
                        for call in calls {
                            let index = call["index"].as_u64().unwrap_or(0);
                            let entry = pending_calls.entry(index).or_default();
                            if let Some(id) = call["id"].as_str() {
                                entry.0 = id.to_string();
                            }
                            if let Some(name) = call["function"]["name"].as_str() {
                                entry.1.push_str(name);
                            }
                            if let Some(args) = call["function"]["arguments"].as_str() {
                                entry.2.push_str(args);
                            }
                        }
                    }
                }
            }

            for (_, (id, name, arguments)) in pending_calls {
                let call = ToolCall { id, name, arguments };
                if tx.send(ChatStreamEvent::ToolCallComplete(call)).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(ChatStreamEvent::Done).await;
        });

        Ok(rx)
    }
}
