// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    registry::default_context_window, CompletionRequest, Message, MessageContent, ModelError,
    ModelInfo, ModelProvider, ProviderInfo, ResponseEvent, ResponseStream, Role, StopReason,
    Usage,
};

/// Driver for the Anthropic messages API.
pub struct AnthropicProvider {
    model: String,
    api_key: Option<String>,
    base_url: String,
    max_tokens: u32,
    context_window: u32,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(
        model: String,
        api_key: Option<String>,
        base_url: Option<String>,
        max_tokens: Option<u32>,
        context_window: Option<u32>,
    ) -> Self {
        let context_window = context_window.unwrap_or_else(|| default_context_window(&model));
        Self {
            model,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
            max_tokens: max_tokens.unwrap_or(4096),
            context_window,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            id: self.model.clone(),
            context_window: self.context_window,
            max_output_tokens: self.max_tokens,
        }
    }

    fn provider_info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "anthropic".into(),
            display_name: "Anthropic".into(),
        }
    }

    fn is_configured(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    async fn create_streaming_response(
        &self,
        req: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<ResponseStream, ModelError> {
        let key = self
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ModelError::Config("ANTHROPIC_API_KEY not set".into()))?;

        let (system_text, messages) = build_wire_messages(&req.messages);

        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": self.max_tokens,
            "stream": true,
        });
        if !system_text.is_empty() {
            body["system"] = json!(system_text);
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        let send = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send();
        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(ModelError::Aborted),
            r = send => r.map_err(ModelError::from)?,
        };

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ModelError::from_status(status.as_u16(), text));
        }

        let (tx, rx) = mpsc::channel(32);
        let mut byte_stream = resp.bytes_stream();
        tokio::spawn(async move {
            // SSE lines can be split across TCP chunks, so a remainder buffer
            // is carried forward; only complete lines are parsed.
            let mut buf = String::new();
            let mut state = SseState::default();
            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = tx.send(Err(ModelError::Aborted)).await;
                        return;
                    }
                    c = byte_stream.next() => c,
                };
                let Some(chunk) = chunk else { break };
                let bytes = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx.send(Err(ModelError::Network(e.to_string()))).await;
                        return;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim_end_matches('\r').to_string();
                    buf.drain(..=pos);
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    let Ok(v) = serde_json::from_str::<Value>(data.trim()) else {
                        continue;
                    };
                    for event in state.on_sse_event(&v) {
                        if tx.send(Ok(event)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Incremental SSE → [`ResponseEvent`] translation.
///
/// Tool-call JSON arrives as `input_json_delta` fragments keyed by content
/// block index; the assembled input is parsed and emitted as a single
/// `ToolCallComplete` on `content_block_stop`.
#[derive(Default)]
struct SseState {
    blocks: HashMap<u64, PendingBlock>,
    usage: Usage,
    stop_reason: StopReason,
}

struct PendingBlock {
    id: String,
    name: String,
    json_buf: String,
}

impl SseState {
    fn on_sse_event(&mut self, v: &Value) -> Vec<ResponseEvent> {
        match v["type"].as_str().unwrap_or("") {
            "message_start" => {
                let usage = &v["message"]["usage"];
                self.usage.prompt_tokens = usage["input_tokens"].as_u64().unwrap_or(0) as u32;
                self.usage.cache_read_tokens =
                    usage["cache_read_input_tokens"].as_u64().unwrap_or(0) as u32;
                self.usage.cache_creation_tokens =
                    usage["cache_creation_input_tokens"].as_u64().unwrap_or(0) as u32;
                vec![ResponseEvent::MessageStart {
                    input_tokens: self.usage.prompt_tokens,
                }]
            }
            "content_block_start" => {
                let index = v["index"].as_u64().unwrap_or(0);
                let block = &v["content_block"];
                if block["type"].as_str() == Some("tool_use") {
                    let id = block["id"].as_str().unwrap_or("").to_string();
                    let name = block["name"].as_str().unwrap_or("").to_string();
                    self.blocks.insert(
                        index,
                        PendingBlock {
                            id: id.clone(),
                            name: name.clone(),
                            json_buf: String::new(),
                        },
                    );
                    vec![ResponseEvent::ToolCallStart { id, name }]
                } else {
                    vec![]
                }
            }
            "content_block_delta" => {
                let index = v["index"].as_u64().unwrap_or(0);
                let delta = &v["delta"];
                match delta["type"].as_str().unwrap_or("") {
                    "text_delta" => {
                        let text = delta["text"].as_str().unwrap_or("");
                        if text.is_empty() {
                            vec![]
                        } else {
                            vec![ResponseEvent::ContentText(text.to_string())]
                        }
                    }
                    "thinking_delta" => {
                        let text = delta["thinking"].as_str().unwrap_or("");
                        if text.is_empty() {
                            vec![]
                        } else {
                            vec![ResponseEvent::ThinkingText(text.to_string())]
                        }
                    }
                    "input_json_delta" => {
                        let partial = delta["partial_json"].as_str().unwrap_or("");
                        if let Some(block) = self.blocks.get_mut(&index) {
                            block.json_buf.push_str(partial);
                            vec![ResponseEvent::ToolCallInputDelta {
                                id: block.id.clone(),
                                partial_json: partial.to_string(),
                            }]
                        } else {
                            vec![]
                        }
                    }
                    // Signature blobs and unknown delta types carry nothing
                    // the agent can use.
                    _ => vec![],
                }
            }
            "content_block_stop" => {
                let index = v["index"].as_u64().unwrap_or(0);
                let Some(block) = self.blocks.remove(&index) else {
                    return vec![];
                };
                let input = if block.json_buf.is_empty() {
                    json!({})
                } else {
                    match serde_json::from_str(&block.json_buf) {
                        Ok(val) => val,
                        Err(e) => {
                            warn!(
                                tool_name = %block.name,
                                error = %e,
                                "tool call input never became valid JSON; dropping call"
                            );
                            return vec![];
                        }
                    }
                };
                vec![ResponseEvent::ToolCallComplete {
                    id: block.id,
                    name: block.name,
                    input,
                }]
            }
            "message_delta" => {
                if let Some(r) = v["delta"]["stop_reason"].as_str() {
                    self.stop_reason = match r {
                        "tool_use" => StopReason::ToolUse,
                        "max_tokens" => StopReason::MaxTokens,
                        _ => StopReason::EndTurn,
                    };
                }
                if let Some(out) = v["usage"]["output_tokens"].as_u64() {
                    self.usage.completion_tokens = out as u32;
                }
                vec![]
            }
            "message_stop" => {
                self.usage.total_tokens = self.usage.prompt_tokens
                    + self.usage.cache_read_tokens
                    + self.usage.cache_creation_tokens
                    + self.usage.completion_tokens;
                vec![ResponseEvent::MessageEnd {
                    usage: self.usage,
                    stop_reason: self.stop_reason,
                }]
            }
            _ => vec![],
        }
    }
}

/// Convert the provider-facing message list into the Anthropic wire format.
///
/// Returns `(system_text, conversation_messages)`; the system message is a
/// top-level `system` field, not a conversation turn.
fn build_wire_messages(messages: &[Message]) -> (String, Vec<Value>) {
    let mut system_text = String::new();
    let mut out: Vec<Value> = Vec::new();

    for m in messages {
        if m.role == Role::System {
            if let Some(t) = m.as_text() {
                system_text = t.to_string();
            }
            continue;
        }
        match &m.content {
            MessageContent::Text(t) => {
                let role = if m.role == Role::Assistant {
                    "assistant"
                } else {
                    "user"
                };
                out.push(json!({ "role": role, "content": t }));
            }
            MessageContent::ToolCall {
                call_id,
                name,
                arguments,
            } => {
                let block = json!({
                    "type": "tool_use",
                    "id": call_id,
                    "name": name,
                    "input": arguments,
                });
                push_block(&mut out, "assistant", block);
            }
            MessageContent::ToolResult {
                call_id,
                content,
                is_error,
            } => {
                let block = json!({
                    "type": "tool_result",
                    "tool_use_id": call_id,
                    "content": content,
                    "is_error": is_error,
                });
                push_block(&mut out, "user", block);
            }
        }
    }
    (system_text, out)
}

/// Append a content block, merging into the previous message when it has the
/// same role and block-array content.  Parallel tool calls (and their
/// results) must share one message: the API pairs each `tool_use` with a
/// `tool_result` in the immediately following turn.
fn push_block(out: &mut Vec<Value>, role: &str, block: Value) {
    if let Some(last) = out.last_mut() {
        if last["role"] == role {
            if let Some(content) = last["content"].as_array_mut() {
                content.push(block);
                return;
            }
        }
    }
    out.push(json!({ "role": role, "content": [block] }));
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
