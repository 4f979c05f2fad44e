// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;
use tokio_util::sync::CancellationToken;

use crate::{
    CompletionRequest, ModelError, ModelInfo, ModelProvider, ProviderInfo, ResponseEvent,
    ResponseStream, Role, StopReason, Usage,
};

/// Deterministic mock provider for tests and offline runs.  Echoes the last
/// user message back as the assistant response.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl ModelProvider for MockProvider {
    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            id: "mock-model".into(),
            context_window: 128_000,
            max_output_tokens: 4096,
        }
    }

    fn provider_info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "mock".into(),
            display_name: "Mock".into(),
        }
    }

    fn is_configured(&self) -> bool {
        true
    }

    async fn create_streaming_response(
        &self,
        req: CompletionRequest,
        _cancel: CancellationToken,
    ) -> Result<ResponseStream, ModelError> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .and_then(|m| m.as_text())
            .unwrap_or("[no input]")
            .to_string();

        let events: Vec<Result<ResponseEvent, ModelError>> = vec![
            Ok(ResponseEvent::MessageStart { input_tokens: 10 }),
            Ok(ResponseEvent::ContentText(format!("MOCK: {reply}"))),
            Ok(ResponseEvent::MessageEnd {
                usage: Usage::new(10, 10),
                stop_reason: StopReason::EndTurn,
            }),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// A pre-scripted mock provider.  Each call to `create_streaming_response`
/// pops the next response script from the front of the queue, so tests can
/// specify exact event sequences — including tool calls — without network
/// access.
pub struct ScriptedMockProvider {
    scripts: Arc<Mutex<Vec<Vec<ResponseEvent>>>>,
    context_window: u32,
    /// Number of completed `create_streaming_response` calls.
    pub calls: Arc<Mutex<u32>>,
    /// The last [`CompletionRequest`] seen by this provider.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
}

impl ScriptedMockProvider {
    /// Build a provider from a list of response scripts.  The outer `Vec` is
    /// the ordered list of calls; the inner `Vec` is the event sequence
    /// emitted for that call.
    pub fn new(scripts: Vec<Vec<ResponseEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            context_window: 128_000,
            calls: Arc::new(Mutex::new(0)),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Declare a custom context window (for token-budget tests).
    pub fn with_context_window(mut self, context_window: u32) -> Self {
        self.context_window = context_window;
        self
    }

    /// Convenience: provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![Self::text_script(reply)])
    }

    /// One script: a text reply with default usage.
    pub fn text_script(reply: impl Into<String>) -> Vec<ResponseEvent> {
        vec![
            ResponseEvent::MessageStart { input_tokens: 5 },
            ResponseEvent::ContentText(reply.into()),
            ResponseEvent::MessageEnd {
                usage: Usage::new(5, 5),
                stop_reason: StopReason::EndTurn,
            },
        ]
    }

    /// One script: the model requests `calls` (id, name, json-args) tool
    /// invocations, streamed the way real providers do (start → input deltas
    /// → complete).
    pub fn tool_call_script(calls: &[(&str, &str, &str)]) -> Vec<ResponseEvent> {
        let mut events = vec![ResponseEvent::MessageStart { input_tokens: 5 }];
        for (id, name, args) in calls {
            events.push(ResponseEvent::ToolCallStart {
                id: (*id).into(),
                name: (*name).into(),
            });
            events.push(ResponseEvent::ToolCallInputDelta {
                id: (*id).into(),
                partial_json: (*args).into(),
            });
            events.push(ResponseEvent::ToolCallComplete {
                id: (*id).into(),
                name: (*name).into(),
                input: serde_json::from_str(args).unwrap_or(serde_json::json!({})),
            });
        }
        events.push(ResponseEvent::MessageEnd {
            usage: Usage::new(5, 5),
            stop_reason: StopReason::ToolUse,
        });
        events
    }

    /// Convenience: a tool call on round one, then a text reply.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        let id = tool_id.into();
        let name = tool_name.into();
        let args = args_json.into();
        Self::new(vec![
            Self::tool_call_script(&[(id.as_str(), name.as_str(), args.as_str())]),
            Self::text_script(final_text),
        ])
    }
}

#[async_trait]
impl ModelProvider for ScriptedMockProvider {
    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            id: "scripted-mock-model".into(),
            context_window: self.context_window,
            max_output_tokens: 4096,
        }
    }

    fn provider_info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "scripted-mock".into(),
            display_name: "Scripted mock".into(),
        }
    }

    fn is_configured(&self) -> bool {
        true
    }

    async fn create_streaming_response(
        &self,
        req: CompletionRequest,
        _cancel: CancellationToken,
    ) -> Result<ResponseStream, ModelError> {
        *self.last_request.lock().unwrap() = Some(req);
        *self.calls.lock().unwrap() += 1;
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed
                Self::text_script("[no more scripts]")
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<Result<ResponseEvent, ModelError>> =
            events.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
