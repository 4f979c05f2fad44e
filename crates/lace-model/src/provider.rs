// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::{
    CompletionRequest, ModelError, ModelResponse, ResponseEvent, StopReason, Usage,
};

pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<ResponseEvent, ModelError>> + Send>>;

/// Static facts about the configured model.
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub id: String,
    pub context_window: u32,
    pub max_output_tokens: u32,
}

/// Static facts about the provider instance.
#[derive(Debug, Clone)]
pub struct ProviderInfo {
    pub id: String,
    pub display_name: String,
}

/// Uniform interface over heterogeneous LLM backends.
///
/// All requests take a cancellation token; providers must abort in-flight
/// work when it fires and surface [`ModelError::Aborted`].
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn model_info(&self) -> ModelInfo;

    fn provider_info(&self) -> ProviderInfo;

    /// Whether the provider has the credentials/configuration it needs.
    fn is_configured(&self) -> bool;

    /// Send a completion request and stream typed deltas.
    async fn create_streaming_response(
        &self,
        req: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<ResponseStream, ModelError>;

    /// Send a completion request and collect the full response.
    ///
    /// The default implementation drives the streaming variant to completion.
    async fn create_response(
        &self,
        req: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<ModelResponse, ModelError> {
        let stream = self.create_streaming_response(req, cancel).await?;
        collect_response(stream).await
    }
}

impl std::fmt::Debug for dyn ModelProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let info = self.provider_info();
        f.debug_struct("dyn ModelProvider")
            .field("id", &info.id)
            .field("display_name", &info.display_name)
            .finish()
    }
}

/// Fold a delta stream into a [`ModelResponse`].
pub async fn collect_response(mut stream: ResponseStream) -> Result<ModelResponse, ModelError> {
    let mut content = String::new();
    let mut thinking = String::new();
    let mut tool_calls = Vec::new();
    let mut usage = Usage::default();
    let mut stop_reason = StopReason::EndTurn;

    while let Some(event) = stream.next().await {
        match event? {
            ResponseEvent::MessageStart { input_tokens } => {
                usage.prompt_tokens = input_tokens;
            }
            ResponseEvent::ContentText(t) => content.push_str(&t),
            ResponseEvent::ThinkingText(t) => thinking.push_str(&t),
            // Partial inputs are assembled by the provider; only the
            // completion event carries a usable value.
            ResponseEvent::ToolCallStart { .. } | ResponseEvent::ToolCallInputDelta { .. } => {}
            ResponseEvent::ToolCallComplete { id, name, input } => {
                tool_calls.push(crate::CompletedToolCall { id, name, input });
            }
            ResponseEvent::MessageEnd {
                usage: u,
                stop_reason: r,
            } => {
                usage = u;
                stop_reason = r;
            }
        }
    }

    Ok(ModelResponse {
        content,
        thinking,
        tool_calls,
        usage,
        stop_reason,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
