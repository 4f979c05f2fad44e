use serde::{Deserialize, Serialize};

// ─── Message types ────────────────────────────────────────────────────────────

/// A single message in the provider-facing conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn tool_call(
        call_id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::ToolCall {
                call_id: call_id.into(),
                name: name.into(),
                arguments,
            },
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::ToolResult {
                call_id: call_id.into(),
                content: content.into(),
                is_error,
            },
        }
    }

    /// Return the plain text of this message, if it is a text message.
    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(t) => Some(t),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// The content of a message.
///
/// - `Text` – plain text (most messages)
/// - `ToolCall` – the assistant requests a tool invocation
/// - `ToolResult` – the outcome of a tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    ToolCall {
        call_id: String,
        name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        call_id: String,
        content: String,
        is_error: bool,
    },
}

/// A tool descriptor provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the input object
    pub input_schema: serde_json::Value,
}

/// Request sent to a model provider.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
}

// ─── Streaming deltas ─────────────────────────────────────────────────────────

/// A single streamed delta from the model.
///
/// Consumers must tolerate partial tool-call JSON across
/// [`ResponseEvent::ToolCallInputDelta`] items and assemble complete inputs
/// only on [`ResponseEvent::ToolCallComplete`].
#[derive(Debug, Clone)]
pub enum ResponseEvent {
    /// The stream opened; carries the prompt token count when known early.
    MessageStart { input_tokens: u32 },
    /// A visible text delta.
    ContentText(String),
    /// A thinking/reasoning delta (extended thinking API).
    ThinkingText(String),
    /// The model started emitting a tool call.
    ToolCallStart { id: String, name: String },
    /// A fragment of the tool call's JSON input.
    ToolCallInputDelta { id: String, partial_json: String },
    /// The tool call's input is complete and parsed.
    ToolCallComplete {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// The stream finished; final usage and stop reason.
    MessageEnd { usage: Usage, stop_reason: StopReason },
}

impl ResponseEvent {
    /// Whether this delta counts as "the response has started emitting".
    /// Once one of these is observed, the request can no longer be retried.
    pub fn is_content(&self) -> bool {
        !matches!(self, Self::MessageStart { .. })
    }
}

/// Token usage reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    /// Tokens written into the provider's prompt cache.
    #[serde(default)]
    pub cache_creation_tokens: u32,
    /// Tokens served from the provider's prompt cache.
    #[serde(default)]
    pub cache_read_tokens: u32,
}

impl Usage {
    pub fn new(prompt: u32, completion: u32) -> Self {
        Self {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[default]
    EndTurn,
    ToolUse,
    MaxTokens,
}

/// A fully assembled tool call from a model response.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// A collected (non-streaming) model response.
#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub content: String,
    pub thinking: String,
    pub tool_calls: Vec<CompletedToolCall>,
    pub usage: Usage,
    pub stop_reason: StopReason,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
