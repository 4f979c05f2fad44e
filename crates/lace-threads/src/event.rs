use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Canonical error text recorded when the user denies a tool call.
pub const DENIED_BY_USER: &str = "Tool execution denied by user";

/// The user's (or a policy's) decision on a pending tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    /// Execute this call only.
    AllowOnce,
    /// Execute this call and auto-approve future calls of the same tool
    /// within this thread.
    AllowSession,
    /// Do not execute; record an error result instead.
    Deny,
}

/// A single content item in a tool result.
///
/// Only `Text` exists today; the tagged representation leaves room for
/// richer variants (images, structured data) without a wire-format break.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolResultChunk {
    Text { text: String },
}

impl ToolResultChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Typed payload of a thread event.  This is the closed set of things that
/// can happen in a conversation; everything else in the system is derived
/// from replaying these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    UserMessage {
        text: String,
    },
    AgentMessage {
        text: String,
    },
    ToolCall {
        call_id: String,
        name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        call_id: String,
        content: Vec<ToolResultChunk>,
        is_error: bool,
    },
    ToolApprovalRequest {
        call_id: String,
    },
    ToolApprovalResponse {
        call_id: String,
        decision: ApprovalDecision,
    },
    /// Marks a boundary: events with sequence numbers in
    /// `replaced_from..=replaced_to` are logically elided from prompt
    /// construction and represented by `summary_text` instead.  The events
    /// themselves stay in the log.
    Compaction {
        summary_text: String,
        replaced_from: u64,
        replaced_to: u64,
    },
    /// Replaces the system prompt for all subsequent model requests.
    SystemPrompt {
        text: String,
    },
}

impl EventPayload {
    pub fn user_message(text: impl Into<String>) -> Self {
        Self::UserMessage { text: text.into() }
    }

    pub fn agent_message(text: impl Into<String>) -> Self {
        Self::AgentMessage { text: text.into() }
    }

    pub fn system_prompt(text: impl Into<String>) -> Self {
        Self::SystemPrompt { text: text.into() }
    }

    pub fn tool_call(
        call_id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self::ToolCall {
            call_id: call_id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// A plain-text tool result.
    pub fn tool_result_text(
        call_id: impl Into<String>,
        text: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::ToolResult {
            call_id: call_id.into(),
            content: vec![ToolResultChunk::text(text)],
            is_error,
        }
    }

    /// The error result recorded when the user denies a tool call.
    pub fn denied_result(call_id: impl Into<String>) -> Self {
        Self::tool_result_text(call_id, DENIED_BY_USER, true)
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::UserMessage { .. } => EventKind::UserMessage,
            Self::AgentMessage { .. } => EventKind::AgentMessage,
            Self::ToolCall { .. } => EventKind::ToolCall,
            Self::ToolResult { .. } => EventKind::ToolResult,
            Self::ToolApprovalRequest { .. } => EventKind::ToolApprovalRequest,
            Self::ToolApprovalResponse { .. } => EventKind::ToolApprovalResponse,
            Self::Compaction { .. } => EventKind::Compaction,
            Self::SystemPrompt { .. } => EventKind::SystemPrompt,
        }
    }

    /// The tool call this event refers to, when it refers to one.
    pub fn call_id(&self) -> Option<&str> {
        match self {
            Self::ToolCall { call_id, .. }
            | Self::ToolResult { call_id, .. }
            | Self::ToolApprovalRequest { call_id }
            | Self::ToolApprovalResponse { call_id, .. } => Some(call_id),
            _ => None,
        }
    }
}

/// Discriminant of an [`EventPayload`], used for store queries and the
/// uniqueness constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    UserMessage,
    AgentMessage,
    ToolCall,
    ToolResult,
    ToolApprovalRequest,
    ToolApprovalResponse,
    Compaction,
    SystemPrompt,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserMessage => "user_message",
            Self::AgentMessage => "agent_message",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::ToolApprovalRequest => "tool_approval_request",
            Self::ToolApprovalResponse => "tool_approval_response",
            Self::Compaction => "compaction",
            Self::SystemPrompt => "system_prompt",
        }
    }
}

/// An immutable record in a thread's event log.
///
/// Ordering within a thread is defined by `seq` (insertion order), never by
/// wall-clock time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadEvent {
    pub event_id: String,
    pub thread_id: String,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
