// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use lace_threads::ToolResultChunk;

use crate::context::ToolContext;

/// Behavioural hints attached to a tool.
///
/// The approval UI and the executor use these: `read_only` tools are safe to
/// surface differently, `timeout` bounds a single execution.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolAnnotations {
    pub read_only: bool,
    pub idempotent: bool,
    pub destructive: bool,
    pub open_world: bool,
    /// Per-execution wall-clock bound; expiry yields a timeout error result.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStatus {
    Completed,
    Failed,
    Aborted,
}

/// The outcome of executing a tool.
///
/// Content is a list of typed chunks so richer variants can be added without
/// changing every call site; `text()` gives the flattened plain-text view.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub content: Vec<ToolResultChunk>,
    pub is_error: bool,
    pub metadata: Option<Value>,
    pub status: ToolStatus,
}

impl ToolResult {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolResultChunk::text(text)],
            is_error: false,
            metadata: None,
            status: ToolStatus::Completed,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolResultChunk::text(text)],
            is_error: true,
            metadata: None,
            status: ToolStatus::Failed,
        }
    }

    /// A cancelled execution; `is_error` so the model does not treat partial
    /// output as a success.
    pub fn aborted(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolResultChunk::text(text)],
            is_error: true,
            metadata: None,
            status: ToolStatus::Aborted,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Flattened plain-text content.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .map(|c| match c {
                ToolResultChunk::Text { text } => text.as_str(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Trait every tool implements.
///
/// `execute` receives arguments that already passed schema validation; it
/// must return error *results*, never panic, for anything that goes wrong at
/// runtime.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the input object.
    fn input_schema(&self) -> Value;
    fn annotations(&self) -> ToolAnnotations {
        ToolAnnotations::default()
    }
    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
