// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::context::ToolContext;
use crate::tool::{Tool, ToolAnnotations, ToolResult};

/// Write a file whole.  Creating a new file needs no prior read; overwriting
/// an existing one is subject to the same read-before-write check as
/// `edit_file`.
pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Create a file or overwrite an existing one with the given content. \
         Overwriting requires the file to have been read first."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path of the file to write"
                },
                "content": {
                    "type": "string",
                    "description": "Full file content"
                }
            },
            "required": ["path", "content"],
            "additionalProperties": false
        })
    }

    fn annotations(&self) -> ToolAnnotations {
        ToolAnnotations {
            destructive: true,
            ..ToolAnnotations::default()
        }
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult {
        let path = ctx.resolve_path(args["path"].as_str().unwrap_or(""));
        let content = args["content"].as_str().unwrap_or("");

        if path.exists() && !ctx.agent.has_file_been_read(&path) {
            return ToolResult::error(format!(
                "{} exists and hasn't been read in this conversation yet. Use read_file \
                 first, or pick a new path.",
                path.display()
            ));
        }

        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ToolResult::error(format!(
                    "cannot create {}: {e}",
                    parent.display()
                ));
            }
        }
        if let Err(e) = tokio::fs::write(&path, content).await {
            return ToolResult::error(format!("write error: {}: {e}", path.display()));
        }
        ctx.agent.mark_file_read(&path);
        ToolResult::ok(format!("wrote {} bytes to {}", content.len(), path.display()))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
