// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::context::ToolContext;
use crate::tool::{Tool, ToolAnnotations, ToolResult};

/// Read a text file, optionally windowed by 1-based line offset and limit.
///
/// Every successful read is recorded in the agent's file-read ledger; write
/// tools require this before they will mutate an existing file.
pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file. Use offset/limit to read a window of a large file."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file, absolute or relative to the working directory"
                },
                "offset": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "1-based line number to start reading from"
                },
                "limit": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Maximum number of lines to return"
                }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    fn annotations(&self) -> ToolAnnotations {
        ToolAnnotations {
            read_only: true,
            idempotent: true,
            ..ToolAnnotations::default()
        }
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult {
        let path = ctx.resolve_path(args["path"].as_str().unwrap_or(""));
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) => return ToolResult::error(format!("read error: {}: {e}", path.display())),
        };

        ctx.agent.mark_file_read(&path);

        let total_lines = content.lines().count();
        let offset = args["offset"].as_u64().map(|o| o as usize);
        let limit = args["limit"].as_u64().map(|l| l as usize);
        let body = match (offset, limit) {
            (None, None) => content,
            (o, l) => {
                let start = o.unwrap_or(1).saturating_sub(1);
                let take = l.unwrap_or(usize::MAX);
                content
                    .lines()
                    .skip(start)
                    .take(take)
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        };
        ToolResult::ok(body).with_metadata(json!({ "total_lines": total_lines }))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
