// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::context::ToolContext;
use crate::tool::{Tool, ToolAnnotations, ToolResult};

/// Replace an exact text span in an existing file.
///
/// Refuses to touch a file the agent has not read in this thread: editing
/// blind is how stale context corrupts files.  `old_text` must match exactly
/// once unless `replace_all` is set.
pub struct EditFileTool;

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Replace old_text with new_text in a file. The file must have been read first; \
         old_text must match exactly once unless replace_all is true."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file to edit"
                },
                "old_text": {
                    "type": "string",
                    "description": "Exact text to replace"
                },
                "new_text": {
                    "type": "string",
                    "description": "Replacement text"
                },
                "replace_all": {
                    "type": "boolean",
                    "description": "Replace every occurrence instead of requiring a unique match"
                }
            },
            "required": ["path", "old_text", "new_text"],
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
        let old_text = args["old_text"].as_str().unwrap_or("");
        let new_text = args["new_text"].as_str().unwrap_or("");
        let replace_all = args["replace_all"].as_bool().unwrap_or(false);

        if old_text.is_empty() {
            return ToolResult::error("old_text must not be empty");
        }
        if !path.exists() {
            return ToolResult::error(format!("file not found: {}", path.display()));
        }
        if !ctx.agent.has_file_been_read(&path) {
            return ToolResult::error(format!(
                "{} hasn't been read in this conversation yet. Use read_file first so the \
                 edit applies to the file's current contents.",
                path.display()
            ));
        }

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) => return ToolResult::error(format!("read error: {}: {e}", path.display())),
        };

        let occurrences = content.matches(old_text).count();
        if occurrences == 0 {
            return ToolResult::error(
                "old_text not found in the file. Re-read the file and retry with the exact \
                 current text.",
            );
        }
        if occurrences > 1 && !replace_all {
            return ToolResult::error(format!(
                "old_text matches {occurrences} times; provide more surrounding context to \
                 make it unique, or set replace_all"
            ));
        }

        let updated = if replace_all {
            content.replace(old_text, new_text)
        } else {
            content.replacen(old_text, new_text, 1)
        };
        if let Err(e) = tokio::fs::write(&path, &updated).await {
            return ToolResult::error(format!("write error: {}: {e}", path.display()));
        }

        // The agent now knows the post-edit contents.
        ctx.agent.mark_file_read(&path);

        let replaced = if replace_all { occurrences } else { 1 };
        ToolResult::ok(format!(
            "replaced {replaced} occurrence(s) in {}",
            path.display()
        ))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
