// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

/// Session/project context rendered into the system prompt.  Re-rendered on
/// every turn so context changes (project notes, working directory) are
/// picked up without restarting the conversation.
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    pub working_directory: PathBuf,
    /// Contents of the project context file, when one exists.
    pub project_context: Option<String>,
    /// Extra instructions appended after the built-in prompt.
    pub append: Option<String>,
}

/// Render the system prompt for the next model request.
///
/// `override_text` replaces the built-in prompt entirely; `append` is added
/// in both cases.
pub fn system_prompt(ctx: &PromptContext, override_text: Option<&str>) -> String {
    let mut out = String::new();

    match override_text {
        Some(text) => out.push_str(text.trim_end()),
        None => {
            out.push_str(
                "You are lace, an interactive AI coding assistant. You help the user read, \
                 understand, and modify their codebase.\n\
                 \n\
                 Guidelines:\n\
                 - Use the provided tools to inspect files before changing them; edits to a \
                 file you have not read will be rejected.\n\
                 - Prefer small, verifiable changes over sweeping rewrites.\n\
                 - When a tool fails, read the error and adjust rather than repeating the \
                 same call.\n\
                 - Answer directly and concisely when no tool use is needed.",
            );
            out.push_str("\n\n## Environment\n");
            out.push_str(&format!(
                "Working directory: {}\n",
                ctx.working_directory.display()
            ));
            out.push_str(&format!("Date: {}\n", chrono::Utc::now().format("%Y-%m-%d")));
            if let Some(project) = &ctx.project_context {
                if !project.trim().is_empty() {
                    out.push_str("\n## Project context\n");
                    out.push_str(project.trim());
                    out.push('\n');
                }
            }
        }
    }

    if let Some(append) = &ctx.append {
        if !append.trim().is_empty() {
            out.push_str("\n\n");
            out.push_str(append.trim());
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
