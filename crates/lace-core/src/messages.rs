// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashSet;

use lace_model::Message;
use lace_threads::{EventPayload, ThreadEvent, ToolResultChunk};

/// Transform the event log into the provider-facing message list.
///
/// Deterministic: the output is a pure function of the event slice.
///
/// - The latest `SYSTEM_PROMPT` event becomes the leading system message.
/// - Events inside any `COMPACTION` range are elided; the compaction event
///   emits one synthesized summary message in their place.
/// - `TOOL_CALL`s pair with the first `TOOL_RESULT` of the same `call_id`;
///   duplicate results are collapsed to the first, calls without a result
///   (mid-turn) are not emitted.
/// - `<think>` blocks are stripped from agent messages unless the provider
///   keeps thinking (`include_thinking`).
pub fn build_messages(events: &[ThreadEvent], include_thinking: bool) -> Vec<Message> {
    let mut messages = Vec::new();

    // Latest system prompt wins, wherever it sits in the log.
    let system = events.iter().rev().find_map(|e| match &e.payload {
        EventPayload::SystemPrompt { text } => Some(text.clone()),
        _ => None,
    });
    if let Some(text) = system {
        messages.push(Message::system(text));
    }

    let replaced: Vec<(u64, u64)> = events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::Compaction {
                replaced_from,
                replaced_to,
                ..
            } => Some((*replaced_from, *replaced_to)),
            _ => None,
        })
        .collect();
    let elided = |seq: u64| replaced.iter().any(|(from, to)| (*from..=*to).contains(&seq));

    // call_ids with a surviving result: calls without one are still pending
    // and must not reach the model.
    let resolved: HashSet<&str> = events
        .iter()
        .filter(|e| !elided(e.seq))
        .filter_map(|e| match &e.payload {
            EventPayload::ToolResult { call_id, .. } => Some(call_id.as_str()),
            _ => None,
        })
        .collect();
    let called: HashSet<&str> = events
        .iter()
        .filter(|e| !elided(e.seq))
        .filter_map(|e| match &e.payload {
            EventPayload::ToolCall { call_id, .. } => Some(call_id.as_str()),
            _ => None,
        })
        .collect();

    let mut emitted_results: HashSet<&str> = HashSet::new();

    for event in events {
        if elided(event.seq) {
            continue;
        }
        match &event.payload {
            EventPayload::UserMessage { text } => messages.push(Message::user(text.clone())),
            EventPayload::AgentMessage { text } => {
                let text = if include_thinking {
                    text.clone()
                } else {
                    strip_think_blocks(text)
                };
                if !text.is_empty() {
                    messages.push(Message::assistant(text));
                }
            }
            EventPayload::ToolCall {
                call_id,
                name,
                arguments,
            } => {
                if resolved.contains(call_id.as_str()) {
                    messages.push(Message::tool_call(
                        call_id.clone(),
                        name.clone(),
                        arguments.clone(),
                    ));
                }
            }
            EventPayload::ToolResult {
                call_id,
                content,
                is_error,
            } => {
                if !called.contains(call_id.as_str()) {
                    continue;
                }
                if !emitted_results.insert(call_id.as_str()) {
                    continue;
                }
                messages.push(Message::tool_result(
                    call_id.clone(),
                    flatten_chunks(content),
                    *is_error,
                ));
            }
            EventPayload::Compaction { summary_text, .. } => {
                messages.push(Message::user(format!(
                    "[Conversation summary]\n\n{summary_text}"
                )));
            }
            // Approval traffic and system prompts never reach the model as
            // conversation turns.
            EventPayload::ToolApprovalRequest { .. }
            | EventPayload::ToolApprovalResponse { .. }
            | EventPayload::SystemPrompt { .. } => {}
        }
    }

    messages
}

fn flatten_chunks(chunks: &[ToolResultChunk]) -> String {
    chunks
        .iter()
        .map(|c| match c {
            ToolResultChunk::Text { text } => text.as_str(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Remove `<think>…</think>` spans from assistant text.  An unclosed block
/// (model cut off mid-thought) is stripped to the end.
pub fn strip_think_blocks(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<think>") {
        out.push_str(&rest[..start]);
        match rest[start..].find("</think>") {
            Some(end) => rest = &rest[start + end + "</think>".len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out.trim().to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
