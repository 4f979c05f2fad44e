// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use anyhow::{bail, Context};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use lace_model::{CompletionRequest, Message, ModelProvider};
use lace_threads::{EventKind, EventPayload, ThreadEvent, ThreadManager, ToolResultChunk};

/// Default summarization prompt for the compaction pass.  Overridable via
/// `agent.compaction_prompt` in the config.
pub const SUMMARIZE_PROMPT: &str =
    "You are a context compaction assistant. Summarise the following conversation history \
     in a concise, information-dense way. Preserve all technical details, decisions, file \
     names, code snippets, and tool outputs that may be relevant to future work. \
     The summary will replace the original history to free up context space.";

#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    pub event: ThreadEvent,
    pub events_summarized: u64,
}

/// Summarize everything except the trailing `keep_recent` events and append
/// a `COMPACTION` event covering the summarized range.
///
/// The replaced events stay in the log; prompt construction substitutes the
/// summary from here on.  The cut point is moved earlier when it would split
/// a tool-call/result group, so the preserved tail never starts with an
/// orphaned result.
pub async fn compact_thread(
    threads: &ThreadManager,
    provider: Arc<dyn ModelProvider>,
    thread_id: &str,
    keep_recent: usize,
    prompt_override: Option<&str>,
    cancel: CancellationToken,
) -> anyhow::Result<CompactionOutcome> {
    let events = threads.events(thread_id)?;

    // Everything the prompt builder would show the model is compactable;
    // system prompts survive on their own and approval traffic never reaches
    // the model anyway.
    let already_replaced: Vec<(u64, u64)> = events
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
    let elided =
        |seq: u64| already_replaced.iter().any(|(from, to)| (*from..=*to).contains(&seq));

    let candidates: Vec<&ThreadEvent> = events
        .iter()
        .filter(|e| !elided(e.seq))
        .filter(|e| e.payload.kind() != EventKind::SystemPrompt)
        .collect();

    if candidates.len() <= keep_recent {
        bail!("nothing to compact: {} events, keeping {keep_recent}", candidates.len());
    }

    let mut cut = candidates.len() - keep_recent;
    // Never let the preserved tail start inside a tool interaction group.
    while cut > 0 && cut < candidates.len() {
        match candidates[cut].payload.kind() {
            EventKind::ToolResult | EventKind::ToolCall => cut -= 1,
            _ => break,
        }
    }
    if cut == 0 {
        bail!("cut point collapsed to zero; history too entangled to compact");
    }

    let to_summarize = &candidates[..cut];
    let replaced_from = to_summarize[0].seq;
    let replaced_to = to_summarize[cut - 1].seq;

    let transcript = serialize_events(to_summarize);
    let prompt = prompt_override.unwrap_or(SUMMARIZE_PROMPT);
    let req = CompletionRequest {
        messages: vec![Message::user(format!("{prompt}\n\n---\n\n{transcript}"))],
        tools: vec![],
    };

    let response = provider
        .create_response(req, cancel)
        .await
        .context("compaction summarization call failed")?;
    let summary = response.content.trim().to_string();
    if summary.is_empty() {
        bail!("compaction model returned an empty summary");
    }

    debug!(
        thread_id,
        replaced_from,
        replaced_to,
        summary_len = summary.len(),
        "appending compaction event"
    );
    let event = threads
        .append(
            thread_id,
            EventPayload::Compaction {
                summary_text: summary,
                replaced_from,
                replaced_to,
            },
        )
        .await?;
    // Lineage pointer: the pre-compaction history is still in the log but no
    // longer feeds prompts.
    threads.set_metadata_key(
        thread_id,
        "compacted_through_seq",
        serde_json::json!(replaced_to),
    )?;

    Ok(CompactionOutcome {
        event,
        events_summarized: cut as u64,
    })
}

/// Serialize events into plain text for the summarization prompt.
fn serialize_events(events: &[&ThreadEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::UserMessage { text } => Some(format!("User: {text}")),
            EventPayload::AgentMessage { text } => Some(format!("Assistant: {text}")),
            EventPayload::ToolCall {
                name, arguments, ..
            } => Some(format!("Assistant: [tool_call: {name}({arguments})]")),
            EventPayload::ToolResult {
                content, is_error, ..
            } => {
                let text = content
                    .iter()
                    .map(|c| match c {
                        ToolResultChunk::Text { text } => text.as_str(),
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                let tag = if *is_error { "tool_error" } else { "tool_result" };
                Some(format!("Tool: [{tag}: {text}]"))
            }
            EventPayload::Compaction { summary_text, .. } => {
                Some(format!("Assistant: [earlier summary: {summary_text}]"))
            }
            EventPayload::ToolApprovalRequest { .. }
            | EventPayload::ToolApprovalResponse { .. }
            | EventPayload::SystemPrompt { .. } => None,
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
