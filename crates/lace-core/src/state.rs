// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::fmt;

/// Exclusive states of the per-conversation agent state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// Ready for input; the message queue drains in this state.
    Idle,
    /// A model request is in flight, no deltas received yet.
    Thinking,
    /// Consuming streamed deltas.
    Streaming,
    /// A tool batch is executing (possibly waiting on approvals).
    ToolExecution,
    /// Summarizing history to fit the token budget.
    Compacting,
    /// Terminal; no further input is processed.
    Stopped,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Thinking => "thinking",
            Self::Streaming => "streaming",
            Self::ToolExecution => "tool_execution",
            Self::Compacting => "compacting",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}
