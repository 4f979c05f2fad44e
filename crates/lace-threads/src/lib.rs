// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod event;
mod log;
mod manager;
mod thread_id;

pub use event::{ApprovalDecision, EventKind, EventPayload, ThreadEvent, ToolResultChunk};
pub use log::{EventLog, StoreError, ThreadRecord};
pub use manager::{ResumeOutcome, ThreadManager};
pub use thread_id::{generate_thread_id, is_valid_thread_id, THREAD_ID_PREFIX};
