// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{HashMap, HashSet};

use tokio::sync::{oneshot, Mutex};
use tracing::debug;

use lace_threads::ApprovalDecision;

/// Bridges asynchronous human decisions to in-flight tool calls.
///
/// The executor registers a waiter per `call_id`; whoever appends the
/// approval-response event resolves it.  The sender is removed on
/// resolution, so each waiter resolves at most once and late responses are
/// ignored here — the event log's unique constraint already collapsed them
/// to a single stored decision.
#[derive(Default)]
pub struct ApprovalBroker {
    pending: Mutex<HashMap<String, oneshot::Sender<ApprovalDecision>>>,
    session_allowed: Mutex<HashSet<String>>,
}

impl ApprovalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `call_id`.  A previously registered waiter for
    /// the same id is replaced (its receiver resolves as cancelled).
    pub async fn register(&self, call_id: &str) -> oneshot::Receiver<ApprovalDecision> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(call_id.to_string(), tx);
        rx
    }

    /// Resolve the waiter for `call_id`, if one is still pending.  Returns
    /// whether a waiter was resolved.
    pub async fn resolve(&self, call_id: &str, decision: ApprovalDecision) -> bool {
        let waiter = self.pending.lock().await.remove(call_id);
        match waiter {
            Some(tx) => tx.send(decision).is_ok(),
            None => {
                debug!(call_id, "approval response with no pending waiter; ignored");
                false
            }
        }
    }

    /// Drop all pending waiters (turn cancellation / stop).
    pub async fn cancel_all(&self) {
        self.pending.lock().await.clear();
    }

    pub async fn is_session_allowed(&self, tool_name: &str) -> bool {
        self.session_allowed.lock().await.contains(tool_name)
    }

    /// Record a session-scoped auto-approval for `tool_name`.
    pub async fn allow_for_session(&self, tool_name: &str) {
        self.session_allowed.lock().await.insert(tool_name.to_string());
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
