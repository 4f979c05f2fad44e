// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tracing::warn;

use lace_threads::{
    ApprovalDecision, EventKind, EventPayload, StoreError, ThreadEvent, ThreadManager,
};
use lace_tools::{ToolContext, ToolRegistry, ToolStatus};

use crate::approval::ApprovalBroker;
use crate::events::AgentEvent;

/// One tool call to execute, as extracted from the model response.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub call_id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Aggregate result of a tool batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOutcome {
    /// At least one call was denied; the turn must halt without a follow-up
    /// model request.
    pub denied: bool,
    /// The batch was cancelled mid-flight.
    pub aborted: bool,
}

enum CallOutcome {
    Completed,
    Denied,
    Aborted,
}

/// Executes approved tool calls concurrently within a turn.
///
/// Duplicate-execution defense in depth:
/// 1. the event log's unique constraint absorbs duplicate approval
///    responses and results (database layer),
/// 2. a result-exists pre-check plus a per-`call_id` mutex here guarantee
///    the tool body runs at most once (agent layer),
/// 3. the message builder collapses duplicate results when rebuilding the
///    conversation (prompt layer).
pub struct ToolExecutor {
    threads: Arc<ThreadManager>,
    registry: Arc<ToolRegistry>,
    broker: Arc<ApprovalBroker>,
    call_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ToolExecutor {
    pub fn new(
        threads: Arc<ThreadManager>,
        registry: Arc<ToolRegistry>,
        broker: Arc<ApprovalBroker>,
    ) -> Self {
        Self {
            threads,
            registry,
            broker,
            call_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn call_lock(&self, call_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.call_locks.lock().await;
        locks
            .entry(call_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run a batch of tool calls concurrently.  All results are appended
    /// before this returns; ordering between calls is unspecified.
    pub async fn run_batch(
        self: Arc<Self>,
        thread_id: &str,
        calls: Vec<ToolInvocation>,
        ctx: &ToolContext,
        events: &broadcast::Sender<AgentEvent>,
    ) -> Result<BatchOutcome, StoreError> {
        let mut tasks = Vec::with_capacity(calls.len());
        for inv in calls {
            let executor = Arc::clone(&self);
            let thread_id = thread_id.to_string();
            let call_id = inv.call_id.clone();
            let ctx = ctx.clone();
            let events = events.clone();
            let task = tokio::spawn(async move {
                executor.run_one(&thread_id, inv, &ctx, &events).await
            });
            tasks.push((call_id, task));
        }

        let mut outcome = BatchOutcome::default();
        for (call_id, task) in tasks {
            match task.await {
                Ok(Ok(CallOutcome::Denied)) => outcome.denied = true,
                Ok(Ok(CallOutcome::Aborted)) => outcome.aborted = true,
                Ok(Ok(CallOutcome::Completed)) => {}
                Ok(Err(e)) => return Err(e),
                Err(join_err) => {
                    warn!(call_id, "tool task panicked: {join_err}");
                    let _ = self
                        .threads
                        .append(
                            thread_id,
                            EventPayload::tool_result_text(
                                &call_id,
                                format!("tool execution panicked: {join_err}"),
                                true,
                            ),
                        )
                        .await;
                }
            }
        }
        Ok(outcome)
    }

    async fn run_one(
        &self,
        thread_id: &str,
        inv: ToolInvocation,
        ctx: &ToolContext,
        events: &broadcast::Sender<AgentEvent>,
    ) -> Result<CallOutcome, StoreError> {
        // At most one execution per call_id, even under racing approvals.
        let lock = self.call_lock(&inv.call_id).await;
        let _guard = lock.lock().await;

        // A result already exists: this call is done, whatever raced us here.
        if self
            .threads
            .exists_event(thread_id, EventKind::ToolResult, &inv.call_id)?
        {
            return Ok(CallOutcome::Completed);
        }

        let decision = match self.threads.find_event(
            thread_id,
            EventKind::ToolApprovalResponse,
            &inv.call_id,
        )? {
            Some(ThreadEvent {
                payload: EventPayload::ToolApprovalResponse { decision, .. },
                ..
            }) => Decision::Resolved(decision),
            _ => self.request_approval(thread_id, &inv, ctx).await?,
        };

        let decision = match decision {
            Decision::Resolved(d) => d,
            Decision::Aborted => return Ok(CallOutcome::Aborted),
        };

        if decision == ApprovalDecision::Deny {
            self.threads
                .append(thread_id, EventPayload::denied_result(&inv.call_id))
                .await?;
            let _ = events.send(AgentEvent::ToolUseComplete {
                call_id: inv.call_id.clone(),
                is_error: true,
            });
            return Ok(CallOutcome::Denied);
        }
        if decision == ApprovalDecision::AllowSession {
            self.broker.allow_for_session(&inv.name).await;
        }

        let _ = events.send(AgentEvent::ToolUseStart {
            call_id: inv.call_id.clone(),
            name: inv.name.clone(),
        });

        let result = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                lace_tools::ToolResult::aborted("tool execution cancelled")
            }
            r = self.registry.execute(&inv.name, inv.arguments.clone(), ctx) => r,
        };
        let aborted = result.status == ToolStatus::Aborted;

        let payload = EventPayload::ToolResult {
            call_id: inv.call_id.clone(),
            content: result.content.clone(),
            is_error: result.is_error,
        };
        // A mid-run append failure is retried once before it propagates.
        if let Err(first) = self.threads.append(thread_id, payload.clone()).await {
            warn!(call_id = inv.call_id, error = %first, "result append failed; retrying once");
            self.threads.append(thread_id, payload).await?;
        }

        let _ = events.send(AgentEvent::ToolUseComplete {
            call_id: inv.call_id.clone(),
            is_error: result.is_error,
        });
        if aborted {
            Ok(CallOutcome::Aborted)
        } else {
            Ok(CallOutcome::Completed)
        }
    }

    /// Append an approval request and wait for the response (or auto-approve
    /// from the session allow-list).
    async fn request_approval(
        &self,
        thread_id: &str,
        inv: &ToolInvocation,
        ctx: &ToolContext,
    ) -> Result<Decision, StoreError> {
        if self.broker.is_session_allowed(&inv.name).await {
            // The log still records the request/response pair so a replay
            // shows why the tool ran without a prompt.
            self.threads
                .append(
                    thread_id,
                    EventPayload::ToolApprovalRequest {
                        call_id: inv.call_id.clone(),
                    },
                )
                .await?;
            let stored = self
                .threads
                .append(
                    thread_id,
                    EventPayload::ToolApprovalResponse {
                        call_id: inv.call_id.clone(),
                        decision: ApprovalDecision::AllowOnce,
                    },
                )
                .await?;
            if let EventPayload::ToolApprovalResponse { decision, .. } = stored.payload {
                return Ok(Decision::Resolved(decision));
            }
            return Ok(Decision::Resolved(ApprovalDecision::AllowOnce));
        }

        // Register before appending the request so a response racing in
        // right after the append cannot be missed.
        let rx = self.broker.register(&inv.call_id).await;
        self.threads
            .append(
                thread_id,
                EventPayload::ToolApprovalRequest {
                    call_id: inv.call_id.clone(),
                },
            )
            .await?;

        tokio::select! {
            _ = ctx.cancel.cancelled() => Ok(Decision::Aborted),
            decision = rx => match decision {
                Ok(d) => Ok(Decision::Resolved(d)),
                Err(_) => Ok(Decision::Aborted),
            }
        }
    }
}

enum Decision {
    Resolved(ApprovalDecision),
    Aborted,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
