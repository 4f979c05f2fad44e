// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::bail;
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use lace_config::AgentConfig;
use lace_model::{
    streaming_with_retry, CompletedToolCall, CompletionRequest, ModelError, ModelProvider,
    ResponseEvent, RetryPolicy, RetrySignal, ToolSchema, Usage,
};
use lace_threads::{ApprovalDecision, EventPayload, ThreadManager};
use lace_tools::{AgentHandle, FileReadLedger, ToolContext, ToolRegistry};

use crate::approval::ApprovalBroker;
use crate::budget::TokenBudget;
use crate::compact::compact_thread;
use crate::events::AgentEvent;
use crate::executor::{ToolExecutor, ToolInvocation};
use crate::messages::build_messages;
use crate::prompts::{system_prompt, PromptContext};
use crate::queue::{MessagePriority, MessageQueue, QueueStats, QueuedMessage};
use crate::state::AgentState;

/// Options for [`Agent::send_message`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Force enqueueing even when the agent is idle.
    pub queue: bool,
    pub priority: MessagePriority,
    pub metadata: Option<serde_json::Value>,
}

/// How a turn's model/tool loop ended.
enum TurnEnd {
    Completed,
    Denied,
    Cancelled,
    RoundBudget,
}

#[derive(Default)]
struct RoundOutput {
    text: String,
    thinking: String,
    tool_calls: Vec<CompletedToolCall>,
    usage: Option<Usage>,
    aborted: bool,
}

/// The per-conversation agent: a single logical task driving
/// input → model → tools → model … → idle, with all conversational state
/// reconstructed from the thread's event log.
///
/// Callers never mutate state directly; they feed events
/// ([`Agent::send_message`], [`Agent::submit_approval`], [`Agent::stop`],
/// [`Agent::cancel_current_turn`]) and observe via [`Agent::subscribe`].
pub struct Agent {
    threads: Arc<ThreadManager>,
    thread_id: String,
    provider: Arc<dyn ModelProvider>,
    registry: Arc<ToolRegistry>,
    broker: Arc<ApprovalBroker>,
    executor: Arc<ToolExecutor>,
    config: Arc<AgentConfig>,
    prompt_ctx: PromptContext,
    files_read: Arc<FileReadLedger>,
    retry_policy: RetryPolicy,
    events_tx: broadcast::Sender<AgentEvent>,
    state: Mutex<AgentState>,
    queue: Mutex<MessageQueue>,
    /// Held for the whole duration of a turn (and the queue drain that
    /// follows it).  `try_lock` failing is the definition of "busy".
    turn_lock: Mutex<()>,
    current_cancel: Mutex<Option<CancellationToken>>,
    budget: Mutex<Option<TokenBudget>>,
    turn_counter: AtomicU64,
    stopped: AtomicBool,
}

impl Agent {
    /// Build an agent bound to `thread_id` (created if missing).  Must be
    /// called within a tokio runtime: the constructor spawns the task that
    /// re-publishes thread-store notifications to subscribers.
    ///
    /// `budget`: pass an explicit [`TokenBudget`] to skip the lazy
    /// auto-initialisation from the model's context window.
    pub fn new(
        threads: Arc<ThreadManager>,
        thread_id: String,
        provider: Arc<dyn ModelProvider>,
        registry: Arc<ToolRegistry>,
        config: Arc<AgentConfig>,
        prompt_ctx: PromptContext,
        budget: Option<TokenBudget>,
    ) -> anyhow::Result<Self> {
        threads.create_thread(Some(&thread_id), None)?;
        threads.set_metadata_key(
            &thread_id,
            "model",
            serde_json::json!(provider.model_info().id),
        )?;
        threads.set_metadata_key(
            &thread_id,
            "provider",
            serde_json::json!(provider.provider_info().id),
        )?;

        let broker = Arc::new(ApprovalBroker::new());
        let executor = Arc::new(ToolExecutor::new(
            Arc::clone(&threads),
            Arc::clone(&registry),
            Arc::clone(&broker),
        ));
        let (events_tx, _) = broadcast::channel(512);

        // The agent is the sole public observer surface: append
        // notifications from the store are re-published on our channel.
        let mut store_rx = threads.subscribe();
        let forward_tx = events_tx.clone();
        let forward_id = thread_id.clone();
        tokio::spawn(async move {
            loop {
                match store_rx.recv().await {
                    Ok(ev) if ev.thread_id == forward_id => {
                        let _ = forward_tx.send(AgentEvent::ThreadEventAdded(ev));
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(Self {
            threads,
            thread_id,
            provider,
            registry,
            broker,
            executor,
            config,
            prompt_ctx,
            files_read: Arc::new(FileReadLedger::default()),
            retry_policy: RetryPolicy::default(),
            events_tx,
            state: Mutex::new(AgentState::Idle),
            queue: Mutex::new(MessageQueue::new()),
            turn_lock: Mutex::new(()),
            current_cancel: Mutex::new(None),
            budget: Mutex::new(budget),
            turn_counter: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events_tx.subscribe()
    }

    pub async fn state(&self) -> AgentState {
        *self.state.lock().await
    }

    pub async fn queue_stats(&self) -> QueueStats {
        self.queue.lock().await.stats()
    }

    pub async fn queued_messages(&self) -> Vec<QueuedMessage> {
        self.queue.lock().await.contents()
    }

    /// File-read ledger backing the read-before-write check; exposed so
    /// embedding layers can seed it (e.g. when resuming with known state).
    pub fn files_read(&self) -> &Arc<FileReadLedger> {
        &self.files_read
    }

    /// Submit user input.  Runs a turn immediately when idle; otherwise (or
    /// with `opts.queue`) the message is enqueued and processed when the
    /// agent returns to idle.
    pub async fn send_message(
        &self,
        text: impl Into<String>,
        opts: SendOptions,
    ) -> anyhow::Result<()> {
        let text = text.into();
        if self.stopped.load(Ordering::SeqCst) {
            bail!("agent is stopped");
        }
        if opts.queue {
            self.enqueue(text, opts).await;
            return Ok(());
        }
        match self.turn_lock.try_lock() {
            Ok(_guard) => {
                if let Err(e) = self.run_turn(&text).await {
                    *self.current_cancel.lock().await = None;
                    let _ = self.events_tx.send(AgentEvent::Error(e.to_string()));
                    self.set_state(AgentState::Idle).await;
                    return Err(e);
                }
                self.drain_queue().await;
                Ok(())
            }
            Err(_busy) => {
                self.enqueue(text, opts).await;
                Ok(())
            }
        }
    }

    /// Record a human decision for a pending tool call.  Idempotent: the
    /// store's unique constraint collapses duplicates, and the broker
    /// resolves each waiting call at most once, with the *stored* decision.
    pub async fn submit_approval(
        &self,
        call_id: &str,
        decision: ApprovalDecision,
    ) -> anyhow::Result<()> {
        if !self.threads.exists_event(
            &self.thread_id,
            lace_threads::EventKind::ToolApprovalRequest,
            call_id,
        )? {
            bail!("no approval request pending for call {call_id}");
        }
        let stored = self
            .threads
            .append(
                &self.thread_id,
                EventPayload::ToolApprovalResponse {
                    call_id: call_id.to_string(),
                    decision,
                },
            )
            .await?;
        if let EventPayload::ToolApprovalResponse { decision, .. } = stored.payload {
            self.broker.resolve(call_id, decision).await;
        }
        Ok(())
    }

    /// Cancel the in-flight turn (model request and running tools).  Events
    /// already appended stay in the log.
    pub async fn cancel_current_turn(&self) {
        if let Some(cancel) = self.current_cancel.lock().await.as_ref() {
            cancel.cancel();
        }
        self.broker.cancel_all().await;
    }

    /// Terminal stop: cancels the current turn and discards the queue
    /// without processing.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.cancel_current_turn().await;
        self.queue.lock().await.clear();
        self.set_state(AgentState::Stopped).await;
    }

    // ── Internals ────────────────────────────────────────────────────────────

    async fn enqueue(&self, text: String, opts: SendOptions) {
        let msg = QueuedMessage::new(text, opts.priority, opts.metadata);
        let id = msg.id.clone();
        let queue_length = self.queue.lock().await.push(msg);
        let _ = self.events_tx.send(AgentEvent::MessageQueued { id, queue_length });
    }

    /// Process queued messages, high-priority first, halting on `stop()`.
    async fn drain_queue(&self) {
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            let next = self.queue.lock().await.pop();
            let Some(msg) = next else { return };
            if let Err(e) = self.run_turn(&msg.text).await {
                *self.current_cancel.lock().await = None;
                let _ = self.events_tx.send(AgentEvent::Error(e.to_string()));
                self.set_state(AgentState::Idle).await;
            }
        }
    }

    async fn set_state(&self, to: AgentState) {
        let mut state = self.state.lock().await;
        let from = *state;
        if from == to || from == AgentState::Stopped {
            return;
        }
        *state = to;
        let _ = self.events_tx.send(AgentEvent::StateChanged { from, to });
    }

    fn tool_context(&self, cancel: CancellationToken) -> ToolContext {
        ToolContext::new(
            self.prompt_ctx.working_directory.clone(),
            Arc::clone(&self.files_read) as Arc<dyn AgentHandle>,
        )
        .with_cancel(cancel)
    }

    async fn ensure_budget(&self) {
        let mut budget = self.budget.lock().await;
        if budget.is_none() {
            let info = self.provider.model_info();
            *budget = Some(
                TokenBudget::for_context_window(info.context_window)
                    .with_warning_threshold(self.config.compaction_threshold)
                    .with_cooldown_turns(self.config.compaction_cooldown_turns),
            );
        }
    }

    /// Re-render the system prompt and persist it when it changed.
    async fn refresh_system_prompt(&self) -> anyhow::Result<()> {
        let mut rendered = system_prompt(&self.prompt_ctx, self.config.system_prompt.as_deref());
        if let Some(append) = &self.config.append_system_prompt {
            if !append.trim().is_empty() {
                rendered.push_str("\n\n");
                rendered.push_str(append.trim());
            }
        }
        let events = self.threads.events(&self.thread_id)?;
        let current = events.iter().rev().find_map(|e| match &e.payload {
            EventPayload::SystemPrompt { text } => Some(text.as_str()),
            _ => None,
        });
        if current != Some(rendered.as_str()) {
            self.threads
                .append(&self.thread_id, EventPayload::system_prompt(rendered))
                .await?;
        }
        Ok(())
    }

    /// One full user turn: append input, refresh prompt, loop model rounds
    /// and tool batches until the response carries no tool calls (or the
    /// turn is denied/cancelled), then return to idle.
    async fn run_turn(&self, text: &str) -> anyhow::Result<()> {
        let turn = self.turn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        *self.current_cancel.lock().await = Some(cancel.clone());

        self.threads
            .append(&self.thread_id, EventPayload::user_message(text))
            .await?;
        self.refresh_system_prompt().await?;
        self.ensure_budget().await;

        let _ = self.events_tx.send(AgentEvent::TurnStarted {
            thread_id: self.thread_id.clone(),
        });
        self.set_state(AgentState::Thinking).await;

        let mut rounds = 0u32;
        let _end = loop {
            rounds += 1;
            if rounds > self.config.max_tool_rounds {
                warn!(
                    max_tool_rounds = self.config.max_tool_rounds,
                    "round budget exhausted; ending turn"
                );
                break TurnEnd::RoundBudget;
            }

            // Pre-request budget gate (also catches pressure built up by
            // large tool results in the previous round).
            self.maybe_compact(turn, &cancel).await;
            if cancel.is_cancelled() {
                break TurnEnd::Cancelled;
            }

            let round = self.stream_one_round(&cancel).await?;

            let agent_text = if self.config.include_thinking && !round.thinking.is_empty() {
                format!("<think>{}</think>{}", round.thinking, round.text)
            } else {
                round.text.clone()
            };
            if !agent_text.is_empty() {
                self.threads
                    .append(&self.thread_id, EventPayload::agent_message(agent_text))
                    .await?;
            }
            if round.aborted {
                break TurnEnd::Cancelled;
            }

            if let Some(usage) = round.usage {
                if let Some(budget) = self.budget.lock().await.as_mut() {
                    budget.note_usage(usage.total_tokens);
                }
            }
            // Post-response trigger: compaction may run even when the turn
            // is about to end, so the next turn starts within budget.
            self.maybe_compact(turn, &cancel).await;

            if round.tool_calls.is_empty() {
                break TurnEnd::Completed;
            }

            for call in &round.tool_calls {
                self.threads
                    .append(
                        &self.thread_id,
                        EventPayload::tool_call(&call.id, &call.name, call.input.clone()),
                    )
                    .await?;
            }

            self.set_state(AgentState::ToolExecution).await;
            let ctx = self.tool_context(cancel.child_token());
            let invocations: Vec<ToolInvocation> = round
                .tool_calls
                .iter()
                .map(|call| ToolInvocation {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: call.input.clone(),
                })
                .collect();
            let batch = Arc::clone(&self.executor)
                .run_batch(&self.thread_id, invocations, &ctx, &self.events_tx)
                .await?;

            if batch.denied {
                // A user denial halts the turn: results are recorded, no
                // follow-up model request.
                break TurnEnd::Denied;
            }
            if batch.aborted || cancel.is_cancelled() {
                break TurnEnd::Cancelled;
            }
            self.set_state(AgentState::Thinking).await;
        };

        *self.current_cancel.lock().await = None;
        let _ = self.events_tx.send(AgentEvent::TurnCompleted {
            thread_id: self.thread_id.clone(),
        });
        self.set_state(AgentState::Idle).await;
        Ok(())
    }

    /// One model round: build messages from the log, stream the response,
    /// and assemble complete tool calls.
    async fn stream_one_round(&self, cancel: &CancellationToken) -> anyhow::Result<RoundOutput> {
        let events = self.threads.events(&self.thread_id)?;
        let messages = build_messages(&events, self.config.include_thinking);
        let tools: Vec<ToolSchema> = self
            .registry
            .specs()
            .into_iter()
            .map(|spec| ToolSchema {
                name: spec.name,
                description: spec.description,
                input_schema: spec.input_schema,
            })
            .collect();
        let req = CompletionRequest { messages, tools };

        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        let retry_events = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(signal) = signal_rx.recv().await {
                let event = match signal {
                    RetrySignal::Attempt { attempt, delay, .. } => AgentEvent::RetryAttempt {
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                    },
                    RetrySignal::Exhausted { attempts } => {
                        AgentEvent::RetryExhausted { attempts }
                    }
                };
                let _ = retry_events.send(event);
            }
        });

        let mut stream = streaming_with_retry(
            Arc::clone(&self.provider),
            req,
            cancel.child_token(),
            self.retry_policy,
            Some(signal_tx),
        );

        let mut out = RoundOutput::default();
        let mut streaming = false;
        // id → name of tool calls whose input is still assembling.
        let mut pending: HashMap<String, String> = HashMap::new();
        while let Some(event) = stream.next().await {
            match event {
                Ok(ResponseEvent::MessageStart { .. }) => {}
                Ok(ResponseEvent::ContentText(delta)) => {
                    if !streaming {
                        streaming = true;
                        self.set_state(AgentState::Streaming).await;
                    }
                    out.text.push_str(&delta);
                    let _ = self.events_tx.send(AgentEvent::Token(delta));
                }
                Ok(ResponseEvent::ThinkingText(delta)) => {
                    if !streaming {
                        streaming = true;
                        self.set_state(AgentState::Streaming).await;
                    }
                    out.thinking.push_str(&delta);
                    let _ = self.events_tx.send(AgentEvent::ThinkingToken(delta));
                }
                Ok(ResponseEvent::ToolCallStart { id, name }) => {
                    pending.insert(id, name);
                }
                // Partial JSON is tolerated and ignored; inputs are usable
                // only once complete.
                Ok(ResponseEvent::ToolCallInputDelta { .. }) => {}
                Ok(ResponseEvent::ToolCallComplete { id, name, input }) => {
                    pending.remove(&id);
                    out.tool_calls.push(CompletedToolCall { id, name, input });
                }
                Ok(ResponseEvent::MessageEnd { usage, .. }) => {
                    out.usage = Some(usage);
                }
                Err(ModelError::Aborted) => {
                    out.aborted = true;
                    return Ok(out);
                }
                Err(e) => return Err(anyhow::Error::new(e).context("model request failed")),
            }
        }
        for (id, name) in pending {
            warn!(call_id = %id, tool = %name, "tool call input never completed; dropping");
        }
        Ok(out)
    }

    /// Run a summarizing compaction when the budget says so.  Failure is
    /// logged and the turn continues unmodified.
    async fn maybe_compact(&self, turn: u64, cancel: &CancellationToken) {
        let should = self
            .budget
            .lock()
            .await
            .as_ref()
            .is_some_and(|b| b.should_compact(turn));
        if !should {
            return;
        }
        self.set_state(AgentState::Compacting).await;
        let _ = self.events_tx.send(AgentEvent::CompactionStarted);
        match compact_thread(
            &self.threads,
            Arc::clone(&self.provider),
            &self.thread_id,
            self.config.compaction_keep_recent,
            self.config.compaction_prompt.as_deref(),
            cancel.child_token(),
        )
        .await
        {
            Ok(outcome) => {
                if let Some(budget) = self.budget.lock().await.as_mut() {
                    budget.record_compaction(turn);
                }
                let _ = self.events_tx.send(AgentEvent::CompactionCompleted {
                    events_summarized: outcome.events_summarized,
                });
            }
            Err(e) => {
                warn!(error = %e, "compaction failed; continuing turn unmodified");
            }
        }
        self.set_state(AgentState::Thinking).await;
    }
}
