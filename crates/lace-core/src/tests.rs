// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// End-to-end scenarios for the agent state machine.
///
/// Uses the scripted mock provider so every scenario is deterministic and
/// requires no network access.
#[cfg(test)]
mod agent_tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::stream;
    use serde_json::json;
    use tokio::sync::broadcast;
    use tokio_util::sync::CancellationToken;

    use lace_config::AgentConfig;
    use lace_model::{
        CompletionRequest, ModelError, ModelInfo, ModelProvider, ProviderInfo, ResponseEvent,
        ResponseStream, ScriptedMockProvider, StopReason, Usage,
    };
    use lace_threads::{ApprovalDecision, EventKind, EventLog, EventPayload, ThreadManager};
    use lace_tools::{Tool, ToolContext, ToolRegistry, ToolResult};

    use crate::{Agent, AgentEvent, AgentState, PromptContext, SendOptions, TokenBudget};

    // ── Helpers ───────────────────────────────────────────────────────────────

    /// Test tool that counts its executions.
    struct ProbeTool {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for ProbeTool {
        fn name(&self) -> &str {
            "probe"
        }
        fn description(&self) -> &str {
            "records that it ran"
        }
        fn input_schema(&self) -> serde_json::Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, _args: serde_json::Value, _ctx: &ToolContext) -> ToolResult {
            self.runs.fetch_add(1, Ordering::SeqCst);
            ToolResult::ok("probed")
        }
    }

    fn probe_registry() -> (ToolRegistry, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(ProbeTool {
            runs: Arc::clone(&runs),
        });
        (registry, runs)
    }

    fn agent_with(
        provider: Arc<dyn ModelProvider>,
        registry: ToolRegistry,
        config: AgentConfig,
        budget: Option<TokenBudget>,
    ) -> (Arc<Agent>, Arc<ThreadManager>) {
        let threads = Arc::new(ThreadManager::new(Arc::new(EventLog::in_memory().unwrap())));
        let thread_id = threads.create_thread(None, None).unwrap().id;
        let agent = Agent::new(
            Arc::clone(&threads),
            thread_id,
            provider,
            Arc::new(registry),
            Arc::new(config),
            PromptContext {
                working_directory: "/tmp".into(),
                ..PromptContext::default()
            },
            budget,
        )
        .unwrap();
        (Arc::new(agent), threads)
    }

    /// Auto-respond to every approval request with `decision`.
    fn auto_approve(
        agent: Arc<Agent>,
        decision: ApprovalDecision,
    ) -> tokio::task::JoinHandle<()> {
        let mut rx = agent.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(AgentEvent::ThreadEventAdded(ev)) => {
                        if let EventPayload::ToolApprovalRequest { call_id } = ev.payload {
                            let _ = agent.submit_approval(&call_id, decision).await;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }

    fn count_kind(threads: &ThreadManager, thread_id: &str, kind: EventKind) -> usize {
        threads
            .events(thread_id)
            .unwrap()
            .iter()
            .filter(|e| e.payload.kind() == kind)
            .count()
    }

    async fn wait_for_state(agent: &Agent, wanted: AgentState) {
        for _ in 0..1000 {
            if agent.state().await == wanted {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("agent never reached state {wanted}");
    }

    fn text_and_tools_script(text: &str, calls: &[(&str, &str)]) -> Vec<ResponseEvent> {
        let mut events = vec![
            ResponseEvent::MessageStart { input_tokens: 5 },
            ResponseEvent::ContentText(text.into()),
        ];
        for (id, name) in calls {
            events.push(ResponseEvent::ToolCallStart {
                id: (*id).into(),
                name: (*name).into(),
            });
            events.push(ResponseEvent::ToolCallComplete {
                id: (*id).into(),
                name: (*name).into(),
                input: json!({}),
            });
        }
        events.push(ResponseEvent::MessageEnd {
            usage: Usage::new(5, 5),
            stop_reason: StopReason::ToolUse,
        });
        events
    }

    // ── Scenario 1: fresh turn ────────────────────────────────────────────────

    #[tokio::test]
    async fn fresh_turn_appends_user_and_agent_messages() {
        let provider = Arc::new(ScriptedMockProvider::always_text("hello"));
        let (agent, threads) =
            agent_with(provider, ToolRegistry::new(), AgentConfig::default(), None);

        agent.send_message("hi", SendOptions::default()).await.unwrap();

        let events = threads.events(agent.thread_id()).unwrap();
        let user: Vec<_> = events
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::UserMessage { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        let assistant: Vec<_> = events
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::AgentMessage { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(user, ["hi"]);
        assert_eq!(assistant, ["hello"]);
        assert_eq!(agent.state().await, AgentState::Idle);
    }

    #[tokio::test]
    async fn turn_emits_started_tokens_and_completed() {
        let provider = Arc::new(ScriptedMockProvider::always_text("streamed text"));
        let (agent, _) = agent_with(provider, ToolRegistry::new(), AgentConfig::default(), None);
        let mut rx = agent.subscribe();

        agent.send_message("go", SendOptions::default()).await.unwrap();

        let mut saw_started = false;
        let mut token_text = String::new();
        let mut saw_completed = false;
        while let Ok(ev) = rx.try_recv() {
            match ev {
                AgentEvent::TurnStarted { .. } => saw_started = true,
                AgentEvent::Token(t) => token_text.push_str(&t),
                AgentEvent::TurnCompleted { .. } => saw_completed = true,
                _ => {}
            }
        }
        assert!(saw_started);
        assert!(saw_completed);
        assert_eq!(token_text, "streamed text");
    }

    #[tokio::test]
    async fn second_turn_sends_full_history_to_provider() {
        let provider = Arc::new(ScriptedMockProvider::new(vec![
            ScriptedMockProvider::text_script("first reply"),
            ScriptedMockProvider::text_script("second reply"),
        ]));
        let last_request = Arc::clone(&provider.last_request);
        let (agent, _) = agent_with(provider, ToolRegistry::new(), AgentConfig::default(), None);

        agent.send_message("one", SendOptions::default()).await.unwrap();
        agent.send_message("two", SendOptions::default()).await.unwrap();

        let req = last_request.lock().unwrap().take().unwrap();
        let texts: Vec<&str> = req.messages.iter().filter_map(|m| m.as_text()).collect();
        assert!(texts.contains(&"one"));
        assert!(texts.contains(&"first reply"));
        assert!(texts.contains(&"two"));
    }

    #[tokio::test]
    async fn system_prompt_event_appended_once_while_stable() {
        let provider = Arc::new(ScriptedMockProvider::new(vec![
            ScriptedMockProvider::text_script("a"),
            ScriptedMockProvider::text_script("b"),
        ]));
        let (agent, threads) =
            agent_with(provider, ToolRegistry::new(), AgentConfig::default(), None);
        agent.send_message("one", SendOptions::default()).await.unwrap();
        agent.send_message("two", SendOptions::default()).await.unwrap();
        // Rendered context is unchanged between the turns, so the refresh
        // must not write a second identical prompt event.
        assert_eq!(count_kind(&threads, agent.thread_id(), EventKind::SystemPrompt), 1);
    }

    // ── Scenario 2: tool success batch ────────────────────────────────────────

    #[tokio::test]
    async fn tool_batch_executes_and_turn_continues() {
        let provider = Arc::new(ScriptedMockProvider::new(vec![
            text_and_tools_script("let me check", &[("call-a", "probe"), ("call-b", "probe")]),
            ScriptedMockProvider::text_script("all done"),
        ]));
        let (registry, runs) = probe_registry();
        let (agent, threads) = agent_with(provider, registry, AgentConfig::default(), None);
        let approver = auto_approve(Arc::clone(&agent), ApprovalDecision::AllowOnce);

        agent.send_message("check things", SendOptions::default()).await.unwrap();
        approver.abort();

        let id = agent.thread_id();
        assert_eq!(runs.load(Ordering::SeqCst), 2, "both tools ran");
        assert_eq!(count_kind(&threads, id, EventKind::ToolCall), 2);
        assert_eq!(count_kind(&threads, id, EventKind::ToolApprovalRequest), 2);
        assert_eq!(count_kind(&threads, id, EventKind::ToolApprovalResponse), 2);
        assert_eq!(count_kind(&threads, id, EventKind::ToolResult), 2);
        // No denials, no errors.
        let any_error = threads.events(id).unwrap().iter().any(|e| {
            matches!(&e.payload, EventPayload::ToolResult { is_error: true, .. })
        });
        assert!(!any_error);
        // Round-one text plus the follow-up reply.
        assert!(count_kind(&threads, id, EventKind::AgentMessage) >= 2);
        assert_eq!(agent.state().await, AgentState::Idle);
    }

    #[tokio::test]
    async fn tool_results_are_fed_back_to_the_model() {
        let provider = Arc::new(ScriptedMockProvider::new(vec![
            text_and_tools_script("checking", &[("call-a", "probe")]),
            ScriptedMockProvider::text_script("done"),
        ]));
        let last_request = Arc::clone(&provider.last_request);
        let (registry, _) = probe_registry();
        let (agent, _) = agent_with(provider, registry, AgentConfig::default(), None);
        let approver = auto_approve(Arc::clone(&agent), ApprovalDecision::AllowOnce);
        agent.send_message("go", SendOptions::default()).await.unwrap();
        approver.abort();

        let req = last_request.lock().unwrap().take().unwrap();
        let has_result = req.messages.iter().any(|m| {
            matches!(
                &m.content,
                lace_model::MessageContent::ToolResult { call_id, content, .. }
                    if call_id == "call-a" && content.contains("probed")
            )
        });
        assert!(has_result, "follow-up request must include the tool result");
    }

    // ── Scenario 3: denial halts the turn ─────────────────────────────────────

    #[tokio::test]
    async fn denial_records_result_and_skips_followup_request() {
        let provider = Arc::new(ScriptedMockProvider::new(vec![
            text_and_tools_script("about to probe", &[("call-c", "probe")]),
            ScriptedMockProvider::text_script("must never be requested"),
        ]));
        let calls = Arc::clone(&provider.calls);
        let (registry, runs) = probe_registry();
        let (agent, threads) = agent_with(provider, registry, AgentConfig::default(), None);
        let approver = auto_approve(Arc::clone(&agent), ApprovalDecision::Deny);

        agent.send_message("try it", SendOptions::default()).await.unwrap();
        approver.abort();

        let id = agent.thread_id();
        assert_eq!(runs.load(Ordering::SeqCst), 0, "denied tool must not run");
        let results: Vec<_> = threads
            .events(id)
            .unwrap()
            .into_iter()
            .filter_map(|e| match e.payload {
                EventPayload::ToolResult {
                    content, is_error, ..
                } => Some((content, is_error)),
                _ => None,
            })
            .collect();
        assert_eq!(results.len(), 1);
        assert!(results[0].1);
        assert_eq!(
            results[0].0,
            vec![lace_threads::ToolResultChunk::text(
                "Tool execution denied by user"
            )]
        );
        // Exactly one model request, exactly one agent message.
        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(count_kind(&threads, id, EventKind::AgentMessage), 1);
        assert_eq!(agent.state().await, AgentState::Idle);
    }

    // ── Scenario 4: approval race ─────────────────────────────────────────────

    #[tokio::test]
    async fn fifty_racing_approvals_run_the_tool_once() {
        let provider = Arc::new(ScriptedMockProvider::new(vec![
            text_and_tools_script("racing", &[("call-r", "probe")]),
            ScriptedMockProvider::text_script("after race"),
        ]));
        let (registry, runs) = probe_registry();
        let (agent, threads) = agent_with(provider, registry, AgentConfig::default(), None);

        let turn = {
            let agent = Arc::clone(&agent);
            tokio::spawn(async move {
                agent.send_message("race", SendOptions::default()).await.unwrap();
            })
        };

        // Wait until the approval request is in the log.
        let id = agent.thread_id().to_string();
        for _ in 0..1000 {
            if count_kind(&threads, &id, EventKind::ToolApprovalRequest) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let mut submitters = Vec::new();
        for _ in 0..50 {
            let agent = Arc::clone(&agent);
            submitters.push(tokio::spawn(async move {
                let _ = agent.submit_approval("call-r", ApprovalDecision::AllowOnce).await;
            }));
        }
        for s in submitters {
            s.await.unwrap();
        }
        turn.await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 1, "tool body exactly once");
        assert_eq!(count_kind(&threads, &id, EventKind::ToolApprovalResponse), 1);
        assert_eq!(count_kind(&threads, &id, EventKind::ToolResult), 1);
    }

    // ── Allow-session ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn allow_session_skips_the_second_prompt() {
        let provider = Arc::new(ScriptedMockProvider::new(vec![
            text_and_tools_script("first", &[("s-1", "probe")]),
            text_and_tools_script("second", &[("s-2", "probe")]),
            ScriptedMockProvider::text_script("done"),
        ]));
        let (registry, runs) = probe_registry();
        let (agent, threads) = agent_with(provider, registry, AgentConfig::default(), None);
        // Approve only the first call; the second must be auto-approved from
        // the session allow-list without outside help.
        let approver = {
            let agent = Arc::clone(&agent);
            let mut rx = agent.subscribe();
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(AgentEvent::ThreadEventAdded(ev)) => {
                            if let EventPayload::ToolApprovalRequest { call_id } = ev.payload {
                                if call_id == "s-1" {
                                    let _ = agent
                                        .submit_approval(&call_id, ApprovalDecision::AllowSession)
                                        .await;
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            })
        };

        agent.send_message("twice", SendOptions::default()).await.unwrap();
        approver.abort();

        let id = agent.thread_id();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        // Both calls leave a request/response pair in the log; the second
        // response is the auto-appended AllowOnce.
        assert_eq!(count_kind(&threads, id, EventKind::ToolApprovalResponse), 2);
        let second = threads
            .find_event(id, EventKind::ToolApprovalResponse, "s-2")
            .unwrap()
            .unwrap();
        assert!(matches!(
            second.payload,
            EventPayload::ToolApprovalResponse {
                decision: ApprovalDecision::AllowOnce,
                ..
            }
        ));
    }

    // ── Scenario 5: queue while busy ──────────────────────────────────────────

    /// Blocks the first completion until the gate receives a permit; all
    /// later completions answer immediately.  Respects the cancel token.
    struct GatedProvider {
        gate: Arc<tokio::sync::Semaphore>,
        first_done: AtomicBool,
    }

    impl GatedProvider {
        fn new(gate: Arc<tokio::sync::Semaphore>) -> Self {
            Self {
                gate,
                first_done: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl ModelProvider for GatedProvider {
        fn model_info(&self) -> ModelInfo {
            ModelInfo {
                id: "gated".into(),
                context_window: 100_000,
                max_output_tokens: 4096,
            }
        }
        fn provider_info(&self) -> ProviderInfo {
            ProviderInfo {
                id: "gated".into(),
                display_name: "Gated".into(),
            }
        }
        fn is_configured(&self) -> bool {
            true
        }
        async fn create_streaming_response(
            &self,
            _req: CompletionRequest,
            cancel: CancellationToken,
        ) -> Result<ResponseStream, ModelError> {
            if !self.first_done.swap(true, Ordering::SeqCst) {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ModelError::Aborted),
                    permit = self.gate.acquire() => drop(permit),
                }
            }
            let events: Vec<Result<ResponseEvent, ModelError>> = vec![
                Ok(ResponseEvent::ContentText("reply".into())),
                Ok(ResponseEvent::MessageEnd {
                    usage: Usage::new(5, 5),
                    stop_reason: StopReason::EndTurn,
                }),
            ];
            Ok(Box::pin(stream::iter(events)))
        }
    }

    #[tokio::test]
    async fn messages_queued_while_busy_drain_high_priority_first() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let provider = Arc::new(GatedProvider::new(Arc::clone(&gate)));
        let (agent, threads) =
            agent_with(provider, ToolRegistry::new(), AgentConfig::default(), None);
        let mut rx = agent.subscribe();

        let first = {
            let agent = Arc::clone(&agent);
            tokio::spawn(async move {
                agent.send_message("first", SendOptions::default()).await.unwrap();
            })
        };
        wait_for_state(&agent, AgentState::Thinking).await;

        agent.send_message("second", SendOptions::default()).await.unwrap();
        agent
            .send_message(
                "third",
                SendOptions {
                    priority: crate::MessagePriority::High,
                    ..SendOptions::default()
                },
            )
            .await
            .unwrap();
        agent.send_message("fourth", SendOptions::default()).await.unwrap();

        let stats = agent.queue_stats().await;
        assert_eq!(stats.queue_length, 3);
        assert_eq!(stats.high_priority_count, 1);

        gate.add_permits(1);
        first.await.unwrap();
        wait_for_state(&agent, AgentState::Idle).await;

        // Queue length grew 1 → 2 → 3 as the messages were enqueued.
        let mut queued_lengths = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let AgentEvent::MessageQueued { queue_length, .. } = ev {
                queued_lengths.push(queue_length);
            }
        }
        assert_eq!(queued_lengths, [1, 2, 3]);

        // Processed order: current turn, then high-priority, then the two
        // normal messages in submission order.
        let order: Vec<String> = threads
            .events(agent.thread_id())
            .unwrap()
            .into_iter()
            .filter_map(|e| match e.payload {
                EventPayload::UserMessage { text } => Some(text),
                _ => None,
            })
            .collect();
        assert_eq!(order, ["first", "third", "second", "fourth"]);
        assert_eq!(agent.queue_stats().await.queue_length, 0);
    }

    #[tokio::test]
    async fn explicit_queue_flag_defers_even_when_idle() {
        let provider = Arc::new(ScriptedMockProvider::always_text("x"));
        let (agent, threads) =
            agent_with(provider, ToolRegistry::new(), AgentConfig::default(), None);
        agent
            .send_message(
                "later",
                SendOptions {
                    queue: true,
                    ..SendOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(agent.queue_stats().await.queue_length, 1);
        assert_eq!(count_kind(&threads, agent.thread_id(), EventKind::UserMessage), 0);
    }

    // ── Scenario 6: auto-compaction with cooldown ─────────────────────────────

    #[tokio::test]
    async fn high_usage_triggers_exactly_one_compaction_within_cooldown() {
        // Two turns reporting 10k/12k usage with threshold 0.7: the first
        // compacts, the second lands inside the cooldown window.
        let heavy_usage = Usage {
            prompt_tokens: 9_990,
            completion_tokens: 10,
            total_tokens: 10_000,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
        };
        let heavy_script = |text: &str| {
            vec![
                ResponseEvent::MessageStart { input_tokens: 9_990 },
                ResponseEvent::ContentText(text.into()),
                ResponseEvent::MessageEnd {
                    usage: heavy_usage,
                    stop_reason: StopReason::EndTurn,
                },
            ]
        };
        let provider = Arc::new(ScriptedMockProvider::new(vec![
            heavy_script("turn one"),
            ScriptedMockProvider::text_script("a compact summary"),
            heavy_script("turn two"),
        ]));
        let config = AgentConfig {
            compaction_keep_recent: 2,
            ..AgentConfig::default()
        };
        let budget = TokenBudget::for_context_window(12_000).with_warning_threshold(0.7);
        let (agent, threads) =
            agent_with(provider, ToolRegistry::new(), config, Some(budget));
        let mut rx = agent.subscribe();

        // Seed enough history that the compactor has something to fold.
        for i in 0..8 {
            threads
                .append(
                    agent.thread_id(),
                    EventPayload::user_message(format!("earlier message {i}")),
                )
                .await
                .unwrap();
        }

        agent.send_message("turn 1", SendOptions::default()).await.unwrap();
        agent.send_message("turn 2", SendOptions::default()).await.unwrap();

        assert_eq!(
            count_kind(&threads, agent.thread_id(), EventKind::Compaction),
            1,
            "exactly one compaction across both turns"
        );
        let mut started = 0;
        let mut completed = 0;
        while let Ok(ev) = rx.try_recv() {
            match ev {
                AgentEvent::CompactionStarted => started += 1,
                AgentEvent::CompactionCompleted { .. } => completed += 1,
                _ => {}
            }
        }
        assert_eq!((started, completed), (1, 1));
    }

    #[tokio::test]
    async fn low_usage_never_compacts() {
        let provider = Arc::new(ScriptedMockProvider::new(vec![
            ScriptedMockProvider::text_script("a"),
            ScriptedMockProvider::text_script("b"),
        ]));
        let budget = TokenBudget::for_context_window(1_000_000);
        let (agent, threads) =
            agent_with(provider, ToolRegistry::new(), AgentConfig::default(), Some(budget));
        agent.send_message("one", SendOptions::default()).await.unwrap();
        agent.send_message("two", SendOptions::default()).await.unwrap();
        assert_eq!(count_kind(&threads, agent.thread_id(), EventKind::Compaction), 0);
    }

    // ── Cancellation ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn cancel_mid_thinking_ends_turn_without_new_events() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let provider = Arc::new(GatedProvider::new(Arc::clone(&gate)));
        let (agent, threads) =
            agent_with(provider, ToolRegistry::new(), AgentConfig::default(), None);

        let turn = {
            let agent = Arc::clone(&agent);
            tokio::spawn(async move {
                agent.send_message("slow one", SendOptions::default()).await
            })
        };
        wait_for_state(&agent, AgentState::Thinking).await;
        let before = threads.events(agent.thread_id()).unwrap().len();

        agent.cancel_current_turn().await;
        turn.await.unwrap().unwrap();
        wait_for_state(&agent, AgentState::Idle).await;

        let after = threads.events(agent.thread_id()).unwrap().len();
        assert_eq!(after, before, "no events may be appended after the cancel point");
        assert_eq!(
            count_kind(&threads, agent.thread_id(), EventKind::AgentMessage),
            0
        );
    }

    // ── Stop ──────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn stop_discards_queue_and_rejects_new_input() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let provider = Arc::new(GatedProvider::new(Arc::clone(&gate)));
        let (agent, threads) =
            agent_with(provider, ToolRegistry::new(), AgentConfig::default(), None);

        let turn = {
            let agent = Arc::clone(&agent);
            tokio::spawn(async move {
                agent.send_message("busy", SendOptions::default()).await
            })
        };
        wait_for_state(&agent, AgentState::Thinking).await;
        agent.send_message("queued-1", SendOptions::default()).await.unwrap();
        agent.send_message("queued-2", SendOptions::default()).await.unwrap();
        assert_eq!(agent.queue_stats().await.queue_length, 2);

        agent.stop().await;
        turn.await.unwrap().unwrap();

        assert_eq!(agent.queue_stats().await.queue_length, 0);
        assert_eq!(agent.state().await, AgentState::Stopped);
        // The dropped messages never became user-message events.
        let user_count = count_kind(&threads, agent.thread_id(), EventKind::UserMessage);
        assert_eq!(user_count, 1, "only the in-flight turn's message is in the log");
        assert!(agent
            .send_message("after stop", SendOptions::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn stopped_state_is_sticky() {
        let provider = Arc::new(ScriptedMockProvider::always_text("x"));
        let (agent, _) = agent_with(provider, ToolRegistry::new(), AgentConfig::default(), None);
        agent.stop().await;
        assert_eq!(agent.state().await, AgentState::Stopped);
        let _ = agent.send_message("ignored", SendOptions::default()).await;
        assert_eq!(agent.state().await, AgentState::Stopped);
    }

    // ── Approval plumbing edge cases ──────────────────────────────────────────

    #[tokio::test]
    async fn approval_without_pending_request_is_rejected() {
        let provider = Arc::new(ScriptedMockProvider::always_text("x"));
        let (agent, _) = agent_with(provider, ToolRegistry::new(), AgentConfig::default(), None);
        let err = agent
            .submit_approval("ghost-call", ApprovalDecision::AllowOnce)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no approval request pending"));
    }

    #[tokio::test]
    async fn unknown_tool_call_records_error_result_and_turn_continues() {
        let provider = Arc::new(ScriptedMockProvider::new(vec![
            text_and_tools_script("calling something odd", &[("u-1", "no_such_tool")]),
            ScriptedMockProvider::text_script("recovered"),
        ]));
        let (agent, threads) =
            agent_with(provider, ToolRegistry::new(), AgentConfig::default(), None);
        let approver = auto_approve(Arc::clone(&agent), ApprovalDecision::AllowOnce);
        agent.send_message("go", SendOptions::default()).await.unwrap();
        approver.abort();

        let id = agent.thread_id();
        let error_result = threads.events(id).unwrap().into_iter().any(|e| {
            matches!(
                e.payload,
                EventPayload::ToolResult { is_error: true, .. }
            )
        });
        assert!(error_result, "unknown tool must produce an error result");
        // The error did not halt the turn: the follow-up reply landed.
        let last_agent = threads
            .events(id)
            .unwrap()
            .into_iter()
            .rev()
            .find_map(|e| match e.payload {
                EventPayload::AgentMessage { text } => Some(text),
                _ => None,
            })
            .unwrap();
        assert_eq!(last_agent, "recovered");
    }
}
