// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{CompletionRequest, ModelError, ModelProvider, ResponseStream};

/// Exponential backoff policy for transient provider failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    /// Fractional jitter applied to each delay (0.1 = ±10 %).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(1000),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before retry number `attempt` (1-based), jittered.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.factor.powi(attempt.saturating_sub(1) as i32);
        let raw = self.base_delay.as_millis() as f64 * exp;
        let capped = raw.min(self.max_delay.as_millis() as f64);
        let jittered = if self.jitter > 0.0 {
            let spread = capped * self.jitter;
            capped + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            capped
        };
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}

/// Observable retry lifecycle signals.
#[derive(Debug, Clone)]
pub enum RetrySignal {
    Attempt {
        attempt: u32,
        delay: Duration,
        error: String,
    },
    Exhausted {
        attempts: u32,
    },
}

/// Open a streaming completion with retry-on-transient-failure semantics.
///
/// Both connection failures and mid-stream errors are retried with
/// exponential backoff, but only while nothing has been emitted yet: the
/// first streamed delta latches `can_retry = false`, after which any error is
/// surfaced as-is (re-sending a half-consumed response would duplicate
/// output).  Aborts and non-retryable errors pass straight through.
///
/// The returned stream is fed through a bounded channel, so a slow consumer
/// suspends the provider stream instead of buffering it without limit.
pub fn streaming_with_retry(
    provider: Arc<dyn ModelProvider>,
    req: CompletionRequest,
    cancel: CancellationToken,
    policy: RetryPolicy,
    signals: Option<mpsc::UnboundedSender<RetrySignal>>,
) -> ResponseStream {
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        let mut attempt: u32 = 1;
        let mut can_retry = true;
        loop {
            let error = match provider
                .create_streaming_response(req.clone(), cancel.clone())
                .await
            {
                Ok(mut stream) => {
                    let mut failure = None;
                    while let Some(event) = stream.next().await {
                        match event {
                            Ok(ev) => {
                                if ev.is_content() {
                                    can_retry = false;
                                }
                                if tx.send(Ok(ev)).await.is_err() {
                                    // Consumer dropped the stream.
                                    return;
                                }
                            }
                            Err(e) => {
                                failure = Some(e);
                                break;
                            }
                        }
                    }
                    match failure {
                        None => return,
                        Some(e) => e,
                    }
                }
                Err(e) => e,
            };

            let give_up = !can_retry
                || !error.is_retryable()
                || attempt >= policy.max_attempts
                || cancel.is_cancelled();
            if give_up {
                if error.is_retryable() && can_retry && attempt >= policy.max_attempts {
                    warn!(attempts = attempt, "retry budget exhausted");
                    if let Some(s) = &signals {
                        let _ = s.send(RetrySignal::Exhausted { attempts: attempt });
                    }
                }
                let _ = tx.send(Err(error)).await;
                return;
            }

            let delay = policy.delay_for(attempt);
            debug!(attempt, ?delay, error = %error, "retrying model request");
            if let Some(s) = &signals {
                let _ = s.send(RetrySignal::Attempt {
                    attempt,
                    delay,
                    error: error.to_string(),
                });
            }
            attempt += 1;
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = tx.send(Err(ModelError::Aborted)).await;
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    });
    Box::pin(ReceiverStream::new(rx))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use futures::stream;

    use super::*;
    use crate::{ModelInfo, ProviderInfo, ResponseEvent, StopReason, Usage};

    // ── Backoff arithmetic ────────────────────────────────────────────────────

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let p = no_jitter();
        assert_eq!(p.delay_for(1), Duration::from_millis(1000));
        assert_eq!(p.delay_for(2), Duration::from_millis(2000));
        assert_eq!(p.delay_for(3), Duration::from_millis(4000));
    }

    #[test]
    fn delay_is_capped_at_max() {
        let p = no_jitter();
        assert_eq!(p.delay_for(10), Duration::from_secs(30));
        assert_eq!(p.delay_for(30), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let p = RetryPolicy::default();
        for _ in 0..100 {
            let d = p.delay_for(2).as_millis() as f64;
            assert!((1800.0..=2200.0).contains(&d), "delay out of band: {d}");
        }
    }

    // ── Retry behaviour ───────────────────────────────────────────────────────

    /// Fails with a retryable error `failures` times, then streams `text`.
    struct FlakyProvider {
        calls: AtomicU32,
        failures: u32,
        text: String,
    }

    impl FlakyProvider {
        fn new(failures: u32, text: &str) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures,
                text: text.into(),
            }
        }
    }

    #[async_trait]
    impl ModelProvider for FlakyProvider {
        fn model_info(&self) -> ModelInfo {
            ModelInfo {
                id: "flaky".into(),
                context_window: 1000,
                max_output_tokens: 100,
            }
        }
        fn provider_info(&self) -> ProviderInfo {
            ProviderInfo {
                id: "flaky".into(),
                display_name: "Flaky".into(),
            }
        }
        fn is_configured(&self) -> bool {
            true
        }
        async fn create_streaming_response(
            &self,
            _req: CompletionRequest,
            _cancel: CancellationToken,
        ) -> Result<ResponseStream, ModelError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(ModelError::from_status(503, "unavailable"));
            }
            let events: Vec<Result<ResponseEvent, ModelError>> = vec![
                Ok(ResponseEvent::ContentText(self.text.clone())),
                Ok(ResponseEvent::MessageEnd {
                    usage: Usage::new(1, 1),
                    stop_reason: StopReason::EndTurn,
                }),
            ];
            Ok(Box::pin(stream::iter(events)))
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: 0.0,
            ..RetryPolicy::default()
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let provider = Arc::new(FlakyProvider::new(2, "ok"));
        let (sig_tx, mut sig_rx) = mpsc::unbounded_channel();
        let mut stream = streaming_with_retry(
            provider.clone(),
            CompletionRequest::default(),
            CancellationToken::new(),
            fast_policy(10),
            Some(sig_tx),
        );
        let mut text = String::new();
        while let Some(ev) = stream.next().await {
            if let ResponseEvent::ContentText(t) = ev.unwrap() {
                text.push_str(&t);
            }
        }
        assert_eq!(text, "ok");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        // Two Attempt signals, no Exhausted.
        let mut attempts = 0;
        while let Ok(s) = sig_rx.try_recv() {
            match s {
                RetrySignal::Attempt { .. } => attempts += 1,
                RetrySignal::Exhausted { .. } => panic!("must not exhaust"),
            }
        }
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn exhausted_budget_surfaces_error_and_signal() {
        let provider = Arc::new(FlakyProvider::new(100, "never"));
        let (sig_tx, mut sig_rx) = mpsc::unbounded_channel();
        let mut stream = streaming_with_retry(
            provider,
            CompletionRequest::default(),
            CancellationToken::new(),
            fast_policy(3),
            Some(sig_tx),
        );
        let last = stream.next().await.unwrap();
        assert!(matches!(last, Err(ModelError::Http { status: 503, .. })));
        let mut exhausted = false;
        while let Ok(s) = sig_rx.try_recv() {
            if matches!(s, RetrySignal::Exhausted { attempts: 3 }) {
                exhausted = true;
            }
        }
        assert!(exhausted, "Exhausted signal must fire");
    }

    /// Emits one text delta and then fails; must NOT be retried.
    struct MidStreamFailure {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ModelProvider for MidStreamFailure {
        fn model_info(&self) -> ModelInfo {
            ModelInfo {
                id: "m".into(),
                context_window: 1000,
                max_output_tokens: 100,
            }
        }
        fn provider_info(&self) -> ProviderInfo {
            ProviderInfo {
                id: "m".into(),
                display_name: "M".into(),
            }
        }
        fn is_configured(&self) -> bool {
            true
        }
        async fn create_streaming_response(
            &self,
            _req: CompletionRequest,
            _cancel: CancellationToken,
        ) -> Result<ResponseStream, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let events: Vec<Result<ResponseEvent, ModelError>> = vec![
                Ok(ResponseEvent::ContentText("partial".into())),
                Err(ModelError::from_status(500, "boom")),
            ];
            Ok(Box::pin(stream::iter(events)))
        }
    }

    #[tokio::test]
    async fn no_retry_after_content_has_streamed() {
        let provider = Arc::new(MidStreamFailure {
            calls: AtomicU32::new(0),
        });
        let mut stream = streaming_with_retry(
            provider.clone(),
            CompletionRequest::default(),
            CancellationToken::new(),
            fast_policy(10),
            None,
        );
        let first = stream.next().await.unwrap().unwrap();
        assert!(matches!(first, ResponseEvent::ContentText(_)));
        let second = stream.next().await.unwrap();
        assert!(second.is_err(), "mid-stream failure must surface, not retry");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1, "exactly one attempt");
    }

    /// Always fails with a non-retryable auth error.
    struct AuthFailure;

    #[async_trait]
    impl ModelProvider for AuthFailure {
        fn model_info(&self) -> ModelInfo {
            ModelInfo {
                id: "a".into(),
                context_window: 1000,
                max_output_tokens: 100,
            }
        }
        fn provider_info(&self) -> ProviderInfo {
            ProviderInfo {
                id: "a".into(),
                display_name: "A".into(),
            }
        }
        fn is_configured(&self) -> bool {
            false
        }
        async fn create_streaming_response(
            &self,
            _req: CompletionRequest,
            _cancel: CancellationToken,
        ) -> Result<ResponseStream, ModelError> {
            Err(ModelError::from_status(401, "bad key"))
        }
    }

    #[tokio::test]
    async fn auth_errors_fail_immediately() {
        let mut stream = streaming_with_retry(
            Arc::new(AuthFailure),
            CompletionRequest::default(),
            CancellationToken::new(),
            fast_policy(10),
            None,
        );
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, ModelError::Auth(_)));
    }
}
