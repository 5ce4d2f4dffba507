//! Transparent token usage accounting for chat handles.
//!
//! [`InstrumentedHandle`] wraps a [`ChatHandle`] and intercepts both call
//! shapes. The delegate's behavior is untouched: elements of a streamed
//! response are forwarded in order with the delegate's own backpressure and
//! cancellation, and recording happens on detached tasks that can neither
//! block nor fail the caller.
//!
//! # Per-call flow
//!
//! ```text
//! caller ──► InstrumentedHandle ──► delegate ChatHandle
//!                    │
//!                    ├─ reported usage valid? ── yes ──► record(usage)
//!                    └─ no ──► estimate(prompt text, response text) ─► record
//! ```
//!
//! For streams, a reported usage on any element wins over estimation; when
//! nothing is reported, response text is sampled into a bounded buffer and
//! estimated at completion. Sampling is prefix-only: once the cap is hit,
//! later text is dropped from the sample while the true observed length is
//! still tracked.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::error::Result;
use crate::estimator::TokenEstimator;
use crate::factory::Platform;
use crate::traits::{ChatChunk, ChatHandle, ChatRequest, ChatResponse, ChatStream};
use crate::usage::{TokenUsage, UsageContext, UsageRecorder};

/// Cap on sampled response text per stream, in characters.
pub const SAMPLE_CHAR_CAP: usize = 100_000;

/// Minimum sampled length before a stream estimate is worth recording.
pub const MIN_SAMPLE_CHARS: usize = 1_000;

/// Decorator that measures token consumption of every call on a handle.
pub struct InstrumentedHandle {
    inner: Arc<dyn ChatHandle>,
    estimator: Arc<dyn TokenEstimator>,
    recorder: Arc<dyn UsageRecorder>,
    estimate_when_missing: bool,
}

impl InstrumentedHandle {
    /// Wrap `inner` with usage accounting.
    ///
    /// Idempotent: a handle that already reports `is_instrumented()` is
    /// returned unchanged, so double wrapping cannot happen.
    pub fn wrap(
        inner: Arc<dyn ChatHandle>,
        estimator: Arc<dyn TokenEstimator>,
        recorder: Arc<dyn UsageRecorder>,
        estimate_when_missing: bool,
    ) -> Arc<dyn ChatHandle> {
        if inner.is_instrumented() {
            return inner;
        }
        Arc::new(Self {
            inner,
            estimator,
            recorder,
            estimate_when_missing,
        })
    }

    fn spawn_record(&self, usage: TokenUsage, model: String) {
        let recorder = Arc::clone(&self.recorder);
        let platform = self.inner.platform();
        spawn_detached(async move {
            recorder.record(UsageContext::new(platform, model, usage)).await;
        });
    }

    fn spawn_estimate_and_record(&self, prompt_text: String, response_text: String, model: String) {
        let recorder = Arc::clone(&self.recorder);
        let estimator = Arc::clone(&self.estimator);
        let platform = self.inner.platform();
        spawn_detached(async move {
            let prompt_tokens = estimator.estimate(&prompt_text);
            let completion_tokens = estimator.estimate(&response_text);
            let usage = TokenUsage::new(prompt_tokens, completion_tokens);
            recorder.record(UsageContext::new(platform, model, usage)).await;
        });
    }
}

/// Spawn a fire-and-forget accounting task.
///
/// When no runtime is available (handle dropped outside tokio) the record is
/// skipped with a log line instead of panicking; accounting must never take
/// the primary path down with it.
fn spawn_detached<F>(fut: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(fut);
        }
        Err(_) => {
            warn!("no tokio runtime available, usage record dropped");
        }
    }
}

#[async_trait]
impl ChatHandle for InstrumentedHandle {
    fn platform(&self) -> Platform {
        self.inner.platform()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    fn is_instrumented(&self) -> bool {
        true
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let response = self.inner.complete(request).await?;

        match response.usage {
            Some(usage) if usage.is_valid() => {
                self.spawn_record(usage, response.model.clone());
            }
            _ if self.estimate_when_missing => {
                self.spawn_estimate_and_record(
                    request.prompt_text(),
                    response.content.clone(),
                    response.model.clone(),
                );
            }
            _ => {
                debug!(model = %response.model, "no reported usage and estimation disabled");
            }
        }

        Ok(response)
    }

    async fn stream(&self, request: &ChatRequest) -> Result<ChatStream> {
        let inner = self.inner.stream(request).await?;
        let probe = StreamUsageProbe {
            inner,
            state: Some(ProbeState {
                platform: self.inner.platform(),
                model: self.inner.model().to_string(),
                prompt_text: request.prompt_text(),
                estimator: Arc::clone(&self.estimator),
                recorder: Arc::clone(&self.recorder),
                estimate_when_missing: self.estimate_when_missing,
                captured: None,
                sample: String::new(),
                sampled_chars: 0,
                observed_chars: 0,
            }),
        };
        Ok(probe.boxed())
    }
}

/// Accounting state carried alongside a streamed response.
///
/// Two independent progressions per stream: `captured` moves from none to
/// the latest valid report (later valid reports replace earlier ones), and
/// sampling runs open until the character cap closes it.
struct ProbeState {
    platform: Platform,
    model: String,
    prompt_text: String,
    estimator: Arc<dyn TokenEstimator>,
    recorder: Arc<dyn UsageRecorder>,
    estimate_when_missing: bool,
    captured: Option<TokenUsage>,
    sample: String,
    sampled_chars: usize,
    observed_chars: u64,
}

impl ProbeState {
    fn observe(&mut self, chunk: &ChatChunk) {
        if let Some(usage) = chunk.usage {
            if usage.is_valid() {
                self.captured = Some(usage);
            }
        }

        if self.estimate_when_missing && self.captured.is_none() {
            self.observed_chars += chunk.content.chars().count() as u64;
            if self.sampled_chars < SAMPLE_CHAR_CAP {
                let room = SAMPLE_CHAR_CAP - self.sampled_chars;
                let taken: String = chunk.content.chars().take(room).collect();
                self.sampled_chars += taken.chars().count();
                self.sample.push_str(&taken);
            }
        }
    }

    /// Record what this stream consumed. Runs once; the state is consumed.
    fn finalize(self) {
        if let Some(usage) = self.captured {
            let recorder = self.recorder;
            let platform = self.platform;
            let model = self.model;
            spawn_detached(async move {
                recorder.record(UsageContext::new(platform, model, usage)).await;
            });
        } else if self.estimate_when_missing && self.sampled_chars >= MIN_SAMPLE_CHARS {
            let ProbeState {
                platform,
                model,
                prompt_text,
                estimator,
                recorder,
                sample,
                observed_chars,
                ..
            } = self;
            debug!(
                sampled_chars = sample.len(),
                observed_chars, "estimating stream usage from sampled text"
            );
            spawn_detached(async move {
                let prompt_tokens = estimator.estimate(&prompt_text);
                let completion_tokens = estimator.estimate(&sample);
                let usage = TokenUsage::new(prompt_tokens, completion_tokens);
                recorder.record(UsageContext::new(platform, model, usage)).await;
            });
        } else {
            debug!(
                model = %self.model,
                sampled_chars = self.sampled_chars,
                "stream ended without recordable usage"
            );
        }
    }
}

/// Stream adapter that forwards elements untouched while accounting on the
/// side. Flow control is the delegate's: this adapter never buffers,
/// reorders, or delays elements.
struct StreamUsageProbe {
    inner: ChatStream,
    state: Option<ProbeState>,
}

impl Stream for StreamUsageProbe {
    type Item = Result<ChatChunk>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(state) = this.state.as_mut() {
                    state.observe(&chunk);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => {
                if let Some(state) = this.state.take() {
                    state.finalize();
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for StreamUsageProbe {
    fn drop(&mut self) {
        // Cancelled mid-stream: account for what was observed so far.
        if let Some(state) = self.state.take() {
            state.finalize();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::CharHeuristicEstimator;
    use crate::providers::mock::MockHandle;
    use crate::usage::MemoryUsageRecorder;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Estimator that records every input length it was asked about.
    struct LengthCapturingEstimator {
        inputs: Mutex<Vec<usize>>,
    }

    impl LengthCapturingEstimator {
        fn new() -> Self {
            Self {
                inputs: Mutex::new(Vec::new()),
            }
        }

        fn inputs(&self) -> Vec<usize> {
            self.inputs.lock().unwrap().clone()
        }
    }

    impl TokenEstimator for LengthCapturingEstimator {
        fn estimate(&self, text: &str) -> u64 {
            self.inputs.lock().unwrap().push(text.chars().count());
            text.chars().count() as u64
        }
    }

    async fn wait_for_records(recorder: &MemoryUsageRecorder, expected: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while recorder.len() < expected {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("recorder never reached expected count");
    }

    fn instrumented(
        handle: MockHandle,
        estimator: Arc<dyn TokenEstimator>,
        recorder: Arc<MemoryUsageRecorder>,
        estimate: bool,
    ) -> Arc<dyn ChatHandle> {
        InstrumentedHandle::wrap(Arc::new(handle), estimator, recorder, estimate)
    }

    #[tokio::test]
    async fn test_single_shot_reported_usage_recorded_verbatim() {
        let recorder = Arc::new(MemoryUsageRecorder::new());
        let handle = MockHandle::new(Platform::Mock, "mock-1");
        handle.push_response(ChatResponse::new("ok", "mock-1").with_usage(TokenUsage {
            prompt_tokens: 30,
            completion_tokens: 20,
            total_tokens: 50,
        }));

        let wrapped = instrumented(
            handle,
            Arc::new(CharHeuristicEstimator),
            Arc::clone(&recorder),
            true,
        );
        wrapped
            .complete(&ChatRequest::from_user_text("hi"))
            .await
            .unwrap();

        wait_for_records(&recorder, 1).await;
        let records = recorder.records();
        assert_eq!(records[0].usage.total_tokens, 50);
        assert_eq!(records[0].usage.prompt_tokens, 30);
    }

    #[tokio::test]
    async fn test_single_shot_zero_total_falls_back_to_estimation() {
        let recorder = Arc::new(MemoryUsageRecorder::new());
        let handle = MockHandle::new(Platform::Mock, "mock-1");
        handle.push_response(
            ChatResponse::new("four", "mock-1").with_usage(TokenUsage::default()),
        );

        let wrapped = instrumented(
            handle,
            Arc::new(CharHeuristicEstimator),
            Arc::clone(&recorder),
            true,
        );
        wrapped
            .complete(&ChatRequest::from_user_text("12345678"))
            .await
            .unwrap();

        wait_for_records(&recorder, 1).await;
        let usage = recorder.records()[0].usage;
        // prompt "12345678" -> 2 tokens, response "four" -> 1 token
        assert_eq!(usage.prompt_tokens, 2);
        assert_eq!(usage.completion_tokens, 1);
        assert_eq!(usage.total_tokens, 3);
    }

    #[tokio::test]
    async fn test_single_shot_missing_usage_estimation_disabled_records_nothing() {
        let recorder = Arc::new(MemoryUsageRecorder::new());
        let handle = MockHandle::new(Platform::Mock, "mock-1");
        handle.push_response(ChatResponse::new("ok", "mock-1"));

        let wrapped = instrumented(
            handle,
            Arc::new(CharHeuristicEstimator),
            Arc::clone(&recorder),
            false,
        );
        wrapped
            .complete(&ChatRequest::from_user_text("hi"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(recorder.is_empty());
    }

    #[tokio::test]
    async fn test_stream_reported_usage_wins_over_estimation() {
        let recorder = Arc::new(MemoryUsageRecorder::new());
        let handle = MockHandle::new(Platform::Mock, "mock-1");
        handle.push_stream(vec![
            ChatChunk::content("a".repeat(2_000)),
            ChatChunk::content("middle").with_usage(TokenUsage::new(11, 7)),
            ChatChunk::content("tail"),
        ]);

        let wrapped = instrumented(
            handle,
            Arc::new(CharHeuristicEstimator),
            Arc::clone(&recorder),
            true,
        );
        let mut stream = wrapped
            .stream(&ChatRequest::from_user_text("hi"))
            .await
            .unwrap();
        let mut seen = Vec::new();
        while let Some(chunk) = stream.next().await {
            seen.push(chunk.unwrap().content);
        }
        drop(stream);

        // Delivery order and content are untouched.
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2], "tail");

        wait_for_records(&recorder, 1).await;
        let records = recorder.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].usage.total_tokens, 18);
        assert_eq!(records[0].usage.prompt_tokens, 11);
    }

    #[tokio::test]
    async fn test_stream_later_valid_report_replaces_earlier() {
        let recorder = Arc::new(MemoryUsageRecorder::new());
        let handle = MockHandle::new(Platform::Mock, "mock-1");
        handle.push_stream(vec![
            ChatChunk::content("x").with_usage(TokenUsage::new(1, 1)),
            ChatChunk::content("y").with_usage(TokenUsage::new(100, 50)),
            ChatChunk::content("z").with_usage(TokenUsage::default()),
        ]);

        let wrapped = instrumented(
            handle,
            Arc::new(CharHeuristicEstimator),
            Arc::clone(&recorder),
            true,
        );
        let mut stream = wrapped
            .stream(&ChatRequest::from_user_text("hi"))
            .await
            .unwrap();
        while stream.next().await.is_some() {}
        drop(stream);

        wait_for_records(&recorder, 1).await;
        // The invalid trailing report does not erase the captured one.
        assert_eq!(recorder.records()[0].usage.total_tokens, 150);
    }

    #[tokio::test]
    async fn test_stream_estimated_from_sampled_text() {
        let recorder = Arc::new(MemoryUsageRecorder::new());
        let handle = MockHandle::new(Platform::Mock, "mock-1");
        handle.push_stream(vec![
            ChatChunk::content("a".repeat(1_500)),
            ChatChunk::content("b".repeat(500)),
        ]);

        let wrapped = instrumented(
            handle,
            Arc::new(CharHeuristicEstimator),
            Arc::clone(&recorder),
            true,
        );
        let mut stream = wrapped
            .stream(&ChatRequest::from_user_text("p".repeat(40)))
            .await
            .unwrap();
        while stream.next().await.is_some() {}
        drop(stream);

        wait_for_records(&recorder, 1).await;
        let usage = recorder.records()[0].usage;
        // prompt 40 chars -> 10 tokens, sampled 2000 chars -> 500 tokens
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 500);
    }

    #[tokio::test]
    async fn test_stream_sample_truncated_at_cap() {
        let recorder = Arc::new(MemoryUsageRecorder::new());
        let estimator = Arc::new(LengthCapturingEstimator::new());
        let handle = MockHandle::new(Platform::Mock, "mock-1");
        // Three chunks totalling well past the cap.
        handle.push_stream(vec![
            ChatChunk::content("a".repeat(60_000)),
            ChatChunk::content("b".repeat(60_000)),
            ChatChunk::content("c".repeat(10_000)),
        ]);

        let wrapped = InstrumentedHandle::wrap(
            Arc::new(handle),
            estimator.clone(),
            recorder.clone(),
            true,
        );
        let mut stream = wrapped
            .stream(&ChatRequest::from_user_text("prompt"))
            .await
            .unwrap();
        while stream.next().await.is_some() {}
        drop(stream);

        wait_for_records(&recorder, 1).await;
        let inputs = estimator.inputs();
        // Estimator saw the prompt and exactly the first cap characters.
        assert!(inputs.contains(&SAMPLE_CHAR_CAP));
        assert!(inputs.contains(&"prompt".len()));
    }

    #[tokio::test]
    async fn test_stream_below_threshold_records_nothing() {
        let recorder = Arc::new(MemoryUsageRecorder::new());
        let handle = MockHandle::new(Platform::Mock, "mock-1");
        handle.push_stream(vec![ChatChunk::content("short answer")]);

        let wrapped = instrumented(
            handle,
            Arc::new(CharHeuristicEstimator),
            Arc::clone(&recorder),
            true,
        );
        let mut stream = wrapped
            .stream(&ChatRequest::from_user_text("hi"))
            .await
            .unwrap();
        while stream.next().await.is_some() {}
        drop(stream);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(recorder.is_empty());
    }

    #[tokio::test]
    async fn test_stream_estimation_disabled_records_nothing() {
        let recorder = Arc::new(MemoryUsageRecorder::new());
        let handle = MockHandle::new(Platform::Mock, "mock-1");
        handle.push_stream(vec![ChatChunk::content("a".repeat(5_000))]);

        let wrapped = instrumented(
            handle,
            Arc::new(CharHeuristicEstimator),
            Arc::clone(&recorder),
            false,
        );
        let mut stream = wrapped
            .stream(&ChatRequest::from_user_text("hi"))
            .await
            .unwrap();
        while stream.next().await.is_some() {}
        drop(stream);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(recorder.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_stream_with_captured_usage_still_records() {
        let recorder = Arc::new(MemoryUsageRecorder::new());
        let handle = MockHandle::new(Platform::Mock, "mock-1");
        handle.push_stream(vec![
            ChatChunk::content("x").with_usage(TokenUsage::new(4, 6)),
            ChatChunk::content("never consumed"),
        ]);

        let wrapped = instrumented(
            handle,
            Arc::new(CharHeuristicEstimator),
            Arc::clone(&recorder),
            true,
        );
        let mut stream = wrapped
            .stream(&ChatRequest::from_user_text("hi"))
            .await
            .unwrap();
        let _ = stream.next().await;
        drop(stream);

        wait_for_records(&recorder, 1).await;
        assert_eq!(recorder.records()[0].usage.total_tokens, 10);
    }

    #[tokio::test]
    async fn test_wrap_is_idempotent() {
        let recorder: Arc<MemoryUsageRecorder> = Arc::new(MemoryUsageRecorder::new());
        let estimator: Arc<dyn TokenEstimator> = Arc::new(CharHeuristicEstimator);
        let inner: Arc<dyn ChatHandle> = Arc::new(MockHandle::new(Platform::Mock, "mock-1"));

        let once = InstrumentedHandle::wrap(
            inner,
            Arc::clone(&estimator),
            recorder.clone(),
            true,
        );
        let twice =
            InstrumentedHandle::wrap(Arc::clone(&once), estimator, recorder, true);

        assert!(once.is_instrumented());
        assert!(Arc::ptr_eq(&once, &twice));
    }
}
