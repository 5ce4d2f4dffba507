//! Deterministic mock handle and builder for testing.
//!
//! [`MockHandle`] serves queued responses and scripted chunk sequences with
//! no network involved. [`MockBuilder`] constructs mock handles while
//! counting invocations, optionally failing the first N builds or stalling
//! inside `build` — exactly the knobs the factory's at-most-once and
//! retry-after-failure properties need.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use crate::error::{FactoryError, Result};
use crate::factory::Platform;
use crate::traits::{
    ChatChunk, ChatHandle, ChatRequest, ChatResponse, ChatStream, ClientSpec,
    ProviderClientBuilder,
};

/// Mock chat handle with queue-based scripted behavior.
#[derive(Debug)]
pub struct MockHandle {
    platform: Platform,
    model: String,
    responses: Mutex<VecDeque<ChatResponse>>,
    streams: Mutex<VecDeque<Vec<ChatChunk>>>,
    call_count: AtomicUsize,
}

impl MockHandle {
    /// Create a mock handle for a platform and model.
    pub fn new(platform: Platform, model: impl Into<String>) -> Self {
        Self {
            platform,
            model: model.into(),
            responses: Mutex::new(VecDeque::new()),
            streams: Mutex::new(VecDeque::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    /// Queue a single-shot response.
    pub fn push_response(&self, response: ChatResponse) {
        self.responses
            .lock()
            .expect("mock responses lock")
            .push_back(response);
    }

    /// Queue a scripted stream.
    pub fn push_stream(&self, chunks: Vec<ChatChunk>) {
        self.streams
            .lock()
            .expect("mock streams lock")
            .push_back(chunks);
    }

    /// Number of `complete`/`stream` calls served so far.
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ChatHandle for MockHandle {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, _request: &ChatRequest) -> Result<ChatResponse> {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        let queued = self
            .responses
            .lock()
            .expect("mock responses lock")
            .pop_front();
        Ok(queued.unwrap_or_else(|| ChatResponse::new("mock response", self.model.clone())))
    }

    async fn stream(&self, _request: &ChatRequest) -> Result<ChatStream> {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        let chunks = self
            .streams
            .lock()
            .expect("mock streams lock")
            .pop_front()
            .unwrap_or_default();
        Ok(stream::iter(chunks.into_iter().map(Ok)).boxed())
    }
}

/// Builder producing [`MockHandle`]s while exposing construction telemetry.
#[derive(Debug, Default)]
pub struct MockBuilder {
    requires_secret: bool,
    build_delay: Option<Duration>,
    fail_builds: AtomicUsize,
    build_count: AtomicUsize,
}

impl MockBuilder {
    /// Create a builder that accepts any spec.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail builds when the spec carries no secret, like cloud platforms do.
    pub fn with_required_secret(mut self) -> Self {
        self.requires_secret = true;
        self
    }

    /// Stall inside `build` to widen race windows in concurrency tests.
    pub fn with_build_delay(mut self, delay: Duration) -> Self {
        self.build_delay = Some(delay);
        self
    }

    /// Make the next `n` builds fail with a provider error.
    pub fn with_failing_builds(self, n: usize) -> Self {
        self.fail_builds.store(n, Ordering::SeqCst);
        self
    }

    /// Number of times `build` has been invoked.
    pub fn build_count(&self) -> usize {
        self.build_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderClientBuilder for MockBuilder {
    async fn build(&self, spec: &ClientSpec) -> Result<Arc<dyn ChatHandle>> {
        if self.requires_secret && spec.secret.as_deref().map_or(true, |s| s.trim().is_empty()) {
            return Err(FactoryError::Config(format!(
                "secret required for platform {}",
                spec.platform.as_str()
            )));
        }

        self.build_count.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.build_delay {
            tokio::time::sleep(delay).await;
        }

        let remaining = self.fail_builds.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_builds.store(remaining - 1, Ordering::SeqCst);
            return Err(FactoryError::Provider("scripted build failure".to_string()));
        }

        Ok(Arc::new(MockHandle::new(spec.platform, spec.model.clone())))
    }
}
