//! Token usage accounting types and recording sinks.
//!
//! Every completed call or stream produces at most one [`UsageContext`],
//! which is handed to a [`UsageRecorder`] on a detached task and then
//! dropped. The factory never retains usage data itself.
//!
//! # Recorders
//!
//! - [`TracingUsageRecorder`]: emits one structured log line per record
//! - [`MemoryUsageRecorder`]: in-process buffer with aggregate totals,
//!   useful for tests and session-level reporting

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::factory::Platform;

/// Prompt/completion/total token counts for one call or stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt.
    pub prompt_tokens: u64,

    /// Tokens in the completion.
    pub completion_tokens: u64,

    /// Total tokens billed.
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Create usage from prompt and completion counts; total is the sum.
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// A reported usage counts only when its total is present and positive.
    /// Zero or missing totals fall through to the estimation path.
    pub fn is_valid(&self) -> bool {
        self.total_tokens > 0
    }
}

/// One accounting record: which platform and model consumed which tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageContext {
    /// Platform that served the call.
    pub platform: Platform,

    /// Model name used for the call.
    pub model: String,

    /// Token counts, reported or estimated.
    pub usage: TokenUsage,
}

impl UsageContext {
    /// Create a new usage context.
    pub fn new(platform: Platform, model: impl Into<String>, usage: TokenUsage) -> Self {
        Self {
            platform,
            model: model.into(),
            usage,
        }
    }
}

/// Sink that persists or reports a usage record.
///
/// Implementations must be safe to call concurrently from many independent,
/// short-lived tasks. Failures are the recorder's own concern: the decorator
/// fires and forgets, so nothing a recorder does can surface back to the
/// caller of the instrumented handle.
#[async_trait]
pub trait UsageRecorder: Send + Sync {
    /// Record one usage context.
    async fn record(&self, ctx: UsageContext);
}

/// Recorder that logs each usage record through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingUsageRecorder;

#[async_trait]
impl UsageRecorder for TracingUsageRecorder {
    async fn record(&self, ctx: UsageContext) {
        info!(
            platform = ctx.platform.as_str(),
            model = %ctx.model,
            prompt_tokens = ctx.usage.prompt_tokens,
            completion_tokens = ctx.usage.completion_tokens,
            total_tokens = ctx.usage.total_tokens,
            "[usage] recorded"
        );
    }
}

/// Aggregate totals across everything a [`MemoryUsageRecorder`] has seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageTotals {
    /// Total prompt tokens.
    pub prompt_tokens: u64,
    /// Total completion tokens.
    pub completion_tokens: u64,
    /// Total tokens.
    pub total_tokens: u64,
    /// Number of records.
    pub records: usize,
    /// Total tokens broken down by model name.
    pub by_model: HashMap<String, u64>,
}

/// In-memory recorder for tests and in-process session reporting.
#[derive(Debug, Default)]
pub struct MemoryUsageRecorder {
    records: Mutex<Vec<UsageContext>>,
}

impl MemoryUsageRecorder {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all records seen so far.
    pub fn records(&self) -> Vec<UsageContext> {
        self.records.lock().expect("usage records lock").clone()
    }

    /// Number of records seen so far.
    pub fn len(&self) -> usize {
        self.records.lock().expect("usage records lock").len()
    }

    /// True when nothing has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aggregate totals across all records.
    pub fn totals(&self) -> UsageTotals {
        let records = self.records.lock().expect("usage records lock");
        let mut totals = UsageTotals::default();
        for ctx in records.iter() {
            totals.prompt_tokens += ctx.usage.prompt_tokens;
            totals.completion_tokens += ctx.usage.completion_tokens;
            totals.total_tokens += ctx.usage.total_tokens;
            totals.records += 1;
            *totals.by_model.entry(ctx.model.clone()).or_default() += ctx.usage.total_tokens;
        }
        totals
    }

    /// Drop all records.
    pub fn clear(&self) {
        self.records.lock().expect("usage records lock").clear();
    }
}

#[async_trait]
impl UsageRecorder for MemoryUsageRecorder {
    async fn record(&self, ctx: UsageContext) {
        self.records.lock().expect("usage records lock").push(ctx);
    }
}
