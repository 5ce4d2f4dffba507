//! Core traits for chat handles and the collaborators the factory consumes.
//!
//! # Why Trait-Based Seams
//!
//! Every expensive or platform-specific concern sits behind a trait:
//! - [`ChatHandle`]: the opaque client object callers receive
//! - [`ProviderClientBuilder`]: per-platform construction of handles
//! - [`ConfigStore`]: named-configuration lookup
//!
//! This keeps the factory testable with scripted fakes (see
//! [`crate::providers::mock`]) and keeps transport details out of this crate.
//!
//! # Handle Surface
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  ChatHandle                                              │
//! ├──────────────────────────────────────────────────────────┤
//! │  complete(request)  ──► ChatResponse (single-shot)       │
//! │  stream(request)    ──► BoxStream<Result<ChatChunk>>     │
//! │  is_instrumented()  ──► wrap-once marker for accounting  │
//! └──────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::factory::Platform;
use crate::usage::TokenUsage;

/// Role of a chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instruction.
    System,
    /// End-user message.
    User,
    /// Model output fed back into the conversation.
    Assistant,
}

/// One message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author role.
    pub role: Role,

    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Request for a single-shot or streamed chat call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Ordered conversation messages.
    pub messages: Vec<ChatMessage>,
}

impl ChatRequest {
    /// Build a request from messages.
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self { messages }
    }

    /// Build a single-user-message request.
    pub fn from_user_text(text: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::user(text)],
        }
    }

    /// Concatenation of all non-blank message texts, newline-joined.
    ///
    /// This is the prompt text fed to the token estimator when a provider
    /// does not report usage itself.
    pub fn prompt_text(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.trim())
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Response from a single-shot chat call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Generated text.
    pub content: String,

    /// Model that produced the response.
    pub model: String,

    /// Token usage as reported by the provider, if any.
    ///
    /// `None`, or a usage whose total is zero, is treated as absent and
    /// triggers text-based estimation in the accounting layer.
    pub usage: Option<TokenUsage>,
}

impl ChatResponse {
    /// Create a response without reported usage.
    pub fn new(content: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model: model.into(),
            usage: None,
        }
    }

    /// Attach reported usage.
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// One element of a streamed response.
///
/// Providers may attach usage to any element; many attach it only to the
/// final one. The accounting layer keeps the latest valid report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChunk {
    /// Partial response text.
    pub content: String,

    /// Usage attached to this element, if the provider reports any.
    pub usage: Option<TokenUsage>,
}

impl ChatChunk {
    /// Create a content-only chunk.
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: text.into(),
            usage: None,
        }
    }

    /// Attach usage to this chunk.
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Lazy, finite, non-restartable sequence of streamed elements.
pub type ChatStream = BoxStream<'static, Result<ChatChunk>>;

/// Opaque client object performing single-shot or streamed model calls.
///
/// Handles are created once per distinct parameter set and cached by the
/// factory for process lifetime or until explicit removal.
#[async_trait]
pub trait ChatHandle: Send + Sync {
    /// Platform this handle talks to.
    fn platform(&self) -> Platform;

    /// Model this handle is bound to.
    fn model(&self) -> &str;

    /// Execute a single-shot call.
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse>;

    /// Start a streamed call.
    async fn stream(&self, request: &ChatRequest) -> Result<ChatStream>;

    /// Marker for the usage-accounting wrap guard.
    ///
    /// The decorator reports `true`; everything else inherits `false`. The
    /// factory checks this capability instead of downcasting, so a handle is
    /// never wrapped twice.
    fn is_instrumented(&self) -> bool {
        false
    }
}

/// Resolved connection parameters handed to a platform builder.
#[derive(Debug, Clone)]
pub struct ClientSpec {
    /// Target platform.
    pub platform: Platform,

    /// Raw secret, if the caller supplied one. Builders for platforms that
    /// require a secret fail with a configuration error when this is absent.
    pub secret: Option<String>,

    /// Endpoint override, if any.
    pub endpoint: Option<String>,

    /// Resolved model name (defaults already applied).
    pub model: String,

    /// Resolved sampling temperature (defaults already applied).
    pub temperature: f64,

    /// Top-K sampling cutoff, if requested.
    pub top_k: Option<u32>,
}

/// Per-platform capability that constructs a ready-to-use handle from
/// resolved parameters.
///
/// Construction runs synchronously inside the winning caller's at-most-once
/// path; builders must not retry internally.
#[async_trait]
pub trait ProviderClientBuilder: Send + Sync {
    /// Construct a handle for the given spec.
    async fn build(&self, spec: &ClientSpec) -> Result<std::sync::Arc<dyn ChatHandle>>;
}

/// External configuration store resolving a named configuration id to
/// connection parameters.
pub trait ConfigStore: Send + Sync {
    /// Resolve an id, or `None` when unknown.
    fn resolve(&self, id: &str) -> Option<crate::config::HandleConfig>;
}
