//! modelpool - Pooled LLM Chat Handles with Usage Accounting
//!
//! This crate lazily builds and caches expensive, provider-specific chat
//! client handles keyed by connection parameters, guarantees at-most-one
//! construction per distinct key under concurrent access, and transparently
//! measures token consumption for single-shot and streamed calls, falling
//! back to text-based estimation when a provider does not report usage.
//!
//! # Architecture
//!
//! | Component | Module | Responsibility |
//! |-----------|--------|----------------|
//! | `HandleFactory` | [`factory`] | Defaults, keys, at-most-once construction, dispatch |
//! | `SecretHasher` | [`key`] | Bounded memoized SHA-256 digests for cache keys |
//! | `InstrumentedHandle` | [`accounting`] | Usage extraction/estimation, fire-and-forget recording |
//! | `TokenEstimator` | [`estimator`] | Text-to-token counts (tiktoken) |
//! | `UsageRecorder` | [`usage`] | Pluggable sink for usage records |
//! | `ConfigStore` | [`config`] | Named-configuration resolution |
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use modelpool::{HandleFactory, HandleParams, Platform};
//!
//! let factory = HandleFactory::builder()
//!     .with_builder(Platform::OpenAi, Arc::new(my_openai_builder))
//!     .with_recorder(Arc::new(my_recorder))
//!     .build();
//!
//! let handle = factory
//!     .get_or_create(
//!         HandleParams::platform(Platform::OpenAi)
//!             .with_secret(api_key)
//!             .with_model("gpt-4o-mini"),
//!     )
//!     .await?;
//!
//! let response = handle.complete(&request).await?;
//! ```
//!
//! # Concurrency model
//!
//! - Construction for a given key happens at most once; contenders block
//!   only on that key, and distinct keys build fully concurrently.
//! - Usage recording runs on detached tasks with no ordering guarantee and
//!   no cancellation; recorder failures are logged and swallowed.
//! - Stream accounting observes elements without altering delivery order,
//!   backpressure, or cancellation.

pub mod accounting;
pub mod config;
pub mod error;
pub mod estimator;
pub mod factory;
pub mod key;
pub mod providers;
pub mod traits;
pub mod usage;

pub use accounting::{InstrumentedHandle, MIN_SAMPLE_CHARS, SAMPLE_CHAR_CAP};
pub use config::{HandleConfig, StaticConfigStore};
pub use error::{FactoryError, Result};
pub use estimator::{CharHeuristicEstimator, TiktokenEstimator, TokenEstimator};
pub use factory::{HandleFactory, HandleFactoryBuilder, HandleParams, Platform, DEFAULT_TEMPERATURE};
pub use key::{HandleKey, SecretHasher};
pub use traits::{
    ChatChunk, ChatHandle, ChatMessage, ChatRequest, ChatResponse, ChatStream, ClientSpec,
    ConfigStore, ProviderClientBuilder, Role,
};
pub use usage::{
    MemoryUsageRecorder, TokenUsage, TracingUsageRecorder, UsageContext, UsageRecorder,
    UsageTotals,
};
