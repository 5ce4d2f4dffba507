//! Handle factory: lazy, concurrency-safe pooling of provider clients.
//!
//! # Architecture
//!
//! ```text
//! caller ──► HandleFactory::get_or_create(params)
//!               │
//!               ├─ all overrides absent ──► pre-wired default handle
//!               │
//!               ├─ resolve defaults, digest secret ──► HandleKey
//!               │
//!               ├─ cache hit ──► shared Arc<dyn ChatHandle>
//!               │
//!               └─ cache miss ──► per-key OnceCell
//!                       │   (one winner builds, losers await and share)
//!                       ▼
//!                  ProviderClientBuilder::build(spec)
//!                       │
//!                       ▼
//!                  InstrumentedHandle::wrap  ──► cache insert ──► return
//! ```
//!
//! Construction happens at most once per distinct key even under
//! contention; contenders for the same key wait only on that key's
//! construction, never on unrelated keys, and a failed build leaves the
//! cache empty so the next caller retries from scratch.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{OnceCell, RwLock};
use tracing::debug;

use crate::accounting::InstrumentedHandle;
use crate::error::{FactoryError, Result};
use crate::estimator::{TiktokenEstimator, TokenEstimator};
use crate::key::{HandleKey, SecretHasher, DEFAULT_MEMO_CAP};
use crate::traits::{ChatHandle, ClientSpec, ConfigStore, ProviderClientBuilder};
use crate::usage::{TracingUsageRecorder, UsageRecorder};

/// Sampling temperature applied when the caller supplies none.
pub const DEFAULT_TEMPERATURE: f64 = 0.7;

/// Closed set of supported model platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// OpenAI chat API.
    OpenAi,
    /// Anthropic Claude models.
    Anthropic,
    /// Google Gemini.
    Gemini,
    /// Local Ollama server (no secret required).
    Ollama,
    /// Azure OpenAI. Clients for this platform are managed by the host
    /// application; parameterized construction is not supported.
    Azure,
    /// Deterministic mock for tests.
    Mock,
}

impl Platform {
    /// Parse a platform tag, case-insensitively, with common aliases.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Some(Self::OpenAi),
            "anthropic" | "claude" => Some(Self::Anthropic),
            "gemini" | "google" => Some(Self::Gemini),
            "ollama" => Some(Self::Ollama),
            "azure" | "azure-openai" => Some(Self::Azure),
            "mock" => Some(Self::Mock),
            _ => None,
        }
    }

    /// Stable lowercase tag for logs and serialization.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
            Self::Ollama => "ollama",
            Self::Azure => "azure",
            Self::Mock => "mock",
        }
    }

    /// Model name applied when the caller supplies none.
    pub fn default_model(&self) -> &'static str {
        match self {
            Self::OpenAi | Self::Azure => "gpt-4o-mini",
            Self::Anthropic => "claude-3-5-haiku-latest",
            Self::Gemini => "gemini-2.0-flash",
            Self::Ollama => "llama3.1",
            Self::Mock => "mock-model",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied parameters for one handle lookup.
///
/// Every field except the platform is optional; an all-absent parameter set
/// selects the platform's pre-wired default handle without building a key.
#[derive(Debug, Clone)]
pub struct HandleParams {
    /// Target platform.
    pub platform: Platform,
    /// Secret, if the platform needs one.
    pub secret: Option<String>,
    /// Endpoint override.
    pub endpoint: Option<String>,
    /// Model override.
    pub model: Option<String>,
    /// Temperature override.
    pub temperature: Option<f64>,
    /// Top-K cutoff.
    pub top_k: Option<u32>,
}

impl HandleParams {
    /// Parameters with no overrides, selecting the platform default.
    pub fn platform(platform: Platform) -> Self {
        Self {
            platform,
            secret: None,
            endpoint: None,
            model: None,
            temperature: None,
            top_k: None,
        }
    }

    /// Set the secret.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Set the endpoint override.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Set the model override.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the temperature override.
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the top-K cutoff.
    pub fn with_top_k(mut self, top_k: u32) -> Self {
        self.top_k = Some(top_k);
        self
    }

    /// True when any override is present.
    pub fn has_overrides(&self) -> bool {
        self.secret.is_some()
            || self.endpoint.is_some()
            || self.model.is_some()
            || self.temperature.is_some()
            || self.top_k.is_some()
    }
}

type HandleCell = Arc<OnceCell<Arc<dyn ChatHandle>>>;

/// Factory resolving, constructing, caching, and instrumenting chat handles.
///
/// Immutable once built; share it as `Arc<HandleFactory>` across tasks.
pub struct HandleFactory {
    builders: HashMap<Platform, Arc<dyn ProviderClientBuilder>>,
    defaults: HashMap<Platform, Arc<dyn ChatHandle>>,
    cache: RwLock<HashMap<HandleKey, HandleCell>>,
    hasher: SecretHasher,
    config_store: Option<Arc<dyn ConfigStore>>,
    estimator: Arc<dyn TokenEstimator>,
    recorder: Arc<dyn UsageRecorder>,
    accounting: bool,
    estimate_when_missing: bool,
}

impl HandleFactory {
    /// Start building a factory.
    pub fn builder() -> HandleFactoryBuilder {
        HandleFactoryBuilder::new()
    }

    /// Return the cached handle for the parameters, or construct it.
    ///
    /// With no overrides this is exactly [`Self::get_default`]. Otherwise
    /// defaults are resolved, the secret is digested, and the per-key
    /// `OnceCell` guarantees exactly one builder invocation per distinct
    /// key: losers of a race receive the winner's handle without the
    /// builder running again. A failed construction is not cached.
    pub async fn get_or_create(&self, params: HandleParams) -> Result<Arc<dyn ChatHandle>> {
        if !params.has_overrides() {
            return self.get_default(params.platform);
        }

        let spec = self.resolve_spec(&params);
        let key = self.key_for(&spec);

        let cell = {
            let mut cache = self.cache.write().await;
            Arc::clone(
                cache
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(OnceCell::new())),
            )
        };

        let handle = cell
            .get_or_try_init(|| async {
                debug!(platform = spec.platform.as_str(), model = %spec.model, "constructing handle");
                self.construct(&spec).await
            })
            .await?;
        Ok(Arc::clone(handle))
    }

    /// Pre-wired default handle for a platform.
    pub fn get_default(&self, platform: Platform) -> Result<Arc<dyn ChatHandle>> {
        self.defaults.get(&platform).cloned().ok_or_else(|| {
            FactoryError::Config(format!(
                "no default handle registered for platform {platform}"
            ))
        })
    }

    /// Resolve a named configuration and delegate to [`Self::get_or_create`].
    pub async fn get_by_config_id(&self, id: &str) -> Result<Arc<dyn ChatHandle>> {
        let store = self.config_store.as_ref().ok_or_else(|| {
            FactoryError::Config("no configuration store wired into the factory".to_string())
        })?;
        let config = store
            .resolve(id)
            .ok_or_else(|| FactoryError::Config(format!("unknown configuration id '{id}'")))?;
        self.get_or_create(config.into()).await
    }

    /// Evict the cached handle for the same-key parameters.
    ///
    /// Returns whether an entry existed. A subsequent `get_or_create` for
    /// the key triggers exactly one fresh construction.
    pub async fn remove_handle(&self, params: &HandleParams) -> bool {
        let spec = self.resolve_spec(params);
        let key = self.key_for(&spec);
        let removed = self.cache.write().await.remove(&key).is_some();
        if removed {
            debug!(platform = spec.platform.as_str(), model = %spec.model, "evicted handle");
        }
        removed
    }

    /// Number of cache entries, counting entries whose construction is
    /// still in flight.
    pub async fn cached_len(&self) -> usize {
        self.cache.read().await.len()
    }

    fn resolve_spec(&self, params: &HandleParams) -> ClientSpec {
        ClientSpec {
            platform: params.platform,
            secret: params.secret.clone(),
            endpoint: params.endpoint.clone(),
            model: params
                .model
                .clone()
                .unwrap_or_else(|| params.platform.default_model().to_string()),
            temperature: params.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            top_k: params.top_k,
        }
    }

    fn key_for(&self, spec: &ClientSpec) -> HandleKey {
        HandleKey::new(
            spec.platform,
            spec.endpoint.as_deref(),
            self.hasher.digest_opt(spec.secret.as_deref()),
            spec.model.clone(),
            spec.temperature,
            spec.top_k,
        )
    }

    async fn construct(&self, spec: &ClientSpec) -> Result<Arc<dyn ChatHandle>> {
        let builder = self.builders.get(&spec.platform).ok_or_else(|| {
            FactoryError::Unsupported(format!(
                "platform {} requires a host-managed handle; none was supplied",
                spec.platform
            ))
        })?;
        let handle = builder.build(spec).await?;
        Ok(self.maybe_wrap(handle))
    }

    fn maybe_wrap(&self, handle: Arc<dyn ChatHandle>) -> Arc<dyn ChatHandle> {
        if !self.accounting {
            return handle;
        }
        InstrumentedHandle::wrap(
            handle,
            Arc::clone(&self.estimator),
            Arc::clone(&self.recorder),
            self.estimate_when_missing,
        )
    }
}

/// Fluent construction of a [`HandleFactory`].
pub struct HandleFactoryBuilder {
    builders: HashMap<Platform, Arc<dyn ProviderClientBuilder>>,
    defaults: Vec<(Platform, Arc<dyn ChatHandle>)>,
    config_store: Option<Arc<dyn ConfigStore>>,
    estimator: Option<Arc<dyn TokenEstimator>>,
    recorder: Option<Arc<dyn UsageRecorder>>,
    accounting: bool,
    estimate_when_missing: bool,
    memo_cap: usize,
}

impl Default for HandleFactoryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleFactoryBuilder {
    /// Start with no builders, no defaults, accounting enabled.
    pub fn new() -> Self {
        Self {
            builders: HashMap::new(),
            defaults: Vec::new(),
            config_store: None,
            estimator: None,
            recorder: None,
            accounting: true,
            estimate_when_missing: true,
            memo_cap: DEFAULT_MEMO_CAP,
        }
    }

    /// Register the builder for a platform.
    pub fn with_builder(
        mut self,
        platform: Platform,
        builder: Arc<dyn ProviderClientBuilder>,
    ) -> Self {
        self.builders.insert(platform, builder);
        self
    }

    /// Register the pre-wired default handle for a platform.
    ///
    /// Defaults go through the same wrap-once accounting guard as
    /// constructed handles, at `build()` time.
    pub fn with_default(mut self, platform: Platform, handle: Arc<dyn ChatHandle>) -> Self {
        self.defaults.push((platform, handle));
        self
    }

    /// Wire the named-configuration store.
    pub fn with_config_store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.config_store = Some(store);
        self
    }

    /// Replace the default tiktoken estimator.
    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    /// Replace the default tracing recorder.
    pub fn with_recorder(mut self, recorder: Arc<dyn UsageRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Disable usage accounting entirely; handles are returned unwrapped.
    pub fn disable_accounting(mut self) -> Self {
        self.accounting = false;
        self
    }

    /// Keep accounting for reported usage but never estimate missing usage.
    pub fn disable_estimation(mut self) -> Self {
        self.estimate_when_missing = false;
        self
    }

    /// Bound on the secret digest memo before its full reset.
    pub fn with_secret_memo_cap(mut self, cap: usize) -> Self {
        self.memo_cap = cap;
        self
    }

    /// Finish construction.
    pub fn build(self) -> HandleFactory {
        let estimator = self
            .estimator
            .unwrap_or_else(|| Arc::new(TiktokenEstimator::new()));
        let recorder = self.recorder.unwrap_or_else(|| Arc::new(TracingUsageRecorder));

        let mut factory = HandleFactory {
            builders: self.builders,
            defaults: HashMap::new(),
            cache: RwLock::new(HashMap::new()),
            hasher: SecretHasher::new(self.memo_cap),
            config_store: self.config_store,
            estimator,
            recorder,
            accounting: self.accounting,
            estimate_when_missing: self.estimate_when_missing,
        };

        for (platform, handle) in self.defaults {
            let wrapped = factory.maybe_wrap(handle);
            factory.defaults.insert(platform, wrapped);
        }
        factory
    }
}
