//! Named handle configurations.
//!
//! A [`HandleConfig`] is the parameter tuple an external configuration store
//! resolves a configuration id to. Persistence of these configurations is
//! out of scope for this crate; [`StaticConfigStore`] is the in-memory
//! implementation used for wiring and tests, and the serde derives let host
//! applications load configurations from whatever store they keep.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::factory::{HandleParams, Platform};
use crate::traits::ConfigStore;

/// Connection parameters for one named configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandleConfig {
    /// Target platform.
    pub platform: Platform,

    /// Secret, if the platform needs one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,

    /// Endpoint override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Model name; platform default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Sampling temperature; crate default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// Top-K sampling cutoff.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
}

impl HandleConfig {
    /// Minimal configuration for a platform.
    pub fn new(platform: Platform) -> Self {
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

    /// Set the model name.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the temperature.
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the top-K cutoff.
    pub fn with_top_k(mut self, top_k: u32) -> Self {
        self.top_k = Some(top_k);
        self
    }
}

impl From<HandleConfig> for HandleParams {
    fn from(config: HandleConfig) -> Self {
        HandleParams {
            platform: config.platform,
            secret: config.secret,
            endpoint: config.endpoint,
            model: config.model,
            temperature: config.temperature,
            top_k: config.top_k,
        }
    }
}

/// In-memory configuration store keyed by id.
#[derive(Debug, Default)]
pub struct StaticConfigStore {
    configs: HashMap<String, HandleConfig>,
}

impl StaticConfigStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a configuration.
    pub fn insert(&mut self, id: impl Into<String>, config: HandleConfig) {
        self.configs.insert(id.into(), config);
    }

    /// Fluent insert for wiring code.
    pub fn with(mut self, id: impl Into<String>, config: HandleConfig) -> Self {
        self.insert(id, config);
        self
    }

    /// Number of stored configurations.
    pub fn len(&self) -> usize {
        self.configs.len()
    }

    /// True when the store holds nothing.
    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

impl ConfigStore for StaticConfigStore {
    fn resolve(&self, id: &str) -> Option<HandleConfig> {
        self.configs.get(id).cloned()
    }
}
