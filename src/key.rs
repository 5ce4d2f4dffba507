//! Cache keys for pooled handles and secret digesting.
//!
//! A [`HandleKey`] uniquely identifies one handle: same key, same instance.
//! Raw secrets never appear in a key; they are replaced by a SHA-256 digest
//! so keys can be logged, compared, and held for process lifetime without
//! retaining credentials.
//!
//! The digest is used only for cache-key equality, never for authentication
//! decisions.

use std::collections::HashMap;
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::factory::Platform;

/// Default bound on the digest memo before it is cleared in full.
pub const DEFAULT_MEMO_CAP: usize = 1024;

/// Immutable identity of one pooled handle.
///
/// Temperature is stored as raw `f64` bits so the key derives `Eq` and
/// `Hash` without float comparison hazards; two keys are equal exactly when
/// their source temperatures are bit-identical.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandleKey {
    /// Target platform.
    pub platform: Platform,

    /// Endpoint override, empty when the platform default applies.
    pub endpoint: String,

    /// SHA-256 hex digest of the secret, empty for secretless providers.
    pub secret_digest: String,

    /// Resolved model name.
    pub model: String,

    /// Resolved temperature, as `f64::to_bits`.
    temperature_bits: u64,

    /// Top-K cutoff, if requested.
    pub top_k: Option<u32>,
}

impl HandleKey {
    /// Build a key from resolved parameters.
    pub fn new(
        platform: Platform,
        endpoint: Option<&str>,
        secret_digest: impl Into<String>,
        model: impl Into<String>,
        temperature: f64,
        top_k: Option<u32>,
    ) -> Self {
        Self {
            platform,
            endpoint: endpoint.unwrap_or("").to_string(),
            secret_digest: secret_digest.into(),
            model: model.into(),
            temperature_bits: temperature.to_bits(),
            top_k,
        }
    }

    /// The temperature this key was built from.
    pub fn temperature(&self) -> f64 {
        f64::from_bits(self.temperature_bits)
    }
}

/// Derives stable digests from raw secrets for use inside cache keys.
///
/// Digests are memoized per raw secret. When the memo reaches its cap the
/// whole map is cleared, not evicted per entry. Under concurrent inserts
/// crossing the cap this can cause a short burst of redundant recomputation;
/// that trade-off is accepted in exchange for a trivially correct bound.
#[derive(Debug)]
pub struct SecretHasher {
    memo: Mutex<HashMap<String, String>>,
    max_entries: usize,
}

impl Default for SecretHasher {
    fn default() -> Self {
        Self::new(DEFAULT_MEMO_CAP)
    }
}

impl SecretHasher {
    /// Create a hasher whose memo holds at most `max_entries` digests.
    pub fn new(max_entries: usize) -> Self {
        Self {
            memo: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    /// Digest a secret for cache-key use.
    ///
    /// Deterministic and one-way. Blank or whitespace-only secrets map to
    /// the empty string, covering providers that require no secret.
    pub fn digest(&self, secret: &str) -> String {
        if secret.trim().is_empty() {
            return String::new();
        }

        let mut memo = self.memo.lock().expect("secret memo lock");
        if let Some(cached) = memo.get(secret) {
            return cached.clone();
        }

        let digest = hex_sha256(secret);
        if memo.len() >= self.max_entries {
            debug!(cap = self.max_entries, "secret digest memo full, clearing");
            memo.clear();
        }
        memo.insert(secret.to_string(), digest.clone());
        digest
    }

    /// Digest an optional secret; `None` behaves like a blank secret.
    pub fn digest_opt(&self, secret: Option<&str>) -> String {
        self.digest(secret.unwrap_or(""))
    }

    /// Current memo size, for tests and diagnostics.
    pub fn memo_len(&self) -> usize {
        self.memo.lock().expect("secret memo lock").len()
    }
}

fn hex_sha256(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let bytes = hasher.finalize();
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_deterministic() {
        let hasher = SecretHasher::default();
        assert_eq!(hasher.digest("sk-abc"), hasher.digest("sk-abc"));
        assert_eq!(hasher.digest("sk-abc").len(), 64);
    }

    #[test]
    fn test_blank_and_absent_share_sentinel() {
        let hasher = SecretHasher::default();
        assert_eq!(hasher.digest(""), "");
        assert_eq!(hasher.digest("   "), "");
        assert_eq!(hasher.digest_opt(None), "");
        assert_eq!(hasher.digest_opt(Some("")), "");
    }

    #[test]
    fn test_distinct_secrets_distinct_digests() {
        let hasher = SecretHasher::default();
        assert_ne!(hasher.digest("sk-a"), hasher.digest("sk-b"));
    }

    #[test]
    fn test_memo_cleared_in_full_at_cap() {
        let hasher = SecretHasher::new(3);
        hasher.digest("one");
        hasher.digest("two");
        hasher.digest("three");
        assert_eq!(hasher.memo_len(), 3);

        // Crossing the cap clears everything, then inserts the newcomer.
        hasher.digest("four");
        assert_eq!(hasher.memo_len(), 1);

        // Values are still correct after the reset.
        assert_eq!(hasher.digest("one"), hex_sha256("one"));
    }

    #[test]
    fn test_blank_secret_does_not_populate_memo() {
        let hasher = SecretHasher::new(4);
        hasher.digest("");
        hasher.digest("  ");
        assert_eq!(hasher.memo_len(), 0);
    }

    #[test]
    fn test_key_equality_by_value() {
        let a = HandleKey::new(Platform::OpenAi, None, "d", "gpt-4o-mini", 0.7, Some(40));
        let b = HandleKey::new(Platform::OpenAi, None, "d", "gpt-4o-mini", 0.7, Some(40));
        assert_eq!(a, b);
    }

    #[test]
    fn test_any_single_field_changes_key() {
        let base = HandleKey::new(Platform::OpenAi, None, "d", "m", 0.7, Some(40));
        let variants = [
            HandleKey::new(Platform::Ollama, None, "d", "m", 0.7, Some(40)),
            HandleKey::new(Platform::OpenAi, Some("https://alt"), "d", "m", 0.7, Some(40)),
            HandleKey::new(Platform::OpenAi, None, "other", "m", 0.7, Some(40)),
            HandleKey::new(Platform::OpenAi, None, "d", "m2", 0.7, Some(40)),
            HandleKey::new(Platform::OpenAi, None, "d", "m", 0.2, Some(40)),
            HandleKey::new(Platform::OpenAi, None, "d", "m", 0.7, None),
        ];
        for variant in variants {
            assert_ne!(base, variant);
        }
    }

    #[test]
    fn test_temperature_roundtrip() {
        let key = HandleKey::new(Platform::Mock, None, "", "m", 0.35, None);
        assert_eq!(key.temperature(), 0.35);
    }
}
