//! Text-to-token estimation.
//!
//! When a provider omits usage from a response or stream, the accounting
//! layer falls back to estimating token counts from the text it saw. The
//! [`TokenEstimator`] trait keeps that capability injectable; the default
//! implementation counts real BPE tokens with `tiktoken_rs`.

use tiktoken_rs::{cl100k_base, o200k_base, CoreBPE};

/// Maps text to an approximate token count.
pub trait TokenEstimator: Send + Sync {
    /// Approximate number of tokens in `text`.
    fn estimate(&self, text: &str) -> u64;
}

/// BPE-based estimator using tiktoken encodings.
///
/// Falls back to cl100k_base (the GPT-4/3.5 tokenizer) for unknown models,
/// which is close enough for accounting across non-OpenAI platforms.
pub struct TiktokenEstimator {
    encoder: CoreBPE,
}

impl TiktokenEstimator {
    /// Create an estimator tuned to a model family.
    pub fn for_model(model: &str) -> Self {
        let encoder = match model {
            m if m.contains("gpt-4o") || m.contains("o1") || m.contains("o3") => {
                o200k_base().expect("o200k tokenizer data is bundled")
            }
            _ => cl100k_base().expect("cl100k tokenizer data is bundled"),
        };
        Self { encoder }
    }

    /// Create the default cl100k estimator.
    pub fn new() -> Self {
        Self {
            encoder: cl100k_base().expect("cl100k tokenizer data is bundled"),
        }
    }
}

impl Default for TiktokenEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenEstimator for TiktokenEstimator {
    fn estimate(&self, text: &str) -> u64 {
        self.encoder.encode_with_special_tokens(text).len() as u64
    }
}

/// Character-heuristic estimator: one token per four characters, rounded up.
///
/// Cheap and deterministic; useful in tests and for deployments that do not
/// want to ship tokenizer data.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharHeuristicEstimator;

impl TokenEstimator for CharHeuristicEstimator {
    fn estimate(&self, text: &str) -> u64 {
        (text.chars().count() as u64).div_ceil(4)
    }
}
