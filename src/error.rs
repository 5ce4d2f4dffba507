//! Error types for handle construction and lookup.
//!
//! # Error Handling Philosophy
//!
//! Errors should be:
//! 1. **Actionable**: Tell the caller what to fix, not just what went wrong
//! 2. **Specific**: Include the platform, config id, or field involved
//! 3. **Scoped**: Accounting side effects never produce caller-visible errors
//!
//! | Error | Cause | Solution |
//! |-------|-------|----------|
//! | `Config` | Missing secret, unknown config id, no default registered | Fix the parameter set or register a default |
//! | `Unsupported` | No builder registered for the platform | Register a builder or pre-wire a handle |
//! | `Provider` | The underlying client call failed | Inspect the provider message |

use thiserror::Error;

/// Result type for factory and handle operations.
pub type Result<T> = std::result::Result<T, FactoryError>;

/// Errors surfaced by the handle factory and by handle calls.
#[derive(Debug, Error)]
pub enum FactoryError {
    /// Configuration problem: missing mandatory field, unknown named
    /// configuration, or no default handle registered for a platform.
    #[error("configuration error: {0}")]
    Config(String),

    /// The platform has no registered builder. Platforms whose clients are
    /// managed by the host application must be pre-wired as defaults.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Failure reported by the underlying provider client.
    #[error("provider error: {0}")]
    Provider(String),
}

impl FactoryError {
    /// True when retrying the same call with the same inputs cannot succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Unsupported(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_detail() {
        let err = FactoryError::Config("OPENAI secret missing".to_string());
        assert!(err.to_string().contains("OPENAI secret missing"));
        assert!(err.to_string().starts_with("configuration error"));
    }

    #[test]
    fn test_permanence_classification() {
        assert!(FactoryError::Config("x".into()).is_permanent());
        assert!(FactoryError::Unsupported("x".into()).is_permanent());
        assert!(!FactoryError::Provider("x".into()).is_permanent());
    }
}
