//! Error types for tierqa.
//!
//! Epistemic taxonomy:
//! - B_i falsified: Expected failures (bad records, bad config, unparsable output)
//! - I^B materialized: Infrastructure failures (network, timeout, disk)
//! - K_i violated: Internal invariant violations (bugs)

use std::time::Duration;
use thiserror::Error;

/// Top-level error type for tierqa.
#[derive(Debug, Error)]
pub enum TierError {
    // ═══════════════════════════════════════════════════════════════════
    // B_i FALSIFIED: Belief proven wrong (expected failures)
    // ═══════════════════════════════════════════════════════════════════
    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    // ═══════════════════════════════════════════════════════════════════
    // I^B MATERIALIZED: Bounded ignorance became known-bad
    // ═══════════════════════════════════════════════════════════════════
    #[error("Endpoint API error: {0}")]
    Api(#[from] ApiError),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: f64 },

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // ═══════════════════════════════════════════════════════════════════
    // K_i VIOLATED: Invariant broken (bug, should not happen)
    // ═══════════════════════════════════════════════════════════════════
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors reported by an OpenAI-compatible endpoint.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Authentication failed for endpoint '{0}'")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("API error (status {status}): {message}")]
    Status { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Request failed after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: String },
}

impl TierError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Check if this error is retryable at the HTTP layer.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::RateLimited { .. } | Self::Network(_) => true,
            Self::Api(ApiError::Status { status, .. }) => *status >= 500,
            _ => false,
        }
    }

    /// Get retry delay hint in seconds, if applicable.
    pub fn retry_after(&self) -> Option<f64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

/// A record rejected by the normalizer.
///
/// Never fatal: the record is skipped and the run continues.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("record #{index} is not a JSON object")]
    NotAnObject { index: usize },

    #[error("record #{index} has no id")]
    MissingId { index: usize },

    #[error("record '{id}' has no question")]
    MissingQuestion { id: String },

    #[error("record '{id}' has no ground-truth answer")]
    MissingGroundTruth { id: String },

    #[error("record '{id}': question and ground truth differ in shape")]
    ShapeMismatch { id: String },

    #[error("record '{id}' duplicates an earlier id")]
    DuplicateId { id: String },
}

/// Failure of one candidate on one item.
///
/// Contained to the candidate: siblings and the run are unaffected.
#[derive(Debug, Clone, Error)]
pub enum CandidateError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("empty output")]
    EmptyOutput,

    #[error("no answer could be extracted")]
    NoAnswer,

    #[error("adapter error: {0}")]
    Adapter(String),

    #[error("interrupted by shutdown")]
    Interrupted,
}

/// Result type alias for tierqa.
pub type Result<T> = std::result::Result<T, TierError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(TierError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(
            TierError::Api(ApiError::Status {
                status: 503,
                message: "overloaded".to_string(),
            })
            .is_retryable()
        );
        assert!(!TierError::Api(ApiError::AuthenticationFailed("local".to_string())).is_retryable());
        assert!(!TierError::ParseError("bad".to_string()).is_retryable());
    }

    #[test]
    fn test_retry_after_hint() {
        let err = TierError::RateLimited {
            retry_after_secs: 2.5,
        };
        assert_eq!(err.retry_after(), Some(2.5));
        assert_eq!(TierError::Internal("x".to_string()).retry_after(), None);
    }
}
