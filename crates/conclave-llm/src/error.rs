//! Gateway error types.
//!
//! All gateway operations return [`Result<T>`] which uses
//! [`GatewayError`] as the error type. The retry policy and circuit
//! breaker both key their behavior off these variants.

use thiserror::Error;

/// Errors that can occur when calling an LLM backend.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The HTTP request to the backend failed.
    #[error("request failed: {0}")]
    RequestFailed(String),

    /// Authentication with the backend was rejected (HTTP 401/403).
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The backend returned a rate-limit response (HTTP 429).
    #[error("rate limited: retry after {retry_after_ms}ms")]
    RateLimited {
        /// Suggested wait time before retrying, in milliseconds.
        retry_after_ms: u64,
    },

    /// The requested model does not exist on the backend.
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// The backend has not been configured (e.g. missing API key).
    #[error("not configured: {0}")]
    NotConfigured(String),

    /// The backend rejected the prompt on content-policy grounds.
    /// Never retried.
    #[error("content policy rejection: {0}")]
    ContentPolicy(String),

    /// The backend returned a response that could not be parsed.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The request exceeded its deadline.
    #[error("timeout")]
    Timeout,

    /// The circuit breaker for this model is open; the call was shorted
    /// without reaching the backend.
    #[error("circuit open for model {model}")]
    CircuitOpen {
        /// The model whose breaker is open.
        model: String,
    },

    /// The call was cancelled cooperatively.
    #[error("cancelled")]
    Cancelled,

    /// An HTTP-level error from reqwest.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// A JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A convenience type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_rate_limited() {
        let err = GatewayError::RateLimited {
            retry_after_ms: 5000,
        };
        assert_eq!(err.to_string(), "rate limited: retry after 5000ms");
    }

    #[test]
    fn display_circuit_open() {
        let err = GatewayError::CircuitOpen {
            model: "openai/gpt-5.1".into(),
        };
        assert_eq!(err.to_string(), "circuit open for model openai/gpt-5.1");
    }

    #[test]
    fn display_content_policy() {
        let err = GatewayError::ContentPolicy("flagged".into());
        assert_eq!(err.to_string(), "content policy rejection: flagged");
    }

    #[test]
    fn display_timeout_and_cancelled() {
        assert_eq!(GatewayError::Timeout.to_string(), "timeout");
        assert_eq!(GatewayError::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn json_error_from_conversion() {
        let serde_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: GatewayError = serde_err.into();
        assert!(err.to_string().starts_with("json error:"));
    }
}
