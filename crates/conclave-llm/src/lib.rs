//! LLM gateway abstraction for conclave.
//!
//! This crate provides a uniform completion capability over
//! heterogeneous backends (remote model router, local inference) with a
//! resilience layer: per-attempt timeouts, retry with full-jitter
//! backoff, per-model circuit breaking, and degradation notices. It is
//! a standalone library with no dependencies on other conclave crates.
//!
//! # Architecture
//!
//! - [`Gateway`] trait defines the completion interface (plus a
//!   streaming variant that always yields at least one chunk and a
//!   terminal marker)
//! - [`OpenAiCompatBackend`] implements it for any OpenAI-compatible
//!   endpoint, remote or local
//! - [`RetryPolicy`](retry::RetryPolicy) retries transient failures
//! - [`CircuitBreakerPolicy`](breaker::CircuitBreakerPolicy) shorts
//!   calls to persistently failing models
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use conclave_llm::{build_gateway, CompletionRequest, ChatMessage};
//!
//! let gateway = build_gateway(false); // offline = false
//! let request = CompletionRequest::new("openai/gpt-5.1", vec![
//!     ChatMessage::user("What is Rust?"),
//! ]);
//! let result = gateway.complete(&request).await?;
//! println!("{}", result.content);
//! ```

pub mod breaker;
pub mod config;
pub mod error;
pub mod gateway;
pub mod openai_compat;
pub mod retry;
pub mod sse;
pub mod types;

use std::sync::Arc;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker, CircuitBreakerPolicy};
pub use config::{backend_for, local_backend, remote_backend, BackendConfig};
pub use error::{GatewayError, Result};
pub use gateway::Gateway;
pub use openai_compat::OpenAiCompatBackend;
pub use retry::{RetryConfig, RetryPolicy};
pub use types::{
    ChatMessage, CompletionOptions, CompletionRequest, CompletionResult, StreamChunk, Usage,
};

/// Build the standard resilient gateway stack for the given offline
/// flag: OpenAI-compatible transport, wrapped in retry, wrapped in the
/// per-model circuit breaker.
pub fn build_gateway(offline: bool) -> Arc<dyn Gateway> {
    let backend = OpenAiCompatBackend::new(backend_for(offline));
    let with_retry = RetryPolicy::new(backend, RetryConfig::default());
    Arc::new(CircuitBreakerPolicy::new(
        with_retry,
        BreakerConfig::default(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_gateway_offline_uses_local() {
        let gateway = build_gateway(true);
        assert_eq!(gateway.name(), "local");
    }

    #[test]
    fn build_gateway_online_uses_router() {
        let gateway = build_gateway(false);
        assert_eq!(gateway.name(), "openrouter");
    }
}
