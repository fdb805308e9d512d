//! Exponential backoff retry logic for gateway calls.
//!
//! [`RetryPolicy`] wraps any [`Gateway`] and automatically retries
//! failed requests with exponential backoff and full jitter. Only
//! idempotent failure categories retry (network errors, 5xx,
//! rate-limits with a retry-after hint); content-policy rejections and
//! auth failures do not.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};
use crate::gateway::Gateway;
use crate::types::{CompletionRequest, CompletionResult, StreamChunk};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first try (default: 2).
    pub max_retries: u32,
    /// Base delay for the backoff curve (default: 1 second).
    pub base_delay: Duration,
    /// Ceiling for any single delay (default: 30 seconds).
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Determines whether a [`GatewayError`] should be retried.
pub fn is_retryable(err: &GatewayError) -> bool {
    match err {
        GatewayError::RateLimited { .. } => true,
        GatewayError::Timeout => true,
        GatewayError::Http(_) => true,
        GatewayError::RequestFailed(msg) => {
            msg.starts_with("HTTP 500")
                || msg.starts_with("HTTP 502")
                || msg.starts_with("HTTP 503")
                || msg.starts_with("HTTP 504")
        }
        GatewayError::AuthFailed(_)
        | GatewayError::ModelNotFound(_)
        | GatewayError::NotConfigured(_)
        | GatewayError::ContentPolicy(_)
        | GatewayError::InvalidResponse(_)
        | GatewayError::CircuitOpen { .. }
        | GatewayError::Cancelled
        | GatewayError::Json(_) => false,
    }
}

/// Delay for attempt `n` (0-indexed): full jitter over the exponential
/// curve, i.e. a uniform draw from `[0, min(max_delay, base * 2^n)]`.
pub fn compute_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exp = 2u64.saturating_pow(attempt);
    let base_ms = config.base_delay.as_millis() as u64;
    let cap_ms = config.max_delay.as_millis() as u64;
    let ceiling_ms = base_ms.saturating_mul(exp).min(cap_ms);
    let jittered_ms = rand::thread_rng().gen_range(0..=ceiling_ms);
    Duration::from_millis(jittered_ms)
}

/// A gateway wrapper that retries transient failures.
///
/// # Example
///
/// ```rust,ignore
/// use conclave_llm::{OpenAiCompatBackend, config::remote_backend};
/// use conclave_llm::retry::{RetryPolicy, RetryConfig};
///
/// let inner = OpenAiCompatBackend::new(remote_backend());
/// let gateway = RetryPolicy::new(inner, RetryConfig::default());
/// ```
pub struct RetryPolicy<G> {
    inner: G,
    config: RetryConfig,
}

impl<G: Gateway> RetryPolicy<G> {
    /// Wrap a gateway with retry logic.
    pub fn new(inner: G, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    /// Returns the retry configuration.
    pub fn retry_config(&self) -> &RetryConfig {
        &self.config
    }

    /// Returns the inner gateway.
    pub fn inner(&self) -> &G {
        &self.inner
    }

    fn delay_for(&self, err: &GatewayError, attempt: u32) -> Duration {
        // Rate-limit responses may suggest a longer wait than the curve.
        if let GatewayError::RateLimited { retry_after_ms } = err {
            let computed = compute_delay(&self.config, attempt);
            computed.max(Duration::from_millis(*retry_after_ms))
        } else {
            compute_delay(&self.config, attempt)
        }
    }
}

#[async_trait]
impl<G: Gateway> Gateway for RetryPolicy<G> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResult> {
        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            match self.inner.complete(request).await {
                Ok(mut result) => {
                    if attempt > 0 {
                        debug!(
                            backend = %self.inner.name(),
                            model = %request.model,
                            attempt,
                            "request succeeded after retry"
                        );
                        // A recovered transient failure is still a
                        // degradation the session should surface.
                        result
                            .notices
                            .push(format!("recovered after {attempt} retry attempt(s)"));
                    }
                    return Ok(result);
                }
                Err(err) => {
                    if !is_retryable(&err) || attempt == self.config.max_retries {
                        return Err(err);
                    }

                    let delay = self.delay_for(&err, attempt);
                    warn!(
                        backend = %self.inner.name(),
                        model = %request.model,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after transient error"
                    );
                    tokio::time::sleep(delay).await;
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or(GatewayError::RequestFailed(
            "retry loop exhausted without error".into(),
        )))
    }

    async fn complete_stream(
        &self,
        request: &CompletionRequest,
        tx: mpsc::Sender<StreamChunk>,
    ) -> Result<()> {
        // Streaming can only be retried before chunks reach the consumer.
        // Each attempt buffers into its own channel; chunks are forwarded
        // only once the attempt succeeds.
        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            let (attempt_tx, mut attempt_rx) = mpsc::channel::<StreamChunk>(256);

            match self.inner.complete_stream(request, attempt_tx).await {
                Ok(()) => {
                    while let Some(chunk) = attempt_rx.recv().await {
                        if tx.send(chunk).await.is_err() {
                            break;
                        }
                    }
                    return Ok(());
                }
                Err(err) => {
                    if !is_retryable(&err) || attempt == self.config.max_retries {
                        return Err(err);
                    }

                    let delay = self.delay_for(&err, attempt);
                    warn!(
                        backend = %self.inner.name(),
                        model = %request.model,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying streaming request after transient error"
                    );
                    tokio::time::sleep(delay).await;
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or(GatewayError::RequestFailed(
            "streaming retry loop exhausted without error".into(),
        )))
    }
}

impl<G: std::fmt::Debug> std::fmt::Debug for RetryPolicy<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("inner", &self.inner)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatMessage, Usage};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// A mock gateway that fails a configurable number of times before
    /// succeeding.
    struct MockGateway {
        name: String,
        fail_count: AtomicU32,
        fail_with: fn() -> GatewayError,
    }

    impl MockGateway {
        fn new(name: &str, failures: u32, fail_with: fn() -> GatewayError) -> Self {
            Self {
                name: name.into(),
                fail_count: AtomicU32::new(failures),
                fail_with,
            }
        }
    }

    #[async_trait]
    impl Gateway for MockGateway {
        fn name(&self) -> &str {
            &self.name
        }

        async fn complete(&self, _request: &CompletionRequest) -> Result<CompletionResult> {
            if self.fail_count.load(Ordering::SeqCst) > 0 {
                self.fail_count.fetch_sub(1, Ordering::SeqCst);
                return Err((self.fail_with)());
            }
            Ok(CompletionResult {
                content: "Hello!".into(),
                model: "test-model".into(),
                usage: Some(Usage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    total_tokens: 15,
                }),
                notices: vec![],
            })
        }
    }

    fn test_request() -> CompletionRequest {
        CompletionRequest::new("test-model", vec![ChatMessage::user("Hi")])
    }

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn default_config() {
        let cfg = RetryConfig::default();
        assert_eq!(cfg.max_retries, 2);
        assert_eq!(cfg.base_delay, Duration::from_secs(1));
        assert_eq!(cfg.max_delay, Duration::from_secs(30));
    }

    #[test]
    fn retryable_categories() {
        assert!(is_retryable(&GatewayError::RateLimited {
            retry_after_ms: 100
        }));
        assert!(is_retryable(&GatewayError::Timeout));
        assert!(is_retryable(&GatewayError::RequestFailed(
            "HTTP 503: unavailable".into()
        )));
        assert!(is_retryable(&GatewayError::RequestFailed(
            "HTTP 500: internal".into()
        )));
    }

    #[test]
    fn non_retryable_categories() {
        assert!(!is_retryable(&GatewayError::AuthFailed("bad key".into())));
        assert!(!is_retryable(&GatewayError::ContentPolicy("flagged".into())));
        assert!(!is_retryable(&GatewayError::CircuitOpen {
            model: "m".into()
        }));
        assert!(!is_retryable(&GatewayError::RequestFailed(
            "HTTP 400: bad request".into()
        )));
        assert!(!is_retryable(&GatewayError::Cancelled));
    }

    #[test]
    fn full_jitter_stays_within_ceiling() {
        let config = RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
        };
        for _ in 0..50 {
            // attempt 2: ceiling = 100 * 4 = 400ms
            let d = compute_delay(&config, 2);
            assert!(d.as_millis() <= 400);
        }
    }

    #[test]
    fn delay_capped_at_max() {
        let config = RetryConfig {
            max_retries: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
        };
        for _ in 0..50 {
            let d = compute_delay(&config, 8);
            assert!(d.as_millis() <= 5000);
        }
    }

    #[tokio::test]
    async fn succeeds_first_try() {
        let gateway = RetryPolicy::new(
            MockGateway::new("t", 0, || GatewayError::Timeout),
            fast_config(),
        );
        let result = gateway.complete(&test_request()).await.unwrap();
        assert_eq!(result.content, "Hello!");
        assert!(result.notices.is_empty());
    }

    #[tokio::test]
    async fn recovers_and_attaches_notice() {
        let gateway = RetryPolicy::new(
            MockGateway::new("t", 2, || {
                GatewayError::RequestFailed("HTTP 503: unavailable".into())
            }),
            fast_config(),
        );
        let result = gateway.complete(&test_request()).await.unwrap();
        assert_eq!(result.content, "Hello!");
        assert_eq!(result.notices.len(), 1);
        assert!(result.notices[0].contains("recovered"));
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let gateway = RetryPolicy::new(
            MockGateway::new("t", 10, || {
                GatewayError::RequestFailed("HTTP 500: error".into())
            }),
            RetryConfig {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
        );
        let err = gateway.complete(&test_request()).await.unwrap_err();
        assert!(matches!(err, GatewayError::RequestFailed(_)));
    }

    #[tokio::test]
    async fn auth_errors_do_not_retry() {
        let calls = Arc::new(AtomicU32::new(0));

        struct CountingGateway {
            calls: Arc<AtomicU32>,
        }

        #[async_trait]
        impl Gateway for CountingGateway {
            fn name(&self) -> &str {
                "counting"
            }
            async fn complete(&self, _req: &CompletionRequest) -> Result<CompletionResult> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Err(GatewayError::AuthFailed("invalid key".into()))
            }
        }

        let gateway = RetryPolicy::new(
            CountingGateway {
                calls: calls.clone(),
            },
            fast_config(),
        );
        let err = gateway.complete(&test_request()).await.unwrap_err();
        assert!(matches!(err, GatewayError::AuthFailed(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rate_limit_uses_suggested_delay() {
        let gateway = RetryPolicy::new(
            MockGateway::new("t", 1, || GatewayError::RateLimited { retry_after_ms: 5 }),
            fast_config(),
        );
        let result = gateway.complete(&test_request()).await.unwrap();
        assert_eq!(result.content, "Hello!");
    }

    #[tokio::test]
    async fn streaming_retry_buffers_partial_output() {
        // Fails once with a retryable error, then streams successfully
        // via the default synthesized stream.
        let gateway = RetryPolicy::new(
            MockGateway::new("t", 1, || GatewayError::Timeout),
            fast_config(),
        );
        let (tx, mut rx) = mpsc::channel(16);
        gateway.complete_stream(&test_request(), tx).await.unwrap();

        let mut text = String::new();
        let mut done = false;
        while let Some(chunk) = rx.recv().await {
            match chunk {
                StreamChunk::TextDelta { text: t } => text.push_str(&t),
                StreamChunk::Done { .. } => done = true,
            }
        }
        assert_eq!(text, "Hello!");
        assert!(done);
    }

    #[test]
    fn name_delegates() {
        let gateway = RetryPolicy::new(
            MockGateway::new("my-backend", 0, || GatewayError::Timeout),
            RetryConfig::default(),
        );
        assert_eq!(gateway.name(), "my-backend");
    }
}
