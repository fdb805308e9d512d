//! OpenAI-compatible backend implementation.
//!
//! [`OpenAiCompatBackend`] works with any API that follows the OpenAI
//! chat completion format: the OpenRouter model router, provider-native
//! compat endpoints, and local inference servers (llama.cpp, Ollama,
//! vLLM). Streaming uses SSE with incremental line parsing.

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::BackendConfig;
use crate::error::{GatewayError, Result};
use crate::gateway::Gateway;
use crate::sse::{parse_sse_line, LineBuffer};
use crate::types::{
    CompletionRequest, CompletionResult, StreamChunk, WireRequest, WireResponse,
};

/// A backend speaking the OpenAI chat completion protocol.
pub struct OpenAiCompatBackend {
    config: BackendConfig,
    http: reqwest::Client,
    api_key: Option<String>,
}

impl OpenAiCompatBackend {
    /// Create a backend from configuration.
    ///
    /// The API key is resolved from the environment variable named in
    /// `config.api_key_env` at request time; local backends skip auth.
    pub fn new(config: BackendConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            api_key: None,
        }
    }

    /// Create a backend with an explicit API key, bypassing the
    /// environment lookup.
    pub fn with_api_key(config: BackendConfig, api_key: String) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            api_key: Some(api_key),
        }
    }

    /// Returns the backend configuration.
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn completions_url(&self) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        format!("{base}/chat/completions")
    }

    fn resolve_api_key(&self) -> Result<Option<String>> {
        if let Some(ref key) = self.api_key {
            return Ok(Some(key.clone()));
        }
        if self.config.api_key_env.is_empty() {
            return Ok(None);
        }
        std::env::var(&self.config.api_key_env)
            .map(Some)
            .map_err(|_| {
                GatewayError::NotConfigured(format!("set {} env var", self.config.api_key_env))
            })
    }

    /// Build the POST request with auth and extra headers applied.
    fn build_request(
        &self,
        request: &CompletionRequest,
        stream: bool,
    ) -> Result<reqwest::RequestBuilder> {
        let api_key = self.resolve_api_key()?;
        let response_format = if request.options.json_mode {
            Some(serde_json::json!({"type": "json_object"}))
        } else {
            None
        };
        let wire = WireRequest {
            model: &request.model,
            messages: &request.messages,
            max_tokens: request.options.max_tokens,
            temperature: request.options.temperature,
            response_format,
            stream: stream.then_some(true),
        };

        let timeout = request
            .options
            .deadline
            .unwrap_or(std::time::Duration::from_secs(self.config.timeout_secs));

        let mut req = self
            .http
            .post(self.completions_url())
            .timeout(timeout)
            .header("Content-Type", "application/json");

        if let Some(key) = api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        for (k, v) in &self.config.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        Ok(req.json(&serde_json::to_value(&wire)?))
    }

    /// Map a non-success status to the right error variant.
    fn status_error(&self, status: reqwest::StatusCode, body: String, model: &str) -> GatewayError {
        match status.as_u16() {
            429 => {
                let retry_ms = parse_retry_after_ms(&body).unwrap_or(1000);
                warn!(
                    backend = %self.config.name,
                    retry_after_ms = retry_ms,
                    "rate limited"
                );
                GatewayError::RateLimited {
                    retry_after_ms: retry_ms,
                }
            }
            401 | 403 => GatewayError::AuthFailed(body),
            404 => GatewayError::ModelNotFound(format!("model '{model}': {body}")),
            400 if body.contains("content_policy") || body.contains("content policy") => {
                GatewayError::ContentPolicy(body)
            }
            _ => GatewayError::RequestFailed(format!("HTTP {status}: {body}")),
        }
    }

    /// Notices the resilience layer attaches to local-model results.
    fn local_notices(&self) -> Vec<String> {
        if self.config.local {
            vec![format!(
                "served by local backend '{}'; quality may differ from the requested tier",
                self.config.name
            )]
        } else {
            Vec::new()
        }
    }
}

#[async_trait]
impl Gateway for OpenAiCompatBackend {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResult> {
        debug!(
            backend = %self.config.name,
            model = %request.model,
            messages = request.messages.len(),
            "sending completion request"
        );

        let response = self
            .build_request(request, false)?
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout
                } else {
                    GatewayError::Http(e)
                }
            })?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.status_error(status, body, &request.model));
        }

        let wire: WireResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::InvalidResponse(format!("failed to parse response: {e}")))?;

        let choice = wire
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::InvalidResponse("response had no choices".into()))?;

        debug!(
            backend = %self.config.name,
            model = %wire.model,
            "completion response received"
        );

        Ok(CompletionResult {
            content: choice.message.content,
            model: if wire.model.is_empty() {
                request.model.clone()
            } else {
                wire.model
            },
            usage: wire.usage,
            notices: self.local_notices(),
        })
    }

    async fn complete_stream(
        &self,
        request: &CompletionRequest,
        tx: mpsc::Sender<StreamChunk>,
    ) -> Result<()> {
        debug!(
            backend = %self.config.name,
            model = %request.model,
            "sending streaming completion request"
        );

        let response = self
            .build_request(request, true)?
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout
                } else {
                    GatewayError::Http(e)
                }
            })?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.status_error(status, body, &request.model));
        }

        let mut buffer = LineBuffer::new();
        let mut byte_stream = response.bytes_stream();
        let mut sent_text = false;
        let mut sent_done = false;

        while let Some(chunk) = byte_stream.next().await {
            let bytes = chunk.map_err(GatewayError::Http)?;
            for line in buffer.push(&bytes) {
                for parsed in parse_sse_line(&line)? {
                    match &parsed {
                        StreamChunk::TextDelta { .. } => sent_text = true,
                        StreamChunk::Done { .. } => {
                            if sent_done {
                                continue;
                            }
                            sent_done = true;
                        }
                    }
                    if tx.send(parsed).await.is_err() {
                        // Consumer hung up; stop reading.
                        return Ok(());
                    }
                }
            }
        }

        // A well-formed stream carries at least one chunk and a terminal
        // marker; patch up backends that close early.
        if !sent_text {
            let _ = tx
                .send(StreamChunk::TextDelta {
                    text: String::new(),
                })
                .await;
        }
        if !sent_done {
            let _ = tx.send(StreamChunk::Done { usage: None }).await;
        }
        Ok(())
    }
}

/// Try to extract a retry-after value from a JSON error response body.
fn parse_retry_after_ms(body: &str) -> Option<u64> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("retry_after_ms")
        .and_then(|v| v.as_u64())
        .or_else(|| {
            value
                .get("retry_after")
                .and_then(|v| v.as_f64())
                .map(|secs| (secs * 1000.0) as u64)
        })
}

impl std::fmt::Debug for OpenAiCompatBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatBackend")
            .field("name", &self.config.name)
            .field("base_url", &self.config.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{local_backend, remote_backend};

    fn test_config() -> BackendConfig {
        BackendConfig {
            name: "test-backend".into(),
            base_url: "https://api.example.com/v1".into(),
            api_key_env: "CONCLAVE_TEST_API_KEY_UNSET".into(),
            headers: Default::default(),
            timeout_secs: 60,
            local: false,
        }
    }

    #[test]
    fn completions_url_construction() {
        let backend = OpenAiCompatBackend::new(test_config());
        assert_eq!(
            backend.completions_url(),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn completions_url_strips_trailing_slash() {
        let mut config = test_config();
        config.base_url = "https://api.example.com/v1/".into();
        let backend = OpenAiCompatBackend::new(config);
        assert_eq!(
            backend.completions_url(),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn resolve_api_key_explicit() {
        let backend = OpenAiCompatBackend::with_api_key(test_config(), "sk-explicit".into());
        assert_eq!(backend.resolve_api_key().unwrap().as_deref(), Some("sk-explicit"));
    }

    #[test]
    fn resolve_api_key_missing_env_errors() {
        let backend = OpenAiCompatBackend::new(test_config());
        assert!(matches!(
            backend.resolve_api_key(),
            Err(GatewayError::NotConfigured(_))
        ));
    }

    #[test]
    fn resolve_api_key_local_skips_auth() {
        let backend = OpenAiCompatBackend::new(local_backend());
        assert!(backend.resolve_api_key().unwrap().is_none());
    }

    #[test]
    fn status_error_mapping() {
        let backend = OpenAiCompatBackend::new(test_config());
        let err = backend.status_error(
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            r#"{"retry_after_ms": 250}"#.into(),
            "m",
        );
        assert!(matches!(
            err,
            GatewayError::RateLimited {
                retry_after_ms: 250
            }
        ));

        let err = backend.status_error(reqwest::StatusCode::UNAUTHORIZED, "nope".into(), "m");
        assert!(matches!(err, GatewayError::AuthFailed(_)));

        let err = backend.status_error(reqwest::StatusCode::NOT_FOUND, "missing".into(), "m");
        assert!(matches!(err, GatewayError::ModelNotFound(_)));

        let err = backend.status_error(
            reqwest::StatusCode::BAD_REQUEST,
            r#"{"error": "content_policy violation"}"#.into(),
            "m",
        );
        assert!(matches!(err, GatewayError::ContentPolicy(_)));

        let err = backend.status_error(
            reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            "boom".into(),
            "m",
        );
        assert!(matches!(err, GatewayError::RequestFailed(msg) if msg.starts_with("HTTP 500")));
    }

    #[test]
    fn parse_retry_after_variants() {
        assert_eq!(parse_retry_after_ms(r#"{"retry_after_ms": 1500}"#), Some(1500));
        assert_eq!(parse_retry_after_ms(r#"{"retry_after": 2.5}"#), Some(2500));
        assert_eq!(parse_retry_after_ms("not json"), None);
        assert_eq!(parse_retry_after_ms("{}"), None);
    }

    #[test]
    fn local_backend_attaches_notice() {
        let backend = OpenAiCompatBackend::new(local_backend());
        let notices = backend.local_notices();
        assert_eq!(notices.len(), 1);
        assert!(notices[0].contains("local"));

        let remote = OpenAiCompatBackend::new(remote_backend());
        assert!(remote.local_notices().is_empty());
    }

    #[test]
    fn debug_masks_api_key() {
        let backend = OpenAiCompatBackend::with_api_key(test_config(), "sk-secret".into());
        let debug = format!("{backend:?}");
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("***"));
    }
}
