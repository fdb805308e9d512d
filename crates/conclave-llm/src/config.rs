//! Backend configuration and the offline-aware factory.
//!
//! Each [`BackendConfig`] describes how to connect to an
//! OpenAI-compatible endpoint: the base URL, API key environment
//! variable, and any extra headers. The engine normally talks to a
//! remote model router; in offline mode it prefers a local inference
//! server speaking the same protocol.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Configuration for a single completion backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend name (e.g. "openrouter", "local").
    pub name: String,

    /// Base URL for the OpenAI-compatible API.
    pub base_url: String,

    /// Environment variable that holds the API key. Empty means no
    /// authentication (local servers).
    #[serde(default)]
    pub api_key_env: String,

    /// Extra HTTP headers to include in every request.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Request timeout in seconds when the call carries no deadline.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Whether this backend is a local inference server. Local backends
    /// attach hardware degradation notices and skip auth.
    #[serde(default)]
    pub local: bool,
}

fn default_timeout_secs() -> u64 {
    120
}

/// The remote model-router backend (OpenRouter).
pub fn remote_backend() -> BackendConfig {
    BackendConfig {
        name: "openrouter".into(),
        base_url: "https://openrouter.ai/api/v1".into(),
        api_key_env: "OPENROUTER_API_KEY".into(),
        headers: HashMap::new(),
        timeout_secs: default_timeout_secs(),
        local: false,
    }
}

/// A local OpenAI-compatible inference server (llama.cpp, Ollama,
/// vLLM on localhost).
pub fn local_backend() -> BackendConfig {
    BackendConfig {
        name: "local".into(),
        base_url: "http://127.0.0.1:11434/v1".into(),
        api_key_env: String::new(),
        headers: HashMap::new(),
        timeout_secs: default_timeout_secs(),
        local: true,
    }
}

/// Pick the backend for the given offline flag: local inference when
/// offline, the remote router otherwise.
pub fn backend_for(offline: bool) -> BackendConfig {
    if offline {
        local_backend()
    } else {
        remote_backend()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_defaults() {
        let b = remote_backend();
        assert_eq!(b.name, "openrouter");
        assert_eq!(b.api_key_env, "OPENROUTER_API_KEY");
        assert!(!b.local);
        assert_eq!(b.timeout_secs, 120);
    }

    #[test]
    fn local_skips_auth() {
        let b = local_backend();
        assert!(b.local);
        assert!(b.api_key_env.is_empty());
        assert!(b.base_url.starts_with("http://127.0.0.1"));
    }

    #[test]
    fn factory_respects_offline_flag() {
        assert_eq!(backend_for(true).name, "local");
        assert_eq!(backend_for(false).name, "openrouter");
    }

    #[test]
    fn config_serde_defaults() {
        let b: BackendConfig = serde_json::from_str(
            r#"{"name": "custom", "base_url": "https://llm.example.com/v1"}"#,
        )
        .unwrap();
        assert_eq!(b.timeout_secs, 120);
        assert!(b.api_key_env.is_empty());
        assert!(!b.local);
    }
}
