//! Request and response types for gateway completion calls.
//!
//! These mirror the OpenAI chat completion wire format, which every
//! backend the gateway supports speaks. They are standalone and have no
//! dependency on other conclave crates.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    /// The role of the message author ("system", "user", "assistant").
    pub role: String,
    /// The content of the message.
    pub content: String,
}

impl ChatMessage {
    /// Create a message with role and content.
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// Per-call options carried alongside the prompt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionOptions {
    /// Deadline for each attempt. `None` falls back to the backend's
    /// configured timeout.
    pub deadline: Option<Duration>,
    /// Maximum number of tokens to generate.
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    pub temperature: Option<f64>,
    /// Hint that the response should be a JSON object.
    pub json_mode: bool,
}

/// A completion request sent through the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    /// The model identifier (e.g. "openai/gpt-5.1").
    pub model: String,
    /// The conversation messages.
    pub messages: Vec<ChatMessage>,
    /// Per-call options.
    pub options: CompletionOptions,
}

impl CompletionRequest {
    /// Create a minimal request with a model and messages.
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            options: CompletionOptions::default(),
        }
    }

    /// Set the per-attempt deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.options.deadline = Some(deadline);
        self
    }

    /// Set the max token count.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.options.max_tokens = Some(max_tokens);
        self
    }
}

/// Token usage statistics for a completion.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
pub struct Usage {
    /// Number of tokens in the prompt.
    #[serde(default)]
    pub prompt_tokens: u64,
    /// Number of tokens in the generated completion.
    #[serde(default)]
    pub completion_tokens: u64,
    /// Total tokens used.
    #[serde(default)]
    pub total_tokens: u64,
}

/// The gateway's view of a completed call.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResult {
    /// The generated text.
    pub content: String,
    /// The model that actually served the call.
    pub model: String,
    /// Token usage, if the backend reported it.
    pub usage: Option<Usage>,
    /// Ordered quality caveats attached by the resilience layer
    /// (e.g. "served by CPU fallback", "context truncated").
    pub notices: Vec<String>,
}

// ── Streaming types ─────────────────────────────────────────────────────

/// A chunk yielded by the streaming completion variant.
///
/// A well-formed stream contains at least one `TextDelta` followed by
/// exactly one terminal `Done`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// A partial text delta.
    TextDelta {
        /// The partial text content.
        text: String,
    },
    /// The terminal marker.
    Done {
        /// Token usage, if the backend sent it in the final chunk.
        usage: Option<Usage>,
    },
}

// ── Wire types (OpenAI chat completion format) ──────────────────────────

/// The request body sent to an OpenAI-compatible endpoint.
#[derive(Debug, Serialize)]
pub(crate) struct WireRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

/// A chat completion response in the OpenAI format.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct WireResponse {
    #[serde(default)]
    pub choices: Vec<WireChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub model: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct WireChoice {
    pub message: ChatMessage,
}

/// A streaming delta in the OpenAI `chat.completion.chunk` format.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct WireDelta {
    #[serde(default)]
    pub choices: Vec<WireDeltaChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct WireDeltaChoice {
    #[serde(default)]
    pub delta: WireDeltaContent,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct WireDeltaContent {
    #[serde(default)]
    pub content: Option<String>,
}
