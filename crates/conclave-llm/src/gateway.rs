//! The core [`Gateway`] trait for LLM completion calls.
//!
//! All backends implement this trait, which provides a `complete`
//! method plus a streaming variant. A backend that cannot stream keeps
//! the default `complete_stream`, which synthesizes a single-chunk
//! stream so consumers always see at least one chunk and a terminal
//! marker.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::{CompletionRequest, CompletionResult, StreamChunk};

/// A backend that can execute completion requests.
///
/// Implementations handle the protocol details for a specific transport
/// (authentication, request formatting, response parsing). The main
/// implementation is
/// [`OpenAiCompatBackend`](crate::openai_compat::OpenAiCompatBackend),
/// which works with any OpenAI-compatible endpoint, remote or local.
///
/// # Example
///
/// ```rust,ignore
/// use conclave_llm::{Gateway, CompletionRequest, ChatMessage};
///
/// async fn ask(gateway: &dyn Gateway) -> conclave_llm::Result<String> {
///     let request = CompletionRequest::new("openai/gpt-5.1", vec![
///         ChatMessage::user("What is 2+2?"),
///     ]);
///     let result = gateway.complete(&request).await?;
///     Ok(result.content)
/// }
/// ```
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Returns the backend name (e.g. "openrouter", "local").
    fn name(&self) -> &str;

    /// Execute a completion request and return the result.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`](crate::error::GatewayError) if the
    /// request fails due to network issues, authentication problems,
    /// rate limiting, a tripped circuit breaker, or an invalid response.
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResult>;

    /// Execute a completion request, yielding chunks over `tx`.
    ///
    /// The stream always contains at least one
    /// [`StreamChunk::TextDelta`] and ends with exactly one
    /// [`StreamChunk::Done`]. The default implementation wraps
    /// [`complete`](Gateway::complete) into a synthesized single-chunk
    /// stream for backends without native streaming.
    async fn complete_stream(
        &self,
        request: &CompletionRequest,
        tx: mpsc::Sender<StreamChunk>,
    ) -> Result<()> {
        let result = self.complete(request).await?;
        let _ = tx
            .send(StreamChunk::TextDelta {
                text: result.content,
            })
            .await;
        let _ = tx
            .send(StreamChunk::Done {
                usage: result.usage,
            })
            .await;
        Ok(())
    }
}
