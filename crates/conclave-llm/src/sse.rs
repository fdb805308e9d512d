//! SSE (Server-Sent Events) line parser for OpenAI-compatible streaming.
//!
//! Parses the `data:` lines from an SSE stream into [`StreamChunk`]
//! values. The OpenAI streaming format sends lines like:
//!
//! ```text
//! data: {"choices":[{"delta":{"content":"Hello"}}]}
//!
//! data: {"choices":[{"delta":{"content":" world"}}]}
//!
//! data: [DONE]
//! ```
//!
//! Each non-empty `data:` line is either a JSON delta object or the
//! literal `[DONE]` sentinel marking end of stream. Some backends omit
//! the sentinel and instead set `finish_reason` on the last delta; the
//! parser emits `Done` for either form.

use crate::error::{GatewayError, Result};
use crate::types::{StreamChunk, WireDelta};

/// The sentinel value that marks the end of an SSE stream.
const DONE_SENTINEL: &str = "[DONE]";

/// Parse a single SSE line into zero or more [`StreamChunk`] values.
///
/// Returns `Ok(vec![])` for empty lines (event boundaries), comment
/// lines, and non-`data:` fields.
///
/// # Errors
///
/// Returns [`GatewayError::InvalidResponse`] if a `data:` payload is not
/// valid delta JSON.
pub fn parse_sse_line(line: &str) -> Result<Vec<StreamChunk>> {
    let line = line.trim_end();

    if line.is_empty() || line.starts_with(':') {
        return Ok(vec![]);
    }

    let payload = match line.strip_prefix("data:") {
        Some(rest) => rest.trim_start(),
        // event:, id:, retry: lines
        None => return Ok(vec![]),
    };

    if payload.is_empty() {
        return Ok(vec![]);
    }

    if payload == DONE_SENTINEL {
        return Ok(vec![StreamChunk::Done { usage: None }]);
    }

    let delta: WireDelta = serde_json::from_str(payload)
        .map_err(|e| GatewayError::InvalidResponse(format!("bad SSE delta: {e}")))?;

    let mut chunks = Vec::new();
    for choice in &delta.choices {
        if let Some(ref text) = choice.delta.content {
            if !text.is_empty() {
                chunks.push(StreamChunk::TextDelta { text: text.clone() });
            }
        }
        if choice.finish_reason.is_some() {
            chunks.push(StreamChunk::Done { usage: delta.usage });
        }
    }
    Ok(chunks)
}

/// Incremental line splitter for SSE byte streams.
///
/// HTTP bodies arrive in arbitrary chunks; this buffers partial lines
/// across chunk boundaries and yields complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a byte chunk and return every complete line it closed.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.push_str(&String::from_utf8_lossy(bytes));
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=pos).collect();
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }
        lines
    }

    /// The unterminated tail, if any (valid streams end with a newline).
    pub fn remainder(&self) -> &str {
        &self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_delta() {
        let chunks =
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#).unwrap();
        assert_eq!(
            chunks,
            vec![StreamChunk::TextDelta { text: "Hi".into() }]
        );
    }

    #[test]
    fn parses_done_sentinel() {
        let chunks = parse_sse_line("data: [DONE]").unwrap();
        assert_eq!(chunks, vec![StreamChunk::Done { usage: None }]);
    }

    #[test]
    fn finish_reason_emits_done() {
        let line = r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}],"usage":{"prompt_tokens":1,"completion_tokens":2,"total_tokens":3}}"#;
        let chunks = parse_sse_line(line).unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(matches!(
            chunks[0],
            StreamChunk::Done { usage: Some(u) } if u.total_tokens == 3
        ));
    }

    #[test]
    fn delta_with_text_and_finish_emits_both() {
        let line = r#"data: {"choices":[{"delta":{"content":"end"},"finish_reason":"stop"}]}"#;
        let chunks = parse_sse_line(line).unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(matches!(chunks[0], StreamChunk::TextDelta { ref text } if text == "end"));
        assert!(matches!(chunks[1], StreamChunk::Done { .. }));
    }

    #[test]
    fn skips_empty_and_comment_lines() {
        assert!(parse_sse_line("").unwrap().is_empty());
        assert!(parse_sse_line(": keepalive").unwrap().is_empty());
        assert!(parse_sse_line("event: message").unwrap().is_empty());
        assert!(parse_sse_line("data:").unwrap().is_empty());
    }

    #[test]
    fn rejects_bad_json() {
        assert!(parse_sse_line("data: {broken").is_err());
    }

    #[test]
    fn line_buffer_splits_across_chunks() {
        let mut buf = LineBuffer::new();
        let lines = buf.push(b"data: {\"cho");
        assert!(lines.is_empty());
        let lines = buf.push(b"ices\":[]}\n\ndata: [DONE]\n");
        assert_eq!(
            lines,
            vec![
                "data: {\"choices\":[]}".to_string(),
                String::new(),
                "data: [DONE]".to_string()
            ]
        );
        assert!(buf.remainder().is_empty());
    }

    #[test]
    fn line_buffer_strips_crlf() {
        let mut buf = LineBuffer::new();
        let lines = buf.push(b"data: [DONE]\r\n");
        assert_eq!(lines, vec!["data: [DONE]".to_string()]);
    }
}
