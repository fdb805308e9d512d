//! Panel slots and Stage 1 responses.

use serde::{Deserialize, Serialize};

/// Role of a slot within the panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotRole {
    /// Generates a Stage 1 response and reviews peers in Stage 2.
    Participant,
    /// Executes Stage 3 synthesis; may be distinct from participants.
    Chairman,
}

/// A position in the panel, bound to one model.
///
/// Assigned by the tier selector; immutable after assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelSlot {
    /// Slot index, stable for the lifetime of the query.
    pub index: usize,
    /// The model identifier bound to this slot.
    pub model_id: String,
    /// Participant or chairman.
    pub role: SlotRole,
}

/// Token usage reported by the gateway for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    /// Tokens in the prompt.
    pub prompt_tokens: u64,
    /// Tokens in the completion.
    pub completion_tokens: u64,
    /// Total tokens.
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Sum two usage records.
    pub fn add(&self, other: &TokenUsage) -> TokenUsage {
        TokenUsage {
            prompt_tokens: self.prompt_tokens + other.prompt_tokens,
            completion_tokens: self.completion_tokens + other.completion_tokens,
            total_tokens: self.total_tokens + other.total_tokens,
        }
    }
}

/// Machine-readable annotation that a stage completed with reduced
/// guarantees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationNotice {
    /// The slot the notice concerns, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<usize>,
    /// What was degraded and why.
    pub message: String,
}

impl DegradationNotice {
    /// A notice not tied to a specific slot.
    pub fn session(message: impl Into<String>) -> Self {
        Self {
            slot: None,
            message: message.into(),
        }
    }

    /// A notice about one slot.
    pub fn for_slot(slot: usize, message: impl Into<String>) -> Self {
        Self {
            slot: Some(slot),
            message: message.into(),
        }
    }
}

/// Terminal status of one Stage 1 slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    /// The slot produced a usable response.
    Ok,
    /// The call failed after retries.
    Failed,
    /// The call exceeded its deadline.
    Timeout,
    /// The session was cancelled while the call was in flight.
    Cancelled,
}

/// One participant's Stage 1 output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOneResponse {
    /// The slot that produced this response.
    pub slot: usize,
    /// Response text; empty unless `status` is `Ok`.
    pub content: String,
    /// Token usage for the call, if the backend reported it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    /// Wall-clock latency of the call in milliseconds.
    pub latency_ms: u64,
    /// Ordered degradation notices attached by the gateway.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notices: Vec<DegradationNotice>,
    /// How the slot terminated.
    pub status: SlotStatus,
}

impl StageOneResponse {
    /// True if the slot produced usable content.
    pub fn is_ok(&self) -> bool {
        self.status == SlotStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_role_serde() {
        assert_eq!(
            serde_json::to_string(&SlotRole::Chairman).unwrap(),
            "\"chairman\""
        );
    }

    #[test]
    fn token_usage_add() {
        let a = TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        };
        let b = TokenUsage {
            prompt_tokens: 1,
            completion_tokens: 2,
            total_tokens: 3,
        };
        let sum = a.add(&b);
        assert_eq!(sum.prompt_tokens, 11);
        assert_eq!(sum.total_tokens, 18);
    }

    #[test]
    fn degradation_notice_constructors() {
        let n = DegradationNotice::session("dynamic metadata unavailable");
        assert!(n.slot.is_none());
        let n = DegradationNotice::for_slot(2, "circuit open");
        assert_eq!(n.slot, Some(2));
        assert_eq!(n.message, "circuit open");
    }

    #[test]
    fn stage_one_response_is_ok() {
        let ok = StageOneResponse {
            slot: 0,
            content: "answer".into(),
            usage: None,
            latency_ms: 1200,
            notices: vec![],
            status: SlotStatus::Ok,
        };
        assert!(ok.is_ok());

        let failed = StageOneResponse {
            status: SlotStatus::Failed,
            content: String::new(),
            ..ok.clone()
        };
        assert!(!failed.is_ok());
    }

    #[test]
    fn stage_one_response_serde_skips_empty() {
        let r = StageOneResponse {
            slot: 1,
            content: "x".into(),
            usage: None,
            latency_ms: 10,
            notices: vec![],
            status: SlotStatus::Ok,
        };
        let json = serde_json::to_string(&r).unwrap();
        assert!(!json.contains("usage"));
        assert!(!json.contains("notices"));
    }
}
