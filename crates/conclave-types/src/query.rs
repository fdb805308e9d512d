//! The immutable query that starts a deliberation session.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How the chairman treats disagreement in Stage 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Synthesize a single best answer from the council's output.
    #[default]
    Consensus,
    /// Highlight disagreements and trade-offs instead of flattening them.
    Debate,
    /// Gate mode: the council renders a pass/fail verdict.
    BinaryVerdict,
}

/// The shape of the final answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum VerdictType {
    /// A free-form synthesis text.
    #[default]
    FreeForm,
    /// A pass / fail / unclear verdict with confidence.
    Binary,
    /// Numeric rubric scores across the standard dimensions.
    Rubric,
}

/// Coarse quality band used by panel selection.
///
/// Tiers are strictly ordered: `Quick < Standard < High < Frontier`.
/// Selection considers every model at or above the requested tier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Quick,
    #[default]
    Standard,
    High,
    Frontier,
}

impl Tier {
    /// Parse a tier label. Accepts the lowercase wire form.
    pub fn parse(s: &str) -> Option<Tier> {
        match s {
            "quick" => Some(Tier::Quick),
            "standard" => Some(Tier::Standard),
            "high" => Some(Tier::High),
            "frontier" => Some(Tier::Frontier),
            _ => None,
        }
    }

    /// The lowercase wire label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Quick => "quick",
            Tier::Standard => "standard",
            Tier::High => "high",
            Tier::Frontier => "frontier",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single user query submitted for deliberation.
///
/// Immutable once constructed; born on submission, destroyed on return.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    /// Unique query id (UUID v4 unless supplied by the caller).
    pub id: String,

    /// The user prompt text.
    pub prompt: String,

    /// Chairman behavior.
    #[serde(default)]
    pub mode: Mode,

    /// Shape of the final answer.
    #[serde(default)]
    pub verdict_type: VerdictType,

    /// Optional rubric focus tag (e.g. "Security", "Performance").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rubric_focus: Option<String>,

    /// When set, participant prompts contain only declared snapshot
    /// material -- never prior conversation turns.
    #[serde(default)]
    pub context_isolation: bool,

    /// Opaque identifier pinning the input under deliberation
    /// (e.g. a commit hash).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,

    /// Prior conversation turns. Rejected when `context_isolation` is set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<String>,

    /// Requested quality band for the panel.
    #[serde(default)]
    pub tier: Tier,

    /// Overall session deadline in milliseconds, if the caller set one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,

    /// Whether the caller wants Stage 3 streamed as `stage3.token` events.
    #[serde(default)]
    pub streaming: bool,
}

impl Query {
    /// Create a query with a fresh UUID and defaults for everything
    /// beyond the prompt.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            prompt: prompt.into(),
            mode: Mode::default(),
            verdict_type: VerdictType::default(),
            rubric_focus: None,
            context_isolation: false,
            snapshot_id: None,
            history: Vec::new(),
            tier: Tier::default(),
            deadline_ms: None,
            streaming: false,
        }
    }

    /// Set the deliberation mode.
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the verdict type.
    pub fn with_verdict_type(mut self, vt: VerdictType) -> Self {
        self.verdict_type = vt;
        self
    }

    /// Set the requested tier.
    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    /// Pin a snapshot id.
    pub fn with_snapshot(mut self, snapshot_id: impl Into<String>) -> Self {
        self.snapshot_id = Some(snapshot_id.into());
        self
    }
}

/// Validate a snapshot id that is formatted like a git SHA.
///
/// Opaque snapshot ids are accepted as-is; ids consisting solely of hex
/// characters must be 7..=40 chars long (abbreviated to full SHA-1).
pub fn snapshot_id_is_valid(snapshot_id: &str) -> bool {
    if snapshot_id.is_empty() {
        return false;
    }
    let all_hex = snapshot_id.chars().all(|c| c.is_ascii_hexdigit());
    if all_hex {
        (7..=40).contains(&snapshot_id.len())
    } else {
        true
    }
}
