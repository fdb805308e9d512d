//! Session and engine configuration.
//!
//! Precedence: environment variables > config file > built-in defaults,
//! matching the engine's documented configuration surface. The file
//! format is JSON; every field has a serde default so partial files are
//! valid.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::aggregate::RankingMethod;
use crate::error::{CouncilError, Result};
use crate::query::{Mode, VerdictType};

/// Webhook subscription for lifecycle events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Destination URL for event POSTs.
    pub url: String,
    /// Shared secret for HMAC-SHA256 body signing.
    pub secret: String,
    /// Event kinds to deliver (wire names). Empty means all kinds.
    #[serde(default)]
    pub events: Vec<String>,
}

/// Full engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouncilConfig {
    /// Chairman behavior: consensus or debate.
    #[serde(default)]
    pub mode: Mode,

    /// Shape of the final answer.
    #[serde(default)]
    pub verdict_type: VerdictType,

    /// Ranking aggregation method.
    #[serde(default)]
    pub ranking_method: RankingMethod,

    /// Exclude reviewers' rankings of their own responses.
    #[serde(default = "default_true")]
    pub exclude_self_votes: bool,

    /// Enable Stage 1.5 style normalization.
    #[serde(default)]
    pub style_normalization: bool,

    /// Cap on reviewers per candidate; `None` means every participant
    /// reviews. Recommended 3 for panels larger than 5.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_reviewers: Option<usize>,

    /// Shuffle candidate order independently per reviewer.
    #[serde(default = "default_true")]
    pub position_randomization: bool,

    /// Offline mode: static metadata only, local gateway preferred.
    #[serde(default)]
    pub offline: bool,

    /// Enable dynamic model metadata fetching.
    #[serde(default = "default_true")]
    pub model_intelligence_enabled: bool,

    /// Council participant models, in preference order.
    #[serde(default = "default_council_models")]
    pub council_models: Vec<String>,

    /// The model executing Stage 3 synthesis.
    #[serde(default = "default_chairman")]
    pub chairman_model: String,

    /// Cheap model used for Stage 1.5 normalization.
    #[serde(default = "default_normalizer")]
    pub normalizer_model: String,

    /// Default session deadline in milliseconds.
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,

    /// Ceiling for any single gateway call, in milliseconds.
    #[serde(default = "default_per_call_ceiling_ms")]
    pub per_call_ceiling_ms: u64,

    /// Root directory for session transcripts.
    #[serde(default = "default_transcript_root")]
    pub transcript_root: PathBuf,

    /// Optional webhook subscriber.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookConfig>,
}

fn default_true() -> bool {
    true
}

fn default_council_models() -> Vec<String> {
    vec![
        "openai/gpt-5.1".into(),
        "google/gemini-3-pro-preview".into(),
        "anthropic/claude-opus-4.5".into(),
        "x-ai/grok-4".into(),
    ]
}

fn default_chairman() -> String {
    "google/gemini-3-pro-preview".into()
}

fn default_normalizer() -> String {
    "google/gemini-2.5-flash".into()
}

fn default_deadline_ms() -> u64 {
    300_000
}

fn default_per_call_ceiling_ms() -> u64 {
    120_000
}

fn default_transcript_root() -> PathBuf {
    PathBuf::from("conclave-transcripts")
}

impl Default for CouncilConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialize")
    }
}

impl CouncilConfig {
    /// Load from a JSON file, then apply environment overrides.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: CouncilConfig =
            serde_json::from_str(&raw).map_err(|e| CouncilError::ConfigInvalid {
                reason: format!("{}: {e}", path.display()),
            })?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Built-in defaults with environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut config = CouncilConfig::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `CONCLAVE_*` environment variables over the current values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(models) = std::env::var("CONCLAVE_MODELS") {
            let parsed: Vec<String> = models
                .split(',')
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .collect();
            if !parsed.is_empty() {
                self.council_models = parsed;
            }
        }
        if let Ok(chairman) = std::env::var("CONCLAVE_CHAIRMAN") {
            if !chairman.trim().is_empty() {
                self.chairman_model = chairman.trim().to_string();
            }
        }
        if let Ok(mode) = std::env::var("CONCLAVE_MODE") {
            match mode.as_str() {
                "consensus" => self.mode = Mode::Consensus,
                "debate" => self.mode = Mode::Debate,
                "binary-verdict" => self.mode = Mode::BinaryVerdict,
                _ => {}
            }
        }
        if let Some(v) = env_bool("CONCLAVE_EXCLUDE_SELF_VOTES") {
            self.exclude_self_votes = v;
        }
        if let Some(v) = env_bool("CONCLAVE_STYLE_NORMALIZATION") {
            self.style_normalization = v;
        }
        if let Some(v) = env_bool("CONCLAVE_POSITION_RANDOMIZATION") {
            self.position_randomization = v;
        }
        if let Some(v) = env_bool("CONCLAVE_OFFLINE") {
            self.offline = v;
        }
        if let Some(v) = env_bool("CONCLAVE_MODEL_INTELLIGENCE") {
            self.model_intelligence_enabled = v;
        }
        if let Ok(max) = std::env::var("CONCLAVE_MAX_REVIEWERS") {
            if let Ok(n) = max.parse::<usize>() {
                self.max_reviewers = Some(n);
            }
        }
        if let Ok(method) = std::env::var("CONCLAVE_RANKING_METHOD") {
            match method.as_str() {
                "borda" => self.ranking_method = RankingMethod::Borda,
                "schulze" => self.ranking_method = RankingMethod::Schulze,
                _ => {}
            }
        }
    }

    /// Surface configuration errors at startup; these are fatal.
    pub fn validate(&self) -> Result<()> {
        if self.council_models.len() < 2 {
            return Err(CouncilError::ConfigInvalid {
                reason: format!(
                    "council needs at least 2 models, got {}",
                    self.council_models.len()
                ),
            });
        }
        if self.chairman_model.is_empty() {
            return Err(CouncilError::ConfigInvalid {
                reason: "chairman_model is empty".into(),
            });
        }
        if self.deadline_ms == 0 {
            return Err(CouncilError::ConfigInvalid {
                reason: "deadline_ms must be positive".into(),
            });
        }
        if let Some(0) = self.max_reviewers {
            return Err(CouncilError::ConfigInvalid {
                reason: "max_reviewers must be at least 1 when set".into(),
            });
        }
        if let Some(ref webhook) = self.webhook {
            if webhook.url.is_empty() || webhook.secret.is_empty() {
                return Err(CouncilError::ConfigInvalid {
                    reason: "webhook requires both url and secret".into(),
                });
            }
        }
        Ok(())
    }
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
}
