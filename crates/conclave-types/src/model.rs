//! Per-model metadata supplied by the registry.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::query::Tier;

/// A capability a model must advertise before selection can bind it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    /// Extended reasoning / chain-of-thought quality.
    Reasoning,
    /// Supports token streaming.
    Streaming,
    /// Supports a JSON output mode hint.
    JsonMode,
}

/// Per-token pricing, in USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Pricing {
    /// Input (prompt) price, USD per 1M tokens.
    pub input_usd_per_mtok: f64,
    /// Output (completion) price, USD per 1M tokens.
    pub output_usd_per_mtok: f64,
}

impl Pricing {
    /// Estimated cost of a call with the given token counts.
    pub fn estimate_usd(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 * self.input_usd_per_mtok
            + output_tokens as f64 * self.output_usd_per_mtok)
            / 1_000_000.0
    }
}

/// Hardware requirements for locally hosted models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareProfile {
    /// Minimum VRAM in gigabytes.
    pub min_vram_gb: u32,
    /// Whether a GPU is required at all (CPU fallback degrades quality).
    pub requires_gpu: bool,
}

/// Static or dynamically fetched attributes of one model.
///
/// Keyed by the model identifier (e.g. `openai/gpt-5.1`). The provider
/// family is the prefix before the first `/`, used by the selector's
/// diversity preference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Model identifier, `family/name` form.
    pub id: String,

    /// Provider family (e.g. "openai", "anthropic", "local").
    pub provider: String,

    /// Quality band this model belongs to.
    pub tier: Tier,

    /// Context window in tokens.
    pub context_window: u64,

    /// Pricing per token.
    #[serde(default)]
    pub pricing: Pricing,

    /// Quality score in [0, 1].
    pub quality: f64,

    /// Advertised capabilities.
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,

    /// Hardware profile for local models.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<HardwareProfile>,

    /// Whether the model is currently accepting traffic.
    #[serde(default = "default_available")]
    pub available: bool,
}

fn default_available() -> bool {
    true
}

impl ModelDescriptor {
    /// Returns true if every required capability is advertised.
    pub fn has_capabilities(&self, required: &[Capability]) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }

    /// Rough per-call cost estimate used for budget filtering, assuming a
    /// nominal 2k-in / 1k-out exchange.
    pub fn nominal_call_cost_usd(&self) -> f64 {
        self.pricing.estimate_usd(2_000, 1_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str, tier: Tier, quality: f64) -> ModelDescriptor {
        ModelDescriptor {
            id: id.into(),
            provider: id.split('/').next().unwrap_or("").into(),
            tier,
            context_window: 128_000,
            pricing: Pricing {
                input_usd_per_mtok: 3.0,
                output_usd_per_mtok: 15.0,
            },
            quality,
            capabilities: BTreeSet::from([Capability::Reasoning, Capability::Streaming]),
            hardware: None,
            available: true,
        }
    }

    #[test]
    fn pricing_estimate() {
        let p = Pricing {
            input_usd_per_mtok: 3.0,
            output_usd_per_mtok: 15.0,
        };
        let cost = p.estimate_usd(1_000_000, 1_000_000);
        assert!((cost - 18.0).abs() < 1e-9);
    }

    #[test]
    fn nominal_call_cost() {
        let d = descriptor("openai/gpt-5.1", Tier::Frontier, 0.95);
        // 2k in @ $3/M + 1k out @ $15/M = 0.006 + 0.015
        assert!((d.nominal_call_cost_usd() - 0.021).abs() < 1e-9);
    }

    #[test]
    fn capability_check() {
        let d = descriptor("anthropic/claude-opus-4.5", Tier::Frontier, 0.97);
        assert!(d.has_capabilities(&[Capability::Reasoning]));
        assert!(d.has_capabilities(&[Capability::Reasoning, Capability::Streaming]));
        assert!(!d.has_capabilities(&[Capability::JsonMode]));
    }

    #[test]
    fn descriptor_serde_roundtrip() {
        let d = descriptor("x-ai/grok-4", Tier::High, 0.88);
        let json = serde_json::to_string(&d).unwrap();
        let back: ModelDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(d, back);
    }

    #[test]
    fn available_defaults_true() {
        let json = r#"{
            "id": "openai/gpt-5.1",
            "provider": "openai",
            "tier": "frontier",
            "context_window": 200000,
            "quality": 0.95
        }"#;
        let d: ModelDescriptor = serde_json::from_str(json).unwrap();
        assert!(d.available);
        assert!(d.capabilities.is_empty());
    }

    #[test]
    fn capability_serde_kebab() {
        assert_eq!(
            serde_json::to_string(&Capability::JsonMode).unwrap(),
            "\"json-mode\""
        );
    }
}
