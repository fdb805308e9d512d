//! Tier selector: binds abstract panel slots to concrete models.
//!
//! Given a tier label and a required count, yields an ordered list of
//! model identifiers honoring capability requirements, budget, and a
//! diversity preference across provider families.

use tracing::debug;

use conclave_types::{Capability, CouncilError, FailureReason, ModelDescriptor, Result, Tier};

/// Scoring weights for candidate ranking.
#[derive(Debug, Clone, Copy)]
pub struct SelectionWeights {
    /// Weight on the model's quality score.
    pub quality: f64,
    /// Weight on normalized per-call cost (subtracted).
    pub cost: f64,
    /// Weight on the provider-diversity bonus.
    pub diversity: f64,
}

impl Default for SelectionWeights {
    fn default() -> Self {
        Self {
            quality: 0.6,
            cost: 0.3,
            diversity: 0.1,
        }
    }
}

/// What the orchestrator asks the selector for.
#[derive(Debug, Clone, Default)]
pub struct PanelRequest {
    /// Minimum tier; every candidate at or above is considered.
    pub tier: Tier,
    /// How many models the panel wants.
    pub count: usize,
    /// Capabilities every pick must advertise.
    pub capabilities: Vec<Capability>,
    /// Optional ceiling on the nominal per-call cost, USD.
    pub budget_ceiling_usd: Option<f64>,
}

/// Selects panel models from registry descriptors.
#[derive(Debug, Clone, Default)]
pub struct TierSelector {
    weights: SelectionWeights,
}

impl TierSelector {
    /// Selector with default weights (0.6 / 0.3 / 0.1).
    pub fn new() -> Self {
        Self::default()
    }

    /// Selector with custom weights.
    pub fn with_weights(weights: SelectionWeights) -> Self {
        Self { weights }
    }

    /// Produce an ordered list of model ids for the request.
    ///
    /// Returns fewer than `count` ids when the candidate pool runs dry
    /// (the orchestrator decides whether a reduced panel of ≥ 2 is
    /// acceptable), and `InsufficientPanel` when fewer than two viable
    /// candidates remain.
    pub fn select(
        &self,
        descriptors: &[ModelDescriptor],
        request: &PanelRequest,
    ) -> Result<Vec<String>> {
        // Step 1-2: tier floor, availability, capabilities, budget.
        let viable: Vec<&ModelDescriptor> = descriptors
            .iter()
            .filter(|d| d.available && d.tier >= request.tier)
            .filter(|d| d.has_capabilities(&request.capabilities))
            .filter(|d| match request.budget_ceiling_usd {
                Some(ceiling) => d.nominal_call_cost_usd() <= ceiling,
                None => true,
            })
            .collect();

        if viable.len() < 2 {
            debug!(
                tier = %request.tier,
                viable = viable.len(),
                "selection failed: fewer than two viable candidates"
            );
            return Err(CouncilError::session(FailureReason::InsufficientPanel));
        }

        let max_cost = viable
            .iter()
            .map(|d| d.nominal_call_cost_usd())
            .fold(0.0_f64, f64::max);

        // Step 3-4: greedy top-N by weighted score. The diversity bonus
        // depends on families already picked, so scores are recomputed
        // per pick.
        let mut picked: Vec<&ModelDescriptor> = Vec::new();
        let mut remaining = viable;

        while picked.len() < request.count && !remaining.is_empty() {
            let mut best: Option<(usize, f64)> = None;
            for (i, candidate) in remaining.iter().enumerate() {
                let score = self.score(candidate, max_cost, &picked);
                let better = match best {
                    None => true,
                    Some((best_i, best_score)) => {
                        if (score - best_score).abs() > f64::EPSILON {
                            score > best_score
                        } else {
                            // Tie-break: lower cost, then lexicographic id.
                            tie_break(candidate, remaining[best_i])
                        }
                    }
                };
                if better {
                    best = Some((i, score));
                }
            }
            let (idx, _) = best.expect("remaining is non-empty");
            picked.push(remaining.remove(idx));
        }

        debug!(
            tier = %request.tier,
            requested = request.count,
            selected = picked.len(),
            "panel selected"
        );

        Ok(picked.into_iter().map(|d| d.id.clone()).collect())
    }

    fn score(
        &self,
        candidate: &ModelDescriptor,
        max_cost: f64,
        picked: &[&ModelDescriptor],
    ) -> f64 {
        let normalized_cost = if max_cost > 0.0 {
            candidate.nominal_call_cost_usd() / max_cost
        } else {
            0.0
        };
        let family_already_picked = picked.iter().any(|p| p.provider == candidate.provider);
        let diversity_bonus = if family_already_picked { 0.0 } else { 1.0 };

        self.weights.quality * candidate.quality - self.weights.cost * normalized_cost
            + self.weights.diversity * diversity_bonus
    }
}

/// True if `a` wins the deterministic tie-break against `b`.
fn tie_break(a: &ModelDescriptor, b: &ModelDescriptor) -> bool {
    let (ca, cb) = (a.nominal_call_cost_usd(), b.nominal_call_cost_usd());
    if (ca - cb).abs() > f64::EPSILON {
        ca < cb
    } else {
        a.id < b.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_types::Pricing;
    use std::collections::BTreeSet;

    fn descriptor(
        id: &str,
        tier: Tier,
        quality: f64,
        output_price: f64,
        caps: &[Capability],
    ) -> ModelDescriptor {
        ModelDescriptor {
            id: id.into(),
            provider: id.split('/').next().unwrap().into(),
            tier,
            context_window: 128_000,
            pricing: Pricing {
                input_usd_per_mtok: output_price / 4.0,
                output_usd_per_mtok: output_price,
            },
            quality,
            capabilities: caps.iter().copied().collect::<BTreeSet<_>>(),
            hardware: None,
            available: true,
        }
    }

    fn pool() -> Vec<ModelDescriptor> {
        vec![
            descriptor(
                "openai/gpt-5.1",
                Tier::Frontier,
                0.96,
                10.0,
                &[Capability::Reasoning, Capability::Streaming],
            ),
            descriptor(
                "anthropic/claude-opus-4.5",
                Tier::Frontier,
                0.97,
                25.0,
                &[Capability::Reasoning, Capability::Streaming],
            ),
            descriptor(
                "google/gemini-3-pro-preview",
                Tier::Frontier,
                0.95,
                12.0,
                &[Capability::Reasoning, Capability::Streaming],
            ),
            descriptor(
                "x-ai/grok-4",
                Tier::High,
                0.91,
                15.0,
                &[Capability::Reasoning, Capability::Streaming],
            ),
            descriptor(
                "openai/gpt-5-mini",
                Tier::Standard,
                0.84,
                2.0,
                &[Capability::Streaming, Capability::JsonMode],
            ),
            descriptor(
                "mistralai/mistral-small",
                Tier::Quick,
                0.68,
                0.3,
                &[Capability::Streaming],
            ),
        ]
    }

    fn request(tier: Tier, count: usize) -> PanelRequest {
        PanelRequest {
            tier,
            count,
            capabilities: vec![],
            budget_ceiling_usd: None,
        }
    }

    #[test]
    fn default_weights() {
        let w = SelectionWeights::default();
        assert!((w.quality - 0.6).abs() < f64::EPSILON);
        assert!((w.cost - 0.3).abs() < f64::EPSILON);
        assert!((w.diversity - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn selects_requested_count() {
        let selector = TierSelector::new();
        let picked = selector.select(&pool(), &request(Tier::High, 3)).unwrap();
        assert_eq!(picked.len(), 3);
    }

    #[test]
    fn tier_floor_excludes_lower_tiers() {
        let selector = TierSelector::new();
        let picked = selector.select(&pool(), &request(Tier::Frontier, 4)).unwrap();
        // Only three frontier models exist; reduced panel returned.
        assert_eq!(picked.len(), 3);
        assert!(picked.iter().all(|id| !id.contains("grok")));
        assert!(picked.iter().all(|id| !id.contains("mini")));
    }

    #[test]
    fn capability_filter_applies() {
        let selector = TierSelector::new();
        let req = PanelRequest {
            tier: Tier::Quick,
            count: 10,
            capabilities: vec![Capability::Reasoning],
            budget_ceiling_usd: None,
        };
        let picked = selector.select(&pool(), &req).unwrap();
        assert_eq!(picked.len(), 4); // the four reasoning-capable models
        assert!(!picked.contains(&"openai/gpt-5-mini".to_string()));
    }

    #[test]
    fn budget_ceiling_drops_expensive_models() {
        let selector = TierSelector::new();
        // Opus: 2k*6.25/M + 1k*25/M = 0.0375 -- above a 0.03 ceiling.
        let req = PanelRequest {
            tier: Tier::Frontier,
            count: 5,
            capabilities: vec![],
            budget_ceiling_usd: Some(0.03),
        };
        let picked = selector.select(&pool(), &req).unwrap();
        assert!(!picked.contains(&"anthropic/claude-opus-4.5".to_string()));
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn unavailable_models_excluded() {
        let selector = TierSelector::new();
        let mut models = pool();
        for m in &mut models {
            if m.tier >= Tier::High {
                m.available = false;
            }
        }
        let err = selector
            .select(&models, &request(Tier::High, 2))
            .unwrap_err();
        assert!(matches!(
            err,
            CouncilError::SessionFailed {
                reason: FailureReason::InsufficientPanel
            }
        ));
    }

    #[test]
    fn insufficient_panel_below_two() {
        let selector = TierSelector::new();
        let models = vec![pool().remove(0)];
        assert!(selector.select(&models, &request(Tier::Quick, 2)).is_err());
    }

    #[test]
    fn diversity_spreads_providers() {
        let selector = TierSelector::new();
        // Equal costs; openai/b has the second-best quality but shares a
        // family with the first pick.
        let models = vec![
            descriptor("openai/a", Tier::Standard, 0.90, 4.0, &[]),
            descriptor("openai/b", Tier::Standard, 0.89, 4.0, &[]),
            descriptor("google/c", Tier::Standard, 0.88, 4.0, &[]),
            descriptor("anthropic/d", Tier::Standard, 0.85, 4.0, &[]),
        ];
        let picked = selector.select(&models, &request(Tier::Standard, 3)).unwrap();
        // Three distinct families beat doubling up on openai.
        let families: BTreeSet<&str> =
            picked.iter().map(|id| id.split('/').next().unwrap()).collect();
        assert_eq!(families.len(), 3);
        assert!(!picked.contains(&"openai/b".to_string()));
    }

    #[test]
    fn selection_is_deterministic() {
        let selector = TierSelector::new();
        let a = selector.select(&pool(), &request(Tier::Standard, 4)).unwrap();
        let b = selector.select(&pool(), &request(Tier::Standard, 4)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn tie_break_prefers_cheaper_then_lexicographic() {
        let a = descriptor("prov-a/model", Tier::Standard, 0.8, 1.0, &[]);
        let b = descriptor("prov-b/model", Tier::Standard, 0.8, 2.0, &[]);
        assert!(tie_break(&a, &b));
        assert!(!tie_break(&b, &a));

        let c = descriptor("prov-a/aardvark", Tier::Standard, 0.8, 1.0, &[]);
        assert!(tie_break(&c, &a));
    }

    #[test]
    fn ordering_puts_best_score_first() {
        let selector = TierSelector::new();
        let picked = selector.select(&pool(), &request(Tier::Frontier, 3)).unwrap();
        // gpt-5.1 scores best: strong quality at much lower cost than opus.
        assert_eq!(picked[0], "openai/gpt-5.1");
    }
}
