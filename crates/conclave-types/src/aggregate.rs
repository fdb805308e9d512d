//! Aggregated peer-review results.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The ranking aggregation method in effect for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RankingMethod {
    /// Normalized Borda count with self-vote exclusion.
    #[default]
    Borda,
    /// Schulze method over the pairwise preference matrix.
    Schulze,
}

impl std::fmt::Display for RankingMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RankingMethod::Borda => f.write_str("borda"),
            RankingMethod::Schulze => f.write_str("schulze"),
        }
    }
}

/// A binary verdict from the council.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinaryVerdict {
    Pass,
    Fail,
    Unclear,
}

impl BinaryVerdict {
    /// Exit code for CLI / gate invocations: 0 pass, 1 fail, 2 unclear.
    pub fn exit_code(&self) -> i32 {
        match self {
            BinaryVerdict::Pass => 0,
            BinaryVerdict::Fail => 1,
            BinaryVerdict::Unclear => 2,
        }
    }
}

/// A binary verdict with its margin-derived confidence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BinaryOutcome {
    pub verdict: BinaryVerdict,
    /// Confidence in [0, 1], derived from the vote margin.
    pub confidence: f64,
}

/// The outcome of aggregating a session's peer reviews.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    /// Final ordering of candidate slots, best first.
    pub ordering: Vec<usize>,
    /// Aggregate score per slot (Borda-scaled, [0, 1]).
    pub scores: BTreeMap<usize, f64>,
    /// Number of non-self reviews each slot received.
    pub vote_counts: BTreeMap<usize, usize>,
    /// Whether any tie-break rule decided adjacent positions.
    pub tie_break_applied: bool,
    /// Whether reviewer down-weighting was applied and the aggregate
    /// recomputed.
    pub bias_corrected: bool,
    /// Confidence in [0, 1]: reviewer agreement on the top two
    /// candidates.
    pub confidence: f64,
    /// The method that produced `ordering`.
    pub method: RankingMethod,
    /// Binary verdict, for binary-verdict sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<BinaryOutcome>,
}

impl AggregateResult {
    /// The winning slot, if any candidate was ranked.
    pub fn winner(&self) -> Option<usize> {
        self.ordering.first().copied()
    }

    /// True when the confidence is below the low-confidence threshold
    /// (0.5) and the final event should carry a `council.low_confidence`
    /// annotation.
    pub fn is_low_confidence(&self) -> bool {
        self.confidence < 0.5
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranking_method_display() {
        assert_eq!(RankingMethod::Borda.to_string(), "borda");
        assert_eq!(RankingMethod::Schulze.to_string(), "schulze");
    }

    #[test]
    fn binary_verdict_exit_codes() {
        assert_eq!(BinaryVerdict::Pass.exit_code(), 0);
        assert_eq!(BinaryVerdict::Fail.exit_code(), 1);
        assert_eq!(BinaryVerdict::Unclear.exit_code(), 2);
    }

    #[test]
    fn binary_verdict_serde_lowercase() {
        assert_eq!(
            serde_json::to_string(&BinaryVerdict::Unclear).unwrap(),
            "\"unclear\""
        );
    }

    #[test]
    fn winner_and_low_confidence() {
        let agg = AggregateResult {
            ordering: vec![2, 0, 1],
            scores: BTreeMap::from([(0, 0.5), (1, 0.1), (2, 0.9)]),
            vote_counts: BTreeMap::from([(0, 2), (1, 2), (2, 2)]),
            tie_break_applied: false,
            bias_corrected: false,
            confidence: 0.42,
            method: RankingMethod::Borda,
            binary: None,
        };
        assert_eq!(agg.winner(), Some(2));
        assert!(agg.is_low_confidence());
    }

    #[test]
    fn empty_ordering_has_no_winner() {
        let agg = AggregateResult {
            ordering: vec![],
            scores: BTreeMap::new(),
            vote_counts: BTreeMap::new(),
            tie_break_applied: false,
            bias_corrected: false,
            confidence: 1.0,
            method: RankingMethod::Borda,
            binary: None,
        };
        assert_eq!(agg.winner(), None);
        assert!(!agg.is_low_confidence());
    }
}
