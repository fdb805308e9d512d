//! Peer reviews produced by Stage 2.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Maximum length of a preserved dissent note, in characters.
pub const DISSENT_CAP_CHARS: usize = 4_000;

/// Numeric rubric scores for one candidate, each dimension in [0, 10].
///
/// Missing dimensions are `None`, never zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct RubricScores {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completeness: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conciseness: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relevance: Option<f64>,
}

impl RubricScores {
    /// Clamp every present dimension to [0, 10].
    pub fn clamped(self) -> RubricScores {
        let c = |v: Option<f64>| v.map(|x| x.clamp(0.0, 10.0));
        RubricScores {
            accuracy: c(self.accuracy),
            completeness: c(self.completeness),
            clarity: c(self.clarity),
            conciseness: c(self.conciseness),
            relevance: c(self.relevance),
        }
    }

    /// True if no dimension is present.
    pub fn is_empty(&self) -> bool {
        self.accuracy.is_none()
            && self.completeness.is_none()
            && self.clarity.is_none()
            && self.conciseness.is_none()
            && self.relevance.is_none()
    }
}

/// One candidate's position in a reviewer's ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedCandidate {
    /// Candidate slot index.
    pub slot: usize,
    /// 1-indexed rank among the reviewer's non-self candidates
    /// (1 = best).
    pub rank: usize,
}

/// A validated peer review from one reviewer.
///
/// Invariant: `ranking` is a permutation of the non-self candidate set --
/// every candidate except the reviewer's own appears exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerReview {
    /// Slot index of the reviewer.
    pub reviewer: usize,
    /// Ordered ranking over the non-self candidates, best first.
    pub ranking: Vec<RankedCandidate>,
    /// Optional rubric scores per candidate slot.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scores: Vec<(usize, RubricScores)>,
    /// Pass/fail vote for binary-verdict sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass_vote: Option<bool>,
    /// Dissent note preserved verbatim up to [`DISSENT_CAP_CHARS`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dissent: Option<String>,
    /// Disqualifying defects the reviewer reported, including
    /// prompt-injection attempts found in candidate text. These never
    /// auto-fail the session.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocking_issues: Vec<String>,
    /// Whether the reviewer attempted to rank its own response
    /// (the entry was stripped before validation).
    #[serde(default)]
    pub self_vote_stripped: bool,
}

impl PeerReview {
    /// The rank this reviewer awarded to `slot`, if any.
    pub fn rank_of(&self, slot: usize) -> Option<usize> {
        self.ranking
            .iter()
            .find(|rc| rc.slot == slot)
            .map(|rc| rc.rank)
    }

    /// Rubric scores this reviewer awarded to `slot`, if any.
    pub fn scores_for(&self, slot: usize) -> Option<&RubricScores> {
        self.scores.iter().find(|(s, _)| *s == slot).map(|(_, r)| r)
    }

    /// Verify the permutation invariant against the full candidate set.
    ///
    /// `candidates` is every slot under review, including the reviewer's
    /// own; the ranking must cover exactly the non-self subset with
    /// consecutive ranks `1..=n`.
    pub fn is_permutation_of(&self, candidates: &[usize]) -> bool {
        let expected: BTreeSet<usize> = candidates
            .iter()
            .copied()
            .filter(|s| *s != self.reviewer)
            .collect();
        let seen: BTreeSet<usize> = self.ranking.iter().map(|rc| rc.slot).collect();
        if seen != expected || self.ranking.len() != expected.len() {
            return false;
        }
        let ranks: BTreeSet<usize> = self.ranking.iter().map(|rc| rc.rank).collect();
        ranks == (1..=expected.len()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn review(reviewer: usize, slots_best_first: &[usize]) -> PeerReview {
        PeerReview {
            reviewer,
            ranking: slots_best_first
                .iter()
                .enumerate()
                .map(|(i, s)| RankedCandidate { slot: *s, rank: i + 1 })
                .collect(),
            scores: vec![],
            pass_vote: None,
            dissent: None,
            blocking_issues: vec![],
            self_vote_stripped: false,
        }
    }

    #[test]
    fn rubric_scores_clamp() {
        let s = RubricScores {
            accuracy: Some(12.0),
            completeness: Some(-1.0),
            clarity: None,
            conciseness: Some(5.5),
            relevance: None,
        }
        .clamped();
        assert_eq!(s.accuracy, Some(10.0));
        assert_eq!(s.completeness, Some(0.0));
        assert_eq!(s.clarity, None);
        assert_eq!(s.conciseness, Some(5.5));
    }

    #[test]
    fn rubric_scores_empty() {
        assert!(RubricScores::default().is_empty());
        assert!(!RubricScores {
            accuracy: Some(5.0),
            ..Default::default()
        }
        .is_empty());
    }

    #[test]
    fn permutation_holds() {
        let r = review(1, &[2, 0, 3]);
        assert!(r.is_permutation_of(&[0, 1, 2, 3]));
    }

    #[test]
    fn permutation_rejects_missing_candidate() {
        let r = review(1, &[2, 0]);
        assert!(!r.is_permutation_of(&[0, 1, 2, 3]));
    }

    #[test]
    fn permutation_rejects_duplicate() {
        let r = PeerReview {
            reviewer: 1,
            ranking: vec![
                RankedCandidate { slot: 0, rank: 1 },
                RankedCandidate { slot: 0, rank: 2 },
                RankedCandidate { slot: 2, rank: 3 },
            ],
            scores: vec![],
            pass_vote: None,
            dissent: None,
            blocking_issues: vec![],
            self_vote_stripped: false,
        };
        assert!(!r.is_permutation_of(&[0, 1, 2, 3]));
    }

    #[test]
    fn permutation_rejects_self_inclusion() {
        let r = review(1, &[2, 1, 0]);
        assert!(!r.is_permutation_of(&[0, 1, 2]));
    }

    #[test]
    fn permutation_rejects_non_consecutive_ranks() {
        let r = PeerReview {
            reviewer: 3,
            ranking: vec![
                RankedCandidate { slot: 0, rank: 1 },
                RankedCandidate { slot: 1, rank: 3 },
                RankedCandidate { slot: 2, rank: 4 },
            ],
            scores: vec![],
            pass_vote: None,
            dissent: None,
            blocking_issues: vec![],
            self_vote_stripped: false,
        };
        assert!(!r.is_permutation_of(&[0, 1, 2, 3]));
    }

    #[test]
    fn rank_and_score_lookup() {
        let mut r = review(0, &[2, 1]);
        r.scores = vec![(
            2,
            RubricScores {
                accuracy: Some(9.0),
                ..Default::default()
            },
        )];
        assert_eq!(r.rank_of(2), Some(1));
        assert_eq!(r.rank_of(1), Some(2));
        assert_eq!(r.rank_of(0), None);
        assert_eq!(r.scores_for(2).unwrap().accuracy, Some(9.0));
        assert!(r.scores_for(1).is_none());
    }
}
