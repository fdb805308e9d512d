//! Aggregator: turns a matrix of peer rankings into a final ordering.
//!
//! The primary method is normalized Borda count with self-vote
//! exclusion; Schulze (pairwise matrix + Floyd–Warshall strongest
//! paths) is selectable per session and preferred for panels of five or
//! more. Ties break deterministically: higher mean rubric accuracy,
//! then lower generation cost, then lexicographic content hash -- so
//! identical inputs always yield identical orderings, and replaying a
//! transcript through a fresh aggregator reproduces the result.

use std::collections::{BTreeMap, HashMap};

use sha2::{Digest, Sha256};
use tracing::debug;

use conclave_types::{
    AggregateResult, BinaryOutcome, BinaryVerdict, PeerReview, RankingMethod,
};

/// Mean signed deviation (Borda-scaled) beyond which a reviewer is
/// down-weighted.
pub const BIAS_DEVIATION_THRESHOLD: f64 = 0.25;

/// Weight multiplier applied to flagged reviewers.
pub const BIAS_DOWNWEIGHT: f64 = 0.5;

const SCORE_EPSILON: f64 = 1e-9;

/// Per-candidate facts the tie-break needs.
#[derive(Debug, Clone)]
pub struct CandidateMeta {
    /// Candidate slot index.
    pub slot: usize,
    /// What Stage 1 generation cost for this slot, USD.
    pub generation_cost_usd: f64,
    /// SHA-256 hex digest of the candidate's content.
    pub content_hash: String,
}

/// SHA-256 hex digest of candidate content, for the deterministic
/// tie-break.
pub fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    digest.iter().fold(String::new(), |mut acc, b| {
        use std::fmt::Write;
        let _ = write!(acc, "{b:02x}");
        acc
    })
}

/// How far one reviewer's awarded scores sit from the consensus.
///
/// `signed` is the mean signed deviation in Borda units -- for a full
/// ranking over the consensus set it nets out near zero, but over the
/// self-excluded subset it captures directional skew, which is what the
/// cross-session auditor tracks. `magnitude` is the mean absolute
/// deviation and drives the in-session down-weight.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ReviewerDeviation {
    pub signed: f64,
    pub magnitude: f64,
}

/// Converts peer rankings and scores into a final ordering.
#[derive(Debug, Clone)]
pub struct Aggregator {
    method: RankingMethod,
}

impl Aggregator {
    /// Aggregator for the given ranking method.
    pub fn new(method: RankingMethod) -> Self {
        Self { method }
    }

    /// Aggregate valid reviews over `candidates`.
    ///
    /// * `meta` -- per-candidate cost and content hash for tie-breaking.
    /// * `prior_weights` -- cross-session down-weights from the bias
    ///   auditor, keyed by reviewer slot (absent means weight 1.0).
    ///
    /// Schulze is honored only when the panel has at least five
    /// candidates; smaller panels fall back to Borda.
    pub fn aggregate(
        &self,
        candidates: &[usize],
        reviews: &[PeerReview],
        meta: &[CandidateMeta],
        prior_weights: &HashMap<usize, f64>,
    ) -> AggregateResult {
        let mut weights: HashMap<usize, f64> = reviews
            .iter()
            .map(|r| {
                (
                    r.reviewer,
                    prior_weights.get(&r.reviewer).copied().unwrap_or(1.0),
                )
            })
            .collect();
        let mut bias_corrected = weights.values().any(|w| *w < 1.0);

        let mut scores = borda_scores(candidates, reviews, &weights);

        // One-shot in-session bias correction: reviewers whose deviation
        // from the pre-correction consensus exceeds the threshold are
        // down-weighted and the aggregate recomputed once.
        let mut corrected_any = false;
        for review in reviews {
            let deviation = reviewer_deviation(review, &scores);
            if deviation.magnitude > BIAS_DEVIATION_THRESHOLD {
                let w = weights.entry(review.reviewer).or_insert(1.0);
                if *w > BIAS_DOWNWEIGHT {
                    debug!(
                        reviewer = review.reviewer,
                        deviation = deviation.magnitude,
                        "down-weighting biased reviewer"
                    );
                    *w = BIAS_DOWNWEIGHT;
                    corrected_any = true;
                }
            }
        }
        if corrected_any {
            scores = borda_scores(candidates, reviews, &weights);
            bias_corrected = true;
        }

        let effective_method = if self.method == RankingMethod::Schulze && candidates.len() >= 5 {
            RankingMethod::Schulze
        } else {
            RankingMethod::Borda
        };

        let primary: BTreeMap<usize, f64> = match effective_method {
            RankingMethod::Borda => scores.clone(),
            RankingMethod::Schulze => schulze_wins(candidates, reviews, &weights)
                .into_iter()
                .map(|(slot, wins)| (slot, wins as f64))
                .collect(),
        };

        let (ordering, tie_break_applied) = order_with_tie_break(candidates, &primary, reviews, meta);

        let vote_counts: BTreeMap<usize, usize> = candidates
            .iter()
            .map(|c| {
                let n = reviews.iter().filter(|r| r.rank_of(*c).is_some()).count();
                (*c, n)
            })
            .collect();

        let confidence = top_two_confidence(&ordering, reviews);

        AggregateResult {
            ordering,
            scores,
            vote_counts,
            tie_break_applied,
            bias_corrected,
            confidence,
            method: effective_method,
            binary: None,
        }
    }

    /// Per-reviewer deviation from the unweighted Borda consensus,
    /// for the cross-session bias auditor.
    pub fn deviations(
        candidates: &[usize],
        reviews: &[PeerReview],
    ) -> HashMap<usize, ReviewerDeviation> {
        let consensus = borda_scores(candidates, reviews, &HashMap::new());
        reviews
            .iter()
            .map(|r| (r.reviewer, reviewer_deviation(r, &consensus)))
            .collect()
    }

    /// Compute the binary verdict by strict majority over non-abstaining
    /// voters. An even split resolves to `Unclear`, never silently
    /// broken.
    pub fn binary_verdict(reviews: &[PeerReview]) -> BinaryOutcome {
        let votes: Vec<bool> = reviews.iter().filter_map(|r| r.pass_vote).collect();
        let n = votes.len();
        if n == 0 {
            return BinaryOutcome {
                verdict: BinaryVerdict::Unclear,
                confidence: 0.0,
            };
        }
        let pass = votes.iter().filter(|v| **v).count();
        let fail = n - pass;
        let verdict = if pass * 2 > n {
            BinaryVerdict::Pass
        } else if fail * 2 > n {
            BinaryVerdict::Fail
        } else {
            BinaryVerdict::Unclear
        };
        let confidence = (pass as f64 - fail as f64).abs() / n as f64;
        BinaryOutcome {
            verdict,
            confidence,
        }
    }
}

/// Normalized Borda score a reviewer's ranking awards: first place is
/// 1.0, last is 0.0; a single-entry ranking awards 1.0.
fn borda_unit(rank: usize, list_len: usize) -> f64 {
    if list_len <= 1 {
        1.0
    } else {
        (list_len - rank) as f64 / (list_len - 1) as f64
    }
}

/// Weighted mean Borda score per candidate. Diagonal entries never
/// appear: the parser strips self-votes before reviews reach this
/// point, and `rank_of` simply finds nothing for absent candidates --
/// missing entries are abstentions, not zero-scores.
fn borda_scores(
    candidates: &[usize],
    reviews: &[PeerReview],
    weights: &HashMap<usize, f64>,
) -> BTreeMap<usize, f64> {
    let mut scores = BTreeMap::new();
    for candidate in candidates {
        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;
        for review in reviews {
            if review.reviewer == *candidate {
                continue;
            }
            if let Some(rank) = review.rank_of(*candidate) {
                let w = weights.get(&review.reviewer).copied().unwrap_or(1.0);
                weighted_sum += w * borda_unit(rank, review.ranking.len());
                weight_total += w;
            }
        }
        let score = if weight_total > 0.0 {
            weighted_sum / weight_total
        } else {
            0.0
        };
        scores.insert(*candidate, score);
    }
    scores
}

/// Deviation of one reviewer's awarded Borda units from the consensus
/// scores, over the candidates the reviewer ranked.
fn reviewer_deviation(review: &PeerReview, consensus: &BTreeMap<usize, f64>) -> ReviewerDeviation {
    let mut signed = 0.0;
    let mut magnitude = 0.0;
    let mut n = 0usize;
    for rc in &review.ranking {
        if let Some(consensus_score) = consensus.get(&rc.slot) {
            let delta = borda_unit(rc.rank, review.ranking.len()) - consensus_score;
            signed += delta;
            magnitude += delta.abs();
            n += 1;
        }
    }
    if n == 0 {
        ReviewerDeviation::default()
    } else {
        ReviewerDeviation {
            signed: signed / n as f64,
            magnitude: magnitude / n as f64,
        }
    }
}

/// Schulze: pairwise preference matrix, strongest paths via
/// Floyd–Warshall, candidates ranked by pairwise-strength wins.
fn schulze_wins(
    candidates: &[usize],
    reviews: &[PeerReview],
    weights: &HashMap<usize, f64>,
) -> Vec<(usize, usize)> {
    let n = candidates.len();
    let index: HashMap<usize, usize> = candidates
        .iter()
        .enumerate()
        .map(|(i, c)| (*c, i))
        .collect();

    // P[i][j]: weighted count of reviewers preferring i over j.
    let mut pref = vec![vec![0.0_f64; n]; n];
    for review in reviews {
        let w = weights.get(&review.reviewer).copied().unwrap_or(1.0);
        for a in &review.ranking {
            for b in &review.ranking {
                if a.slot != b.slot && a.rank < b.rank {
                    if let (Some(&i), Some(&j)) = (index.get(&a.slot), index.get(&b.slot)) {
                        pref[i][j] += w;
                    }
                }
            }
        }
    }

    // Strongest paths (O(N³)).
    let mut strength = vec![vec![0.0_f64; n]; n];
    for i in 0..n {
        for j in 0..n {
            if i != j && pref[i][j] > pref[j][i] {
                strength[i][j] = pref[i][j];
            }
        }
    }
    for k in 0..n {
        for i in 0..n {
            if i == k {
                continue;
            }
            for j in 0..n {
                if j == i || j == k {
                    continue;
                }
                let via = strength[i][k].min(strength[k][j]);
                if via > strength[i][j] {
                    strength[i][j] = via;
                }
            }
        }
    }

    candidates
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let wins = (0..n)
                .filter(|&j| j != i && strength[i][j] > strength[j][i])
                .count();
            (*c, wins)
        })
        .collect()
}

/// Sort candidates by primary score, applying the deterministic
/// tie-break chain to equal scores. Returns the ordering and whether a
/// tie-break decided any adjacent pair.
fn order_with_tie_break(
    candidates: &[usize],
    primary: &BTreeMap<usize, f64>,
    reviews: &[PeerReview],
    meta: &[CandidateMeta],
) -> (Vec<usize>, bool) {
    let accuracy: HashMap<usize, Option<f64>> = candidates
        .iter()
        .map(|c| (*c, mean_accuracy(*c, reviews)))
        .collect();
    let meta_map: HashMap<usize, &CandidateMeta> = meta.iter().map(|m| (m.slot, m)).collect();

    let mut ordering: Vec<usize> = candidates.to_vec();
    let mut tie_break_applied = false;

    ordering.sort_by(|a, b| {
        let (sa, sb) = (
            primary.get(a).copied().unwrap_or(0.0),
            primary.get(b).copied().unwrap_or(0.0),
        );
        if (sa - sb).abs() > SCORE_EPSILON {
            return sb.partial_cmp(&sa).expect("scores are finite");
        }

        // (1) higher mean rubric accuracy
        let (aa, ab) = (
            accuracy.get(a).copied().flatten(),
            accuracy.get(b).copied().flatten(),
        );
        match (aa, ab) {
            (Some(x), Some(y)) if (x - y).abs() > SCORE_EPSILON => {
                tie_break_applied = true;
                return y.partial_cmp(&x).expect("accuracy is finite");
            }
            (Some(_), None) => {
                tie_break_applied = true;
                return std::cmp::Ordering::Less;
            }
            (None, Some(_)) => {
                tie_break_applied = true;
                return std::cmp::Ordering::Greater;
            }
            _ => {}
        }

        // (2) lower total generation cost
        if let (Some(ma), Some(mb)) = (meta_map.get(a), meta_map.get(b)) {
            if (ma.generation_cost_usd - mb.generation_cost_usd).abs() > SCORE_EPSILON {
                tie_break_applied = true;
                return ma
                    .generation_cost_usd
                    .partial_cmp(&mb.generation_cost_usd)
                    .expect("costs are finite");
            }
            // (3) lexicographic content hash
            if ma.content_hash != mb.content_hash {
                tie_break_applied = true;
                return ma.content_hash.cmp(&mb.content_hash);
            }
        }

        // Fully identical: keep slot order for stability.
        a.cmp(b)
    });

    (ordering, tie_break_applied)
}

/// Mean rubric accuracy a candidate received across reviews.
fn mean_accuracy(candidate: usize, reviews: &[PeerReview]) -> Option<f64> {
    let values: Vec<f64> = reviews
        .iter()
        .filter(|r| r.reviewer != candidate)
        .filter_map(|r| r.scores_for(candidate).and_then(|s| s.accuracy))
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Confidence: `1 − normalized variance of the top two candidates'
/// per-reviewer Borda scores`, clamped to [0, 1]. High reviewer
/// agreement on the leaders means high confidence. Scores live in
/// [0, 1], so the maximum possible variance is 0.25.
fn top_two_confidence(ordering: &[usize], reviews: &[PeerReview]) -> f64 {
    let top_two: Vec<usize> = ordering.iter().copied().take(2).collect();
    if top_two.len() < 2 {
        return 1.0;
    }
    let mut total = 0.0;
    for candidate in &top_two {
        let samples: Vec<f64> = reviews
            .iter()
            .filter(|r| r.reviewer != *candidate)
            .filter_map(|r| {
                r.rank_of(*candidate)
                    .map(|rank| borda_unit(rank, r.ranking.len()))
            })
            .collect();
        total += variance(&samples);
    }
    let normalized = (total / top_two.len() as f64) / 0.25;
    (1.0 - normalized).clamp(0.0, 1.0)
}

fn variance(samples: &[f64]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / samples.len() as f64
}
