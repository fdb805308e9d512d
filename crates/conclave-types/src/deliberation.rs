//! The final result returned to the caller.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::aggregate::{AggregateResult, BinaryVerdict};
use crate::panel::{DegradationNotice, PanelSlot, StageOneResponse};
use crate::review::PeerReview;

/// Wall-clock boundaries of each stage, keyed by stage wire name.
pub type StageTimestamps = BTreeMap<String, DateTime<Utc>>;

/// Everything a deliberation session produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliberationResult {
    /// Query this result answers.
    pub query_id: String,
    /// Final synthesis text (or the rationale behind a structured
    /// verdict).
    pub synthesis: String,
    /// The slot whose response won the aggregate ordering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winning_slot: Option<usize>,
    /// Aggregated peer-review outcome.
    pub aggregate: AggregateResult,
    /// The panel that served this query.
    pub panel: Vec<PanelSlot>,
    /// Stage 1 transcripts, one per slot that was launched.
    pub stage1: Vec<StageOneResponse>,
    /// Valid peer reviews that entered aggregation.
    pub reviews: Vec<PeerReview>,
    /// Every degradation notice accumulated across stages, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notices: Vec<DegradationNotice>,
    /// Where the session transcript was written, if persistence is on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript_dir: Option<PathBuf>,
    /// Stage boundary timestamps.
    pub timestamps: StageTimestamps,
}

impl DeliberationResult {
    /// The binary verdict, if this was a binary-verdict session.
    pub fn verdict(&self) -> Option<BinaryVerdict> {
        self.aggregate.binary.map(|b| b.verdict)
    }

    /// Process exit code per the external contract:
    /// 0 pass / synthesis produced, 1 fail, 2 unclear or low confidence.
    pub fn exit_code(&self) -> i32 {
        match self.verdict() {
            Some(v) => v.exit_code(),
            None if self.aggregate.is_low_confidence() => 2,
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{BinaryOutcome, RankingMethod};

    fn result(binary: Option<BinaryOutcome>, confidence: f64) -> DeliberationResult {
        DeliberationResult {
            query_id: "q".into(),
            synthesis: "final".into(),
            winning_slot: Some(0),
            aggregate: AggregateResult {
                ordering: vec![0],
                scores: BTreeMap::from([(0, 1.0)]),
                vote_counts: BTreeMap::from([(0, 1)]),
                tie_break_applied: false,
                bias_corrected: false,
                confidence,
                method: RankingMethod::Borda,
                binary,
            },
            panel: vec![],
            stage1: vec![],
            reviews: vec![],
            notices: vec![],
            transcript_dir: None,
            timestamps: BTreeMap::new(),
        }
    }

    #[test]
    fn exit_code_synthesis() {
        assert_eq!(result(None, 0.9).exit_code(), 0);
    }

    #[test]
    fn exit_code_low_confidence_synthesis() {
        assert_eq!(result(None, 0.3).exit_code(), 2);
    }

    #[test]
    fn exit_code_binary() {
        let pass = result(
            Some(BinaryOutcome {
                verdict: BinaryVerdict::Pass,
                confidence: 0.8,
            }),
            0.8,
        );
        assert_eq!(pass.exit_code(), 0);
        let fail = result(
            Some(BinaryOutcome {
                verdict: BinaryVerdict::Fail,
                confidence: 0.8,
            }),
            0.8,
        );
        assert_eq!(fail.exit_code(), 1);
        let unclear = result(
            Some(BinaryOutcome {
                verdict: BinaryVerdict::Unclear,
                confidence: 0.0,
            }),
            0.9,
        );
        assert_eq!(unclear.exit_code(), 2);
    }
}
