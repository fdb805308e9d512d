//! Bias auditor: per-session and cross-session reviewer skew detection.
//!
//! Tracks, per reviewer model: self-preference attempts (detected and
//! excluded before scoring), an exponentially weighted mean of signed
//! deviation from consensus, positional statistics (how often the
//! reviewer's top pick was the first-presented candidate), and pairwise
//! Spearman correlation with other reviewers. Flagged reviewers receive
//! the aggregator's 0.5 down-weight in later sessions.
//!
//! The store is read-mostly: sessions append updates in memory and the
//! file is rewritten (with retention compaction) on save.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use conclave_types::Result;

/// Smoothing factor for the deviation EWMA.
const EWMA_ALPHA: f64 = 0.3;

/// |EWMA| beyond which a reviewer is flagged.
const FLAG_THRESHOLD: f64 = 0.25;

/// Sessions a reviewer must appear in before flagging applies.
const MIN_SESSIONS: u64 = 5;

/// Spearman correlation above which two reviewers count as co-biased
/// for a session.
const CO_BIAS_CORRELATION: f64 = 0.9;

/// Co-biased sessions required before a pair is flagged.
const CO_BIAS_MIN_SESSIONS: u64 = 5;

/// Records older than this are dropped during compaction.
const RETENTION_DAYS: i64 = 30;

/// One reviewer's observable behavior in one session.
#[derive(Debug, Clone)]
pub struct ReviewerSessionStats {
    /// The reviewer's model id (cross-session identity).
    pub model_id: String,
    /// Mean signed deviation from consensus, Borda-scaled.
    pub signed_deviation: f64,
    /// Whether the reviewer tried to rank its own response.
    pub self_vote_attempted: bool,
    /// Awarded ranks, keyed by candidate model id.
    pub ranks: BTreeMap<String, usize>,
    /// Whether the reviewer's top choice was the candidate presented
    /// first in its shuffled prompt.
    pub top_choice_presented_first: bool,
}

/// Everything the auditor learns from one session.
#[derive(Debug, Clone)]
pub struct SessionAudit {
    pub query_id: String,
    pub reviewers: Vec<ReviewerSessionStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReviewerRecord {
    sessions: u64,
    ewma_signed: f64,
    self_vote_attempts: u64,
    first_position_tops: u64,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PairRecord {
    sessions: u64,
    high_correlation_sessions: u64,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AuditStore {
    #[serde(default)]
    reviewers: BTreeMap<String, ReviewerRecord>,
    #[serde(default)]
    pairs: BTreeMap<String, PairRecord>,
}

/// Spearman rank correlation of two reviewers' rankings over their
/// common candidates. Returns `None` below three common candidates.
pub fn spearman(a: &BTreeMap<String, usize>, b: &BTreeMap<String, usize>) -> Option<f64> {
    let common: Vec<&String> = a.keys().filter(|k| b.contains_key(*k)).collect();
    let n = common.len();
    if n < 3 {
        return None;
    }
    // Re-rank each reviewer's awarded ranks within the common subset so
    // both vectors are permutations of 1..=n.
    let rerank = |m: &BTreeMap<String, usize>| -> BTreeMap<String, usize> {
        let mut ordered: Vec<&String> = common.clone();
        ordered.sort_by_key(|k| m[*k]);
        ordered
            .into_iter()
            .enumerate()
            .map(|(i, k)| (k.clone(), i + 1))
            .collect()
    };
    let ra = rerank(a);
    let rb = rerank(b);
    let d2: f64 = common
        .iter()
        .map(|k| {
            let d = ra[*k] as f64 - rb[*k] as f64;
            d * d
        })
        .sum();
    let n = n as f64;
    Some(1.0 - (6.0 * d2) / (n * (n * n - 1.0)))
}

/// Cross-session bias auditor.
#[derive(Debug)]
pub struct BiasAuditor {
    store: AuditStore,
    path: Option<PathBuf>,
}

impl BiasAuditor {
    /// An auditor with no persistence (tests, ephemeral sessions).
    pub fn in_memory() -> Self {
        Self {
            store: AuditStore::default(),
            path: None,
        }
    }

    /// Load the store from `path`, starting empty if the file does not
    /// exist or cannot be parsed (a corrupt store is not fatal).
    pub fn load(path: &Path) -> Self {
        let store = match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(store) => store,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "audit store unreadable, starting fresh");
                    AuditStore::default()
                }
            },
            Err(_) => AuditStore::default(),
        };
        Self {
            store,
            path: Some(path.to_path_buf()),
        }
    }

    /// Fold one session into the running statistics.
    pub fn record_session(&mut self, session: &SessionAudit) {
        let now = Utc::now();
        for stats in &session.reviewers {
            let record = self
                .store
                .reviewers
                .entry(stats.model_id.clone())
                .or_insert(ReviewerRecord {
                    sessions: 0,
                    ewma_signed: 0.0,
                    self_vote_attempts: 0,
                    first_position_tops: 0,
                    updated_at: now,
                });
            record.ewma_signed = if record.sessions == 0 {
                stats.signed_deviation
            } else {
                EWMA_ALPHA * stats.signed_deviation + (1.0 - EWMA_ALPHA) * record.ewma_signed
            };
            record.sessions += 1;
            if stats.self_vote_attempted {
                record.self_vote_attempts += 1;
            }
            if stats.top_choice_presented_first {
                record.first_position_tops += 1;
            }
            record.updated_at = now;
        }

        // Pairwise co-bias.
        for (i, a) in session.reviewers.iter().enumerate() {
            for b in session.reviewers.iter().skip(i + 1) {
                let Some(rho) = spearman(&a.ranks, &b.ranks) else {
                    continue;
                };
                let key = pair_key(&a.model_id, &b.model_id);
                let record = self.store.pairs.entry(key).or_insert(PairRecord {
                    sessions: 0,
                    high_correlation_sessions: 0,
                    updated_at: now,
                });
                record.sessions += 1;
                if rho > CO_BIAS_CORRELATION {
                    record.high_correlation_sessions += 1;
                }
                record.updated_at = now;
            }
        }

        debug!(
            query_id = %session.query_id,
            reviewers = session.reviewers.len(),
            "session folded into bias audit"
        );
    }

    /// Reviewers that receive the aggregator's down-weight: sustained
    /// deviation past the threshold, or membership in a co-biased pair.
    pub fn flagged_model_ids(&self) -> BTreeSet<String> {
        let mut flagged = BTreeSet::new();
        for (model_id, record) in &self.store.reviewers {
            if record.sessions >= MIN_SESSIONS && record.ewma_signed.abs() > FLAG_THRESHOLD {
                flagged.insert(model_id.clone());
            }
        }
        for (key, record) in &self.store.pairs {
            if record.high_correlation_sessions >= CO_BIAS_MIN_SESSIONS {
                if let Some((a, b)) = key.split_once('|') {
                    flagged.insert(a.to_string());
                    flagged.insert(b.to_string());
                }
            }
        }
        flagged
    }

    /// Fraction of sessions in which the reviewer's top pick was the
    /// first-presented candidate; `None` before any sessions.
    pub fn positional_bias_rate(&self, model_id: &str) -> Option<f64> {
        self.store.reviewers.get(model_id).and_then(|r| {
            if r.sessions == 0 {
                None
            } else {
                Some(r.first_position_tops as f64 / r.sessions as f64)
            }
        })
    }

    /// Recorded self-preference attempts for a reviewer.
    pub fn self_vote_attempts(&self, model_id: &str) -> u64 {
        self.store
            .reviewers
            .get(model_id)
            .map(|r| r.self_vote_attempts)
            .unwrap_or(0)
    }

    /// Persist the store, compacting entries past retention.
    pub fn save(&mut self) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        let cutoff = Utc::now() - Duration::days(RETENTION_DAYS);
        self.store.reviewers.retain(|_, r| r.updated_at >= cutoff);
        self.store.pairs.retain(|_, r| r.updated_at >= cutoff);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.store)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

fn pair_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}|{b}")
    } else {
        format!("{b}|{a}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranks(pairs: &[(&str, usize)]) -> BTreeMap<String, usize> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn stats(model: &str, deviation: f64) -> ReviewerSessionStats {
        ReviewerSessionStats {
            model_id: model.into(),
            signed_deviation: deviation,
            self_vote_attempted: false,
            ranks: ranks(&[("m1", 1), ("m2", 2), ("m3", 3)]),
            top_choice_presented_first: false,
        }
    }

    fn session(reviewers: Vec<ReviewerSessionStats>) -> SessionAudit {
        SessionAudit {
            query_id: "q".into(),
            reviewers,
        }
    }

    #[test]
    fn spearman_identical_rankings() {
        let a = ranks(&[("m1", 1), ("m2", 2), ("m3", 3), ("m4", 4)]);
        assert!((spearman(&a, &a).unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn spearman_inverted_rankings() {
        let a = ranks(&[("m1", 1), ("m2", 2), ("m3", 3), ("m4", 4)]);
        let b = ranks(&[("m1", 4), ("m2", 3), ("m3", 2), ("m4", 1)]);
        assert!((spearman(&a, &b).unwrap() + 1.0).abs() < 1e-9);
    }

    #[test]
    fn spearman_needs_three_common() {
        let a = ranks(&[("m1", 1), ("m2", 2)]);
        let b = ranks(&[("m1", 2), ("m2", 1)]);
        assert!(spearman(&a, &b).is_none());
    }

    #[test]
    fn spearman_reranks_common_subset() {
        // Disjoint extras must not distort the correlation.
        let a = ranks(&[("m1", 1), ("m2", 3), ("m3", 4), ("x", 2)]);
        let b = ranks(&[("m1", 1), ("m2", 2), ("m3", 3), ("y", 4)]);
        assert!((spearman(&a, &b).unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn ewma_flags_sustained_deviation() {
        let mut auditor = BiasAuditor::in_memory();
        for _ in 0..6 {
            auditor.record_session(&session(vec![
                stats("biased/model", 0.4),
                stats("fair/model", 0.02),
            ]));
        }
        let flagged = auditor.flagged_model_ids();
        assert!(flagged.contains("biased/model"));
        assert!(!flagged.contains("fair/model"));
    }

    #[test]
    fn no_flag_below_min_sessions() {
        let mut auditor = BiasAuditor::in_memory();
        for _ in 0..4 {
            auditor.record_session(&session(vec![stats("new/model", 0.9)]));
        }
        assert!(auditor.flagged_model_ids().is_empty());
    }

    #[test]
    fn ewma_decays_old_behavior() {
        let mut auditor = BiasAuditor::in_memory();
        // Early deviation, then a long run of fair behavior.
        auditor.record_session(&session(vec![stats("m", 0.9)]));
        for _ in 0..10 {
            auditor.record_session(&session(vec![stats("m", 0.0)]));
        }
        assert!(auditor.flagged_model_ids().is_empty());
    }

    #[test]
    fn co_bias_pair_flagged_after_five_sessions() {
        let mut auditor = BiasAuditor::in_memory();
        let identical = ranks(&[("m1", 1), ("m2", 2), ("m3", 3), ("m4", 4)]);
        for _ in 0..5 {
            let mut a = stats("echo/one", 0.0);
            let mut b = stats("echo/two", 0.0);
            a.ranks = identical.clone();
            b.ranks = identical.clone();
            auditor.record_session(&session(vec![a, b]));
        }
        let flagged = auditor.flagged_model_ids();
        assert!(flagged.contains("echo/one"));
        assert!(flagged.contains("echo/two"));
    }

    #[test]
    fn uncorrelated_pair_not_flagged() {
        let mut auditor = BiasAuditor::in_memory();
        for _ in 0..10 {
            let mut a = stats("a/model", 0.0);
            let mut b = stats("b/model", 0.0);
            a.ranks = ranks(&[("m1", 1), ("m2", 2), ("m3", 3), ("m4", 4)]);
            b.ranks = ranks(&[("m1", 4), ("m2", 1), ("m3", 3), ("m4", 2)]);
            auditor.record_session(&session(vec![a, b]));
        }
        assert!(auditor.flagged_model_ids().is_empty());
    }

    #[test]
    fn positional_and_self_vote_stats() {
        let mut auditor = BiasAuditor::in_memory();
        let mut first = stats("m", 0.0);
        first.top_choice_presented_first = true;
        first.self_vote_attempted = true;
        auditor.record_session(&session(vec![first]));
        auditor.record_session(&session(vec![stats("m", 0.0)]));

        assert_eq!(auditor.positional_bias_rate("m"), Some(0.5));
        assert_eq!(auditor.self_vote_attempts("m"), 1);
        assert_eq!(auditor.positional_bias_rate("unknown"), None);
    }

    #[test]
    fn store_roundtrips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.json");

        let mut auditor = BiasAuditor::load(&path);
        for _ in 0..6 {
            auditor.record_session(&session(vec![stats("biased/model", 0.5)]));
        }
        auditor.save().unwrap();

        let reloaded = BiasAuditor::load(&path);
        assert!(reloaded.flagged_model_ids().contains("biased/model"));
    }

    #[test]
    fn corrupt_store_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.json");
        std::fs::write(&path, "{garbage").unwrap();
        let auditor = BiasAuditor::load(&path);
        assert!(auditor.flagged_model_ids().is_empty());
    }
}
