//! Rubric and scoring module: parses reviewer output into peer reviews.
//!
//! Reviewers are asked to end their critique with a fenced JSON block
//! (`{"ranking": [...], "scores": {...}}`). Parsing is forgiving about
//! the envelope but strict about the content:
//!
//! 1. fenced ```json block
//! 2. raw brace-balanced JSON object containing `"ranking"`
//! 3. legacy `FINAL RANKING:` section with numbered labels
//! 4. bare `Response X` mentions in order of appearance
//!
//! A review that fails validation becomes an [`ParsedReview::Abstain`]:
//! the reviewer contributes zero weight for this session and the caller
//! emits a degradation notice. Parse failures are explicit result
//! variants, never panics.

use serde_json::Value;

use conclave_types::review::DISSENT_CAP_CHARS;
use conclave_types::{PeerReview, RankedCandidate, RubricScores};

/// The outcome of parsing one reviewer's output.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedReview {
    /// A validated review that enters aggregation.
    Valid(PeerReview),
    /// The reviewer abstains; the reason feeds a degradation notice.
    Abstain {
        /// Slot index of the abstaining reviewer.
        reviewer: usize,
        /// Why the review was rejected.
        reason: String,
    },
}

impl ParsedReview {
    fn abstain(reviewer: usize, reason: impl Into<String>) -> Self {
        ParsedReview::Abstain {
            reviewer,
            reason: reason.into(),
        }
    }
}

/// Parse one reviewer's raw output.
///
/// * `label_map` -- the `(label, slot)` pairs for this reviewer's
///   shuffled presentation (e.g. `("Response A", 2)`).
/// * `exclude_self` -- strip the reviewer's ranking of its own response
///   before validation (a detected self-vote is recorded on the review).
/// * `expect_verdict` -- binary-verdict sessions require a pass/fail
///   field.
pub fn parse_review(
    reviewer: usize,
    text: &str,
    label_map: &[(String, usize)],
    exclude_self: bool,
    expect_verdict: bool,
) -> ParsedReview {
    let json = extract_json(text);

    let (labels, scores_value, pass_vote, dissent) = match json {
        Some(ref value) => {
            let labels = match value.get("ranking").and_then(Value::as_array) {
                Some(arr) => arr
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect::<Vec<_>>(),
                None => Vec::new(),
            };
            let scores = value.get("scores").cloned();
            let pass_vote = value.get("verdict").and_then(Value::as_str).and_then(|v| {
                match v.to_ascii_lowercase().as_str() {
                    "pass" => Some(true),
                    "fail" => Some(false),
                    _ => None,
                }
            });
            let dissent = value
                .get("dissent")
                .and_then(Value::as_str)
                .filter(|d| !d.trim().is_empty())
                .map(|d| truncate_chars(d, DISSENT_CAP_CHARS));
            (labels, scores, pass_vote, dissent)
        }
        None => (textual_ranking(text), None, None, None),
    };

    if labels.is_empty() {
        return ParsedReview::abstain(reviewer, "no ranking found in reviewer output");
    }

    // Map labels to slots.
    let mut slots = Vec::with_capacity(labels.len());
    for label in &labels {
        match resolve_label(label, label_map) {
            Some(slot) => slots.push(slot),
            None => {
                return ParsedReview::abstain(
                    reviewer,
                    format!("ranking names unknown label '{label}'"),
                );
            }
        }
    }

    // Self-vote exclusion: strip the reviewer's own entry, then compress
    // the remaining ranks back to 1..=n in order.
    let mut self_vote_stripped = false;
    if exclude_self {
        let before = slots.len();
        slots.retain(|s| *s != reviewer);
        self_vote_stripped = slots.len() != before;
    }

    // Permutation check over the expected candidate set.
    let expected: std::collections::BTreeSet<usize> = label_map
        .iter()
        .map(|(_, s)| *s)
        .filter(|s| !exclude_self || *s != reviewer)
        .collect();
    let seen: std::collections::BTreeSet<usize> = slots.iter().copied().collect();
    if slots.len() != seen.len() {
        return ParsedReview::abstain(reviewer, "ranking repeats a candidate");
    }
    if seen != expected {
        return ParsedReview::abstain(
            reviewer,
            format!(
                "ranking covers {} of {} candidates",
                seen.len(),
                expected.len()
            ),
        );
    }

    let ranking: Vec<RankedCandidate> = slots
        .iter()
        .enumerate()
        .map(|(i, slot)| RankedCandidate {
            slot: *slot,
            rank: i + 1,
        })
        .collect();

    // Rubric scores: clamp to [0, 10]; missing dimensions stay None.
    let mut scores: Vec<(usize, RubricScores)> = Vec::new();
    if let Some(Value::Object(map)) = scores_value {
        for (label, raw) in map {
            let slot = match resolve_label(&label, label_map) {
                Some(s) => s,
                None => continue, // scores for unknown labels are ignored
            };
            if exclude_self && slot == reviewer {
                continue;
            }
            let parsed = parse_scores(&raw).clamped();
            if !parsed.is_empty() {
                scores.push((slot, parsed));
            }
        }
        scores.sort_by_key(|(slot, _)| *slot);
    }

    if expect_verdict && pass_vote.is_none() {
        return ParsedReview::abstain(reviewer, "binary session but no pass/fail verdict");
    }

    // Prompt-injection indicators and other disqualifying defects are
    // reported, never auto-fail the session.
    let blocking_issues = match json.as_ref().and_then(|v| v.get("blocking_issues")) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|s| truncate_chars(s, DISSENT_CAP_CHARS))
            .collect(),
        _ => Vec::new(),
    };

    ParsedReview::Valid(PeerReview {
        reviewer,
        ranking,
        scores,
        pass_vote,
        dissent,
        blocking_issues,
        self_vote_stripped,
    })
}

/// Extract the reviewer's JSON payload: fenced block first, then a raw
/// brace-balanced object containing `"ranking"`.
fn extract_json(text: &str) -> Option<Value> {
    if let Some(start) = text.find("```json") {
        let body = &text[start + "```json".len()..];
        if let Some(end) = body.find("```") {
            if let Ok(value) = serde_json::from_str::<Value>(body[..end].trim()) {
                return Some(value);
            }
        }
    }

    // Raw object: locate `"ranking"`, back up to the opening brace, then
    // match braces forward.
    let key_pos = text.find("\"ranking\"")?;
    let open = text[..key_pos].rfind('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text[open..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &text[open..open + i + 1];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}

/// Line-anchored fallback: a `FINAL RANKING:` section, else every
/// `Response X` mention in order of first appearance.
fn textual_ranking(text: &str) -> Vec<String> {
    let section = match text.split("FINAL RANKING:").nth(1) {
        Some(rest) => rest,
        None => text,
    };
    let mut labels = Vec::new();
    let bytes = section.as_bytes();
    let needle = b"Response ";
    let mut i = 0;
    while i + needle.len() < bytes.len() {
        if &bytes[i..i + needle.len()] == needle {
            let c = bytes[i + needle.len()];
            if c.is_ascii_uppercase() {
                let label = format!("Response {}", c as char);
                if !labels.contains(&label) {
                    labels.push(label);
                }
                i += needle.len() + 1;
                continue;
            }
        }
        i += 1;
    }
    labels
}

/// Resolve a label against the presentation map. Accepts both the full
/// "Response A" form and a bare "A".
fn resolve_label(label: &str, label_map: &[(String, usize)]) -> Option<usize> {
    let trimmed = label.trim();
    for (known, slot) in label_map {
        if known == trimmed {
            return Some(*slot);
        }
        if let Some(bare) = known.strip_prefix("Response ") {
            if bare == trimmed {
                return Some(*slot);
            }
        }
    }
    None
}

/// Parse one candidate's score value: either a bare number (recorded as
/// accuracy, the dimension the tie-break uses) or an object with the
/// five rubric dimensions.
fn parse_scores(value: &Value) -> RubricScores {
    match value {
        Value::Number(n) => RubricScores {
            accuracy: n.as_f64(),
            ..Default::default()
        },
        Value::Object(map) => {
            let dim = |name: &str| map.get(name).and_then(Value::as_f64);
            RubricScores {
                accuracy: dim("accuracy"),
                completeness: dim("completeness"),
                clarity: dim("clarity"),
                conciseness: dim("conciseness"),
                relevance: dim("relevance"),
            }
        }
        _ => RubricScores::default(),
    }
}

/// Truncate on a character boundary.
fn truncate_chars(s: &str, cap: usize) -> String {
    s.chars().take(cap).collect()
}
