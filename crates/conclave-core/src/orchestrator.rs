//! The deliberation orchestrator: a three-stage state machine.
//!
//! Drives Stage 1 (parallel generation), optional Stage 1.5 (style
//! normalization), Stage 2 (anonymized peer review), aggregation, and
//! Stage 3 (chairman synthesis). Every transition is published through
//! the event fabric; the transcript is sealed when the session reaches
//! `council.completed` or `council.failed`.
//!
//! Stage fan-outs are structured barriers: all tasks launch, the
//! orchestrator waits for completion or deadline, then proceeds. A
//! slot's failure never cancels its peers; a per-query cancellation
//! token propagates to all in-flight tasks cooperatively.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use rand::seq::SliceRandom;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use conclave_llm::{ChatMessage, CompletionRequest, Gateway, StreamChunk};
use conclave_types::{
    AggregateResult, CouncilConfig, CouncilError, DegradationNotice, DeliberationResult, EventKind,
    FailureReason, Mode, PanelSlot, PeerReview, Query, Result, SlotRole, SlotStatus, Stage,
    StageOneResponse, TokenUsage, VerdictType,
};

use crate::aggregate::{content_hash, Aggregator, CandidateMeta};
use crate::audit::{BiasAuditor, ReviewerSessionStats, SessionAudit};
use crate::bus::{EventBus, EventEmitter, EventSink};
use crate::prompts;
use crate::registry::MetadataProvider;
use crate::rubric::{parse_review, ParsedReview};
use crate::selector::{PanelRequest, TierSelector};
use crate::transcript::{SessionTranscript, TranscriptStore};
use crate::webhook::WebhookDispatcher;

/// Panel size when the configuration does not pin council members.
const DEFAULT_PANEL_SIZE: usize = 4;

/// Stage budget split of the session deadline: 60% / 25% / 15%. Each
/// stage's deadline is its share of the time remaining when the stage
/// starts, so an early finish rolls slack forward.
const STAGE1_SHARE: f64 = 0.60;
const STAGE2_SHARE: f64 = 0.25 / (0.25 + 0.15);
const STAGE3_SHARE: f64 = 1.0;

/// The orchestrator's observable state.
///
/// Transitions are linear (`Idle → SelectingPanel → Stage1Running →
/// [Normalizing?] → Stage2Running → Aggregating → Stage3Running →
/// Sealed`) with `Failed` reachable from anywhere on unrecoverable
/// error; stage barriers enforce the total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    SelectingPanel,
    Stage1Running,
    Normalizing,
    Stage2Running,
    Aggregating,
    Stage3Running,
    Sealed,
    Failed,
}

impl SessionState {
    fn enter(&mut self, next: SessionState, query_id: &str) {
        debug!(query_id, from = ?*self, to = ?next, "state transition");
        *self = next;
    }
}

/// Drives deliberation sessions end to end.
pub struct Orchestrator {
    config: CouncilConfig,
    registry: MetadataProvider,
    selector: TierSelector,
    gateway: Arc<dyn Gateway>,
    bus: Arc<EventBus>,
    transcripts: Option<TranscriptStore>,
    auditor: Option<Arc<StdMutex<BiasAuditor>>>,
}

impl Orchestrator {
    /// Orchestrator over the given collaborators.
    pub fn new(
        config: CouncilConfig,
        registry: MetadataProvider,
        gateway: Arc<dyn Gateway>,
    ) -> Self {
        Self {
            config,
            registry,
            selector: TierSelector::new(),
            gateway,
            bus: Arc::new(EventBus::new()),
            transcripts: None,
            auditor: None,
        }
    }

    /// Enable transcript persistence.
    pub fn with_transcripts(mut self, store: TranscriptStore) -> Self {
        self.transcripts = Some(store);
        self
    }

    /// Attach a cross-session bias auditor.
    pub fn with_auditor(mut self, auditor: Arc<StdMutex<BiasAuditor>>) -> Self {
        self.auditor = Some(auditor);
        self
    }

    /// The event bus; subscribe before calling
    /// [`deliberate`](Orchestrator::deliberate) to observe the session.
    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    /// Run one deliberation to completion.
    pub async fn deliberate(&self, query: Query) -> Result<DeliberationResult> {
        self.deliberate_with_cancel(query, CancellationToken::new())
            .await
    }

    /// Run one deliberation under an external cancellation token.
    pub async fn deliberate_with_cancel(
        &self,
        query: Query,
        cancel: CancellationToken,
    ) -> Result<DeliberationResult> {
        self.validate_query(&query)?;

        let transcript: Option<Arc<SessionTranscript>> = match self.transcripts {
            Some(ref store) => Some(Arc::new(store.open_session(&query.id)?)),
            None => None,
        };

        let mut emitter = EventEmitter::new(&query.id, self.bus.clone());
        if let Some(ref t) = transcript {
            emitter = emitter.with_sink(t.clone() as Arc<dyn EventSink>);
        }
        let emitter = Arc::new(emitter);

        if let Some(ref t) = transcript {
            t.write_stage("request", &query)?;
        }

        // The webhook dispatcher subscribes before the first event so it
        // observes the full stream.
        if let Some(ref webhook) = self.config.webhook {
            let dispatcher = WebhookDispatcher::new(webhook.clone()).scoped_to(&query.id);
            let subscription = self.bus.subscribe();
            let dispatcher_emitter = emitter.clone();
            tokio::spawn(async move {
                dispatcher.run(subscription, Some(dispatcher_emitter)).await;
            });
        }

        let outcome = self
            .run_session(&query, &emitter, transcript.as_deref(), &cancel)
            .await;

        match outcome {
            Ok(mut result) => {
                result.transcript_dir = transcript.as_ref().map(|t| t.dir().to_path_buf());
                if let Some(ref t) = transcript {
                    t.write_stage("result", &result)?;
                }
                let mut payload = serde_json::json!({
                    "confidence": result.aggregate.confidence,
                    "winning_slot": result.winning_slot,
                });
                if result.aggregate.is_low_confidence() {
                    payload["council.low_confidence"] = serde_json::Value::Bool(true);
                }
                if let Some(verdict) = result.verdict() {
                    payload["verdict"] = serde_json::to_value(verdict)?;
                }
                emitter.emit(EventKind::CouncilCompleted, None, None, payload);
                if let Some(ref t) = transcript {
                    t.seal();
                }
                info!(query_id = %query.id, "deliberation completed");
                Ok(result)
            }
            Err(err) => {
                let reason = match &err {
                    CouncilError::SessionFailed { reason } => reason.to_string(),
                    other => other.to_string(),
                };
                emitter.emit(
                    EventKind::CouncilFailed,
                    None,
                    None,
                    serde_json::json!({ "reason": reason }),
                );
                if let Some(ref t) = transcript {
                    t.seal();
                }
                debug!(query_id = %query.id, to = ?SessionState::Failed, "state transition");
                warn!(query_id = %query.id, reason = %reason, "deliberation failed");
                Err(err)
            }
        }
    }

    /// Startup validation; configuration errors are fatal.
    fn validate_query(&self, query: &Query) -> Result<()> {
        if query.prompt.trim().is_empty() {
            return Err(CouncilError::ConfigInvalid {
                reason: "query prompt is empty".into(),
            });
        }
        if query.context_isolation && !query.history.is_empty() {
            return Err(CouncilError::ConfigInvalid {
                reason: "context isolation rejects undeclared prior conversation turns".into(),
            });
        }
        if let Some(ref snapshot) = query.snapshot_id {
            if !conclave_types::query::snapshot_id_is_valid(snapshot) {
                return Err(CouncilError::ConfigInvalid {
                    reason: format!("invalid snapshot id '{snapshot}'"),
                });
            }
        }
        Ok(())
    }

    async fn run_session(
        &self,
        query: &Query,
        emitter: &Arc<EventEmitter>,
        transcript: Option<&SessionTranscript>,
        cancel: &CancellationToken,
    ) -> Result<DeliberationResult> {
        let started = Instant::now();
        let total_budget =
            Duration::from_millis(query.deadline_ms.unwrap_or(self.config.deadline_ms));
        let session_deadline = started + total_budget;
        let per_call_ceiling = Duration::from_millis(self.config.per_call_ceiling_ms);

        let mut timestamps = BTreeMap::new();
        let mut notices: Vec<DegradationNotice> = Vec::new();
        let mut state = SessionState::Idle;
        timestamps.insert("started".to_string(), Utc::now());

        emitter.emit(
            EventKind::CouncilStarted,
            None,
            None,
            serde_json::json!({
                "tier": query.tier,
                "mode": query.mode,
                "verdict_type": query.verdict_type,
            }),
        );

        // ── SELECTING_PANEL ─────────────────────────────────────────
        state.enter(SessionState::SelectingPanel, &query.id);
        let panel = self.select_panel(query, &mut notices).await?;
        let participants: Vec<&PanelSlot> = panel
            .iter()
            .filter(|s| s.role == SlotRole::Participant)
            .collect();
        debug!(
            query_id = %query.id,
            participants = participants.len(),
            "panel selected"
        );

        self.check_liveness(cancel, session_deadline)?;

        // ── STAGE1_RUNNING ──────────────────────────────────────────
        state.enter(SessionState::Stage1Running, &query.id);
        let stage1_deadline = stage_deadline(session_deadline, STAGE1_SHARE);
        let stage1 = self
            .run_stage1(
                query,
                &panel,
                emitter,
                cancel,
                per_call_deadline(stage1_deadline, per_call_ceiling),
            )
            .await;
        timestamps.insert("stage1".to_string(), Utc::now());

        for response in &stage1 {
            notices.extend(response.notices.iter().cloned());
        }
        if let Some(t) = transcript {
            t.write_stage("stage1", &stage1)?;
        }

        let survivors: Vec<&StageOneResponse> = stage1.iter().filter(|r| r.is_ok()).collect();
        emitter.emit(
            EventKind::Stage1Complete,
            Some(Stage::Stage1),
            None,
            serde_json::json!({ "survivors": survivors.len() }),
        );

        self.check_liveness(cancel, session_deadline)?;
        if survivors.len() < 2 {
            return Err(CouncilError::session(
                FailureReason::InsufficientStage1Survivors,
            ));
        }

        // The surviving responses are pinned as the panel for Stage 2.
        let mut candidates: Vec<(usize, String)> = survivors
            .iter()
            .map(|r| (r.slot, r.content.clone()))
            .collect();

        // ── STAGE1_5 (optional) ─────────────────────────────────────
        if self.config.style_normalization {
            state.enter(SessionState::Normalizing, &query.id);
            self.normalize_styles(&mut candidates, &mut notices, per_call_ceiling)
                .await;
            timestamps.insert("normalization".to_string(), Utc::now());
        }

        self.check_liveness(cancel, session_deadline)?;

        // ── STAGE2_RUNNING ──────────────────────────────────────────
        state.enter(SessionState::Stage2Running, &query.id);
        let stage2_deadline = stage_deadline(session_deadline, STAGE2_SHARE);
        let stage2 = self
            .run_stage2(
                query,
                &panel,
                &candidates,
                emitter,
                cancel,
                per_call_deadline(stage2_deadline, per_call_ceiling),
            )
            .await;
        timestamps.insert("stage2".to_string(), Utc::now());

        for abstention in &stage2.abstentions {
            notices.push(abstention.clone());
        }
        if let Some(t) = transcript {
            t.write_stage(
                "stage2",
                &serde_json::json!({
                    "reviews": &stage2.reviews,
                    "abstentions": &stage2.abstentions,
                    "presentations": &stage2.label_maps,
                }),
            )?;
        }
        emitter.emit(
            EventKind::Stage2Complete,
            Some(Stage::Stage2),
            None,
            serde_json::json!({ "valid_reviews": stage2.reviews.len() }),
        );

        self.check_liveness(cancel, session_deadline)?;
        if stage2.reviews.len() < 2 {
            return Err(CouncilError::session(
                FailureReason::InsufficientStage2Reviewers,
            ));
        }

        // ── AGGREGATING ─────────────────────────────────────────────
        state.enter(SessionState::Aggregating, &query.id);
        let candidate_slots: Vec<usize> = candidates.iter().map(|(slot, _)| *slot).collect();
        let aggregate = self
            .aggregate(query, &panel, &candidate_slots, &candidates, &stage1, &stage2)
            .await;
        timestamps.insert("aggregation".to_string(), Utc::now());

        self.record_audit(query, &panel, &candidate_slots, &stage2);

        self.check_liveness(cancel, session_deadline)?;

        // ── STAGE3_RUNNING ──────────────────────────────────────────
        state.enter(SessionState::Stage3Running, &query.id);
        let stage3_deadline = stage_deadline(session_deadline, STAGE3_SHARE);
        let synthesis = self
            .run_stage3(
                query,
                &panel,
                &candidates,
                &stage2,
                &aggregate,
                emitter,
                transcript,
                &mut notices,
                per_call_deadline(stage3_deadline, per_call_ceiling),
            )
            .await?;
        timestamps.insert("stage3".to_string(), Utc::now());
        state.enter(SessionState::Sealed, &query.id);

        Ok(DeliberationResult {
            query_id: query.id.clone(),
            synthesis,
            winning_slot: aggregate.winner(),
            aggregate,
            panel: panel.clone(),
            stage1,
            reviews: stage2.reviews,
            notices,
            transcript_dir: None,
            timestamps,
        })
    }

    fn check_liveness(
        &self,
        cancel: &CancellationToken,
        session_deadline: Instant,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(CouncilError::session(FailureReason::Cancelled));
        }
        if Instant::now() >= session_deadline {
            return Err(CouncilError::session(FailureReason::DeadlineExceeded));
        }
        Ok(())
    }

    /// Bind panel slots: participants first, chairman last.
    async fn select_panel(
        &self,
        query: &Query,
        notices: &mut Vec<DegradationNotice>,
    ) -> Result<Vec<PanelSlot>> {
        let all = self.registry.all().await;

        // Configured council models restrict the candidate pool; an
        // empty configuration opens selection to the whole registry.
        let (pool, count) = if self.config.council_models.is_empty() {
            (all, DEFAULT_PANEL_SIZE)
        } else {
            let mut pool = Vec::new();
            for model_id in &self.config.council_models {
                match all.iter().find(|d| &d.id == model_id) {
                    Some(d) => pool.push(d.clone()),
                    None => {
                        warn!(model = %model_id, "configured council model missing from registry");
                        notices.push(DegradationNotice::session(format!(
                            "configured model {model_id} missing from registry"
                        )));
                    }
                }
            }
            let count = pool.len();
            (pool, count)
        };

        let request = PanelRequest {
            tier: query.tier,
            count,
            capabilities: Vec::new(),
            budget_ceiling_usd: None,
        };
        let selected = self.selector.select(&pool, &request)?;

        let mut panel: Vec<PanelSlot> = selected
            .iter()
            .enumerate()
            .map(|(index, model_id)| PanelSlot {
                index,
                model_id: model_id.clone(),
                role: SlotRole::Participant,
            })
            .collect();

        // Chairman: the configured model when the registry knows it,
        // otherwise the top-ranked participant doubles as chairman.
        let chairman_model = if self
            .registry
            .describe(&self.config.chairman_model)
            .await
            .is_some()
        {
            self.config.chairman_model.clone()
        } else {
            warn!(
                chairman = %self.config.chairman_model,
                "configured chairman unknown, top participant will preside"
            );
            notices.push(DegradationNotice::session(
                "configured chairman unknown; top-ranked participant presides",
            ));
            selected[0].clone()
        };
        panel.push(PanelSlot {
            index: panel.len(),
            model_id: chairman_model,
            role: SlotRole::Chairman,
        });

        Ok(panel)
    }

    /// Stage 1: fan out all participant prompts concurrently. Each slot
    /// runs in isolation; a slot's failure does not cancel peers.
    async fn run_stage1(
        &self,
        query: &Query,
        panel: &[PanelSlot],
        emitter: &Arc<EventEmitter>,
        cancel: &CancellationToken,
        call_deadline: Duration,
    ) -> Vec<StageOneResponse> {
        let prompt = prompts::stage1_prompt(query);
        let mut tasks: JoinSet<StageOneResponse> = JoinSet::new();

        for slot in panel.iter().filter(|s| s.role == SlotRole::Participant) {
            let gateway = self.gateway.clone();
            let emitter = emitter.clone();
            let cancel = cancel.clone();
            let model_id = slot.model_id.clone();
            let slot_index = slot.index;
            let prompt = prompt.clone();

            tasks.spawn(async move {
                emitter.emit(
                    EventKind::Stage1SlotStarted,
                    Some(Stage::Stage1),
                    Some(slot_index),
                    serde_json::json!({ "model": model_id }),
                );

                let request = CompletionRequest::new(&model_id, vec![ChatMessage::user(prompt)])
                    .with_deadline(call_deadline);
                let start = Instant::now();

                let outcome = tokio::select! {
                    _ = cancel.cancelled() => None,
                    result = tokio::time::timeout(call_deadline, gateway.complete(&request)) => {
                        Some(result)
                    }
                };

                let latency_ms = start.elapsed().as_millis() as u64;
                let response = match outcome {
                    None => StageOneResponse {
                        slot: slot_index,
                        content: String::new(),
                        usage: None,
                        latency_ms,
                        notices: vec![],
                        status: SlotStatus::Cancelled,
                    },
                    Some(Err(_elapsed)) => StageOneResponse {
                        slot: slot_index,
                        content: String::new(),
                        usage: None,
                        latency_ms,
                        notices: vec![DegradationNotice::for_slot(
                            slot_index,
                            format!("{model_id} exceeded the stage deadline"),
                        )],
                        status: SlotStatus::Timeout,
                    },
                    Some(Ok(Ok(result))) => StageOneResponse {
                        slot: slot_index,
                        content: result.content,
                        usage: result.usage.map(|u| TokenUsage {
                            prompt_tokens: u.prompt_tokens,
                            completion_tokens: u.completion_tokens,
                            total_tokens: u.total_tokens,
                        }),
                        latency_ms,
                        notices: result
                            .notices
                            .into_iter()
                            .map(|m| DegradationNotice::for_slot(slot_index, m))
                            .collect(),
                        status: SlotStatus::Ok,
                    },
                    Some(Ok(Err(err))) => StageOneResponse {
                        slot: slot_index,
                        content: String::new(),
                        usage: None,
                        latency_ms,
                        notices: vec![DegradationNotice::for_slot(
                            slot_index,
                            format!("{model_id} failed: {err}"),
                        )],
                        status: SlotStatus::Failed,
                    },
                };

                emitter.emit(
                    EventKind::Stage1SlotCompleted,
                    Some(Stage::Stage1),
                    Some(slot_index),
                    serde_json::json!({
                        "status": response.status,
                        "latency_ms": response.latency_ms,
                    }),
                );
                response
            });
        }

        let mut responses = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(response) => responses.push(response),
                Err(e) => warn!(error = %e, "stage1 task panicked"),
            }
        }
        responses.sort_by_key(|r| r.slot);
        responses
    }

    /// Stage 1.5: rewrite each surviving response in neutral voice.
    /// Failures are non-fatal; the original text is used.
    async fn normalize_styles(
        &self,
        candidates: &mut [(usize, String)],
        notices: &mut Vec<DegradationNotice>,
        call_deadline: Duration,
    ) {
        for (slot, content) in candidates.iter_mut() {
            let request = CompletionRequest::new(
                &self.config.normalizer_model,
                vec![ChatMessage::user(prompts::normalize_prompt(content))],
            )
            .with_deadline(call_deadline);

            match tokio::time::timeout(call_deadline, self.gateway.complete(&request)).await {
                Ok(Ok(result)) if !result.content.trim().is_empty() => {
                    *content = result.content;
                }
                _ => {
                    notices.push(DegradationNotice::for_slot(
                        *slot,
                        "style normalization failed; original text used",
                    ));
                }
            }
        }
    }

    /// Stage 2: per-reviewer anonymized prompts, fresh shuffle each,
    /// concurrent fan-out, parse-or-abstain.
    async fn run_stage2(
        &self,
        query: &Query,
        panel: &[PanelSlot],
        candidates: &[(usize, String)],
        emitter: &Arc<EventEmitter>,
        cancel: &CancellationToken,
        call_deadline: Duration,
    ) -> Stage2Output {
        let expect_verdict = query.verdict_type == VerdictType::Binary;
        let exclude_self = self.config.exclude_self_votes;

        // Reviewers are the surviving participants, optionally sampled
        // down to the configured cap.
        let mut reviewer_slots: Vec<usize> = candidates.iter().map(|(slot, _)| *slot).collect();
        if let Some(cap) = self.config.max_reviewers {
            if reviewer_slots.len() > cap {
                let mut rng = rand::thread_rng();
                reviewer_slots.shuffle(&mut rng);
                reviewer_slots.truncate(cap);
                reviewer_slots.sort_unstable();
                debug!(cap, "stratified reviewer sampling applied");
            }
        }

        let mut tasks: JoinSet<Stage2SlotOutput> = JoinSet::new();
        for reviewer in &reviewer_slots {
            let reviewer = *reviewer;
            let model_id = panel
                .iter()
                .find(|s| s.index == reviewer)
                .map(|s| s.model_id.clone())
                .unwrap_or_default();

            let presentation = {
                let mut rng = rand::thread_rng();
                prompts::build_review_presentation(
                    query,
                    candidates,
                    self.config.position_randomization,
                    &mut rng,
                )
            };

            let gateway = self.gateway.clone();
            let emitter = emitter.clone();
            let cancel = cancel.clone();

            tasks.spawn(async move {
                emitter.emit(
                    EventKind::Stage2SlotStarted,
                    Some(Stage::Stage2),
                    Some(reviewer),
                    serde_json::json!({ "model": model_id }),
                );

                let request = CompletionRequest::new(
                    &model_id,
                    vec![ChatMessage::user(presentation.prompt.clone())],
                )
                .with_deadline(call_deadline);

                let outcome = tokio::select! {
                    _ = cancel.cancelled() => None,
                    result = tokio::time::timeout(call_deadline, gateway.complete(&request)) => {
                        Some(result)
                    }
                };

                let parsed = match &outcome {
                    None => ParsedReview::Abstain {
                        reviewer,
                        reason: "cancelled".into(),
                    },
                    Some(Err(_elapsed)) => ParsedReview::Abstain {
                        reviewer,
                        reason: format!("reviewer {model_id} exceeded the stage deadline"),
                    },
                    Some(Ok(Err(err))) => ParsedReview::Abstain {
                        reviewer,
                        reason: format!("reviewer {model_id} failed: {err}"),
                    },
                    Some(Ok(Ok(result))) => parse_review(
                        reviewer,
                        &result.content,
                        &presentation.labels,
                        exclude_self,
                        expect_verdict,
                    ),
                };

                emitter.emit(
                    EventKind::Stage2SlotCompleted,
                    Some(Stage::Stage2),
                    Some(reviewer),
                    serde_json::json!({
                        "valid": matches!(parsed, ParsedReview::Valid(_)),
                    }),
                );

                let raw_text = match outcome {
                    Some(Ok(Ok(result))) => result.content,
                    _ => String::new(),
                };
                Stage2SlotOutput {
                    reviewer,
                    parsed,
                    raw_text,
                    first_presented: presentation.first_slot(),
                    labels: presentation.labels,
                }
            });
        }

        let mut output = Stage2Output::default();
        while let Some(joined) = tasks.join_next().await {
            let slot_output = match joined {
                Ok(o) => o,
                Err(e) => {
                    warn!(error = %e, "stage2 task panicked");
                    continue;
                }
            };
            output
                .label_maps
                .insert(slot_output.reviewer, slot_output.labels);
            output
                .first_presented
                .insert(slot_output.reviewer, slot_output.first_presented);
            match slot_output.parsed {
                ParsedReview::Valid(review) => {
                    output
                        .raw_texts
                        .push((slot_output.reviewer, slot_output.raw_text));
                    output.reviews.push(review);
                }
                ParsedReview::Abstain { reviewer, reason } => {
                    let notice = DegradationNotice::for_slot(
                        reviewer,
                        format!("reviewer abstained: {reason}"),
                    );
                    emitter.emit(
                        EventKind::DegradationNotice,
                        Some(Stage::Stage2),
                        Some(reviewer),
                        serde_json::json!({ "message": notice.message }),
                    );
                    output.abstentions.push(notice);
                }
            }
        }
        output.reviews.sort_by_key(|r| r.reviewer);
        output.raw_texts.sort_by_key(|(r, _)| *r);
        output
    }

    /// Aggregation: Borda or Schulze with bias correction and the
    /// optional binary verdict.
    async fn aggregate(
        &self,
        query: &Query,
        panel: &[PanelSlot],
        candidate_slots: &[usize],
        candidates: &[(usize, String)],
        stage1: &[StageOneResponse],
        stage2: &Stage2Output,
    ) -> AggregateResult {
        let mut meta = Vec::new();
        for (slot, content) in candidates {
            let model_id = panel
                .iter()
                .find(|s| s.index == *slot)
                .map(|s| s.model_id.as_str())
                .unwrap_or_default();
            let cost = match self.registry.describe(model_id).await {
                Some(descriptor) => {
                    let usage = stage1
                        .iter()
                        .find(|r| r.slot == *slot)
                        .and_then(|r| r.usage)
                        .unwrap_or_default();
                    descriptor
                        .pricing
                        .estimate_usd(usage.prompt_tokens, usage.completion_tokens)
                }
                None => 0.0,
            };
            meta.push(CandidateMeta {
                slot: *slot,
                generation_cost_usd: cost,
                content_hash: content_hash(content),
            });
        }

        // Cross-session flags map from model ids back to this session's
        // reviewer slots.
        let mut prior_weights: HashMap<usize, f64> = HashMap::new();
        if let Some(ref auditor) = self.auditor {
            let flagged = auditor.lock().expect("auditor lock").flagged_model_ids();
            for slot in panel {
                if flagged.contains(&slot.model_id) {
                    prior_weights.insert(slot.index, crate::aggregate::BIAS_DOWNWEIGHT);
                }
            }
        }

        let aggregator = Aggregator::new(self.config.ranking_method);
        let mut aggregate =
            aggregator.aggregate(candidate_slots, &stage2.reviews, &meta, &prior_weights);
        if query.verdict_type == VerdictType::Binary {
            aggregate.binary = Some(Aggregator::binary_verdict(&stage2.reviews));
        }
        aggregate
    }

    /// Fold this session into the cross-session bias audit.
    fn record_audit(
        &self,
        query: &Query,
        panel: &[PanelSlot],
        candidate_slots: &[usize],
        stage2: &Stage2Output,
    ) {
        let Some(ref auditor) = self.auditor else {
            return;
        };
        let model_of = |slot: usize| -> String {
            panel
                .iter()
                .find(|s| s.index == slot)
                .map(|s| s.model_id.clone())
                .unwrap_or_default()
        };
        let deviations = Aggregator::deviations(candidate_slots, &stage2.reviews);

        let reviewers = stage2
            .reviews
            .iter()
            .map(|review| {
                let ranks = review
                    .ranking
                    .iter()
                    .map(|rc| (model_of(rc.slot), rc.rank))
                    .collect();
                let top_choice = review.ranking.first().map(|rc| rc.slot);
                ReviewerSessionStats {
                    model_id: model_of(review.reviewer),
                    signed_deviation: deviations
                        .get(&review.reviewer)
                        .map(|d| d.signed)
                        .unwrap_or(0.0),
                    self_vote_attempted: review.self_vote_stripped,
                    ranks,
                    top_choice_presented_first: top_choice.is_some()
                        && stage2.first_presented.get(&review.reviewer).copied()
                            == top_choice,
                }
            })
            .collect();

        let mut auditor = auditor.lock().expect("auditor lock");
        auditor.record_session(&SessionAudit {
            query_id: query.id.clone(),
            reviewers,
        });
        if let Err(e) = auditor.save() {
            warn!(error = %e, "bias audit store save failed");
        }
    }

    /// Stage 3: chairman synthesis, streamed when requested. A chairman
    /// failure degrades to the top-ranked candidate's text.
    #[allow(clippy::too_many_arguments)]
    async fn run_stage3(
        &self,
        query: &Query,
        panel: &[PanelSlot],
        candidates: &[(usize, String)],
        stage2: &Stage2Output,
        aggregate: &AggregateResult,
        emitter: &Arc<EventEmitter>,
        transcript: Option<&SessionTranscript>,
        notices: &mut Vec<DegradationNotice>,
        call_deadline: Duration,
    ) -> Result<String> {
        let chairman = panel
            .iter()
            .find(|s| s.role == SlotRole::Chairman)
            .expect("panel always carries a chairman slot");

        emitter.emit(
            EventKind::Stage3Started,
            Some(Stage::Stage3),
            Some(chairman.index),
            serde_json::json!({ "model": chairman.model_id }),
        );

        let dissents: Vec<String> = if query.mode != Mode::Consensus {
            stage2
                .reviews
                .iter()
                .filter_map(|r| r.dissent.clone())
                .collect()
        } else {
            Vec::new()
        };

        let prompt = prompts::chairman_prompt(
            query,
            candidates,
            &stage2.raw_texts,
            aggregate,
            &dissents,
        );
        let request = CompletionRequest::new(
            &chairman.model_id,
            vec![ChatMessage::user(prompt)],
        )
        .with_deadline(call_deadline);

        let synthesis = if query.streaming {
            let (tx, mut rx) = tokio::sync::mpsc::channel::<StreamChunk>(64);
            let gateway = self.gateway.clone();
            let stream_request = request.clone();
            let stream_task = tokio::spawn(async move {
                gateway.complete_stream(&stream_request, tx).await
            });

            let mut text = String::new();
            while let Some(chunk) = rx.recv().await {
                if let StreamChunk::TextDelta { text: delta } = chunk {
                    if !delta.is_empty() {
                        emitter.emit(
                            EventKind::Stage3Token,
                            Some(Stage::Stage3),
                            Some(chairman.index),
                            serde_json::json!({ "text": delta }),
                        );
                        text.push_str(&delta);
                    }
                }
            }
            match stream_task.await {
                Ok(Ok(())) => Ok(text),
                Ok(Err(err)) => Err(err),
                Err(_join) => Err(conclave_llm::GatewayError::RequestFailed(
                    "stage3 stream task failed".into(),
                )),
            }
        } else {
            tokio::time::timeout(call_deadline, self.gateway.complete(&request))
                .await
                .map_err(|_| conclave_llm::GatewayError::Timeout)
                .and_then(|r| r)
                .map(|result| result.content)
        };

        let synthesis = match synthesis {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) | Err(_) => {
                // Recover locally: the winning candidate's own text
                // stands in for the synthesis.
                let fallback = aggregate
                    .winner()
                    .and_then(|slot| {
                        candidates
                            .iter()
                            .find(|(s, _)| *s == slot)
                            .map(|(_, c)| c.clone())
                    })
                    .unwrap_or_default();
                notices.push(DegradationNotice::for_slot(
                    chairman.index,
                    "chairman unavailable; top-ranked response returned verbatim",
                ));
                emitter.emit(
                    EventKind::DegradationNotice,
                    Some(Stage::Stage3),
                    Some(chairman.index),
                    serde_json::json!({
                        "message": "chairman unavailable; top-ranked response returned verbatim",
                    }),
                );
                fallback
            }
        };

        if let Some(t) = transcript {
            t.write_stage(
                "stage3",
                &serde_json::json!({
                    "chairman": chairman.model_id,
                    "synthesis": synthesis,
                }),
            )?;
        }
        emitter.emit(
            EventKind::Stage3Complete,
            Some(Stage::Stage3),
            Some(chairman.index),
            serde_json::json!({ "chars": synthesis.len() }),
        );
        Ok(synthesis)
    }
}

/// Everything Stage 2 produced.
#[derive(Debug, Default)]
pub(crate) struct Stage2Output {
    reviews: Vec<PeerReview>,
    abstentions: Vec<DegradationNotice>,
    raw_texts: Vec<(usize, String)>,
    label_maps: BTreeMap<usize, Vec<(String, usize)>>,
    first_presented: BTreeMap<usize, usize>,
}

struct Stage2SlotOutput {
    reviewer: usize,
    parsed: ParsedReview,
    raw_text: String,
    first_presented: usize,
    labels: Vec<(String, usize)>,
}

/// A stage's deadline: the given share of the remaining session budget.
fn stage_deadline(session_deadline: Instant, share: f64) -> Instant {
    let remaining = session_deadline.saturating_duration_since(Instant::now());
    Instant::now() + remaining.mul_f64(share.clamp(0.0, 1.0))
}

/// Per-call deadline: min(stage deadline, configured per-call ceiling).
fn per_call_deadline(stage_deadline: Instant, ceiling: Duration) -> Duration {
    stage_deadline
        .saturating_duration_since(Instant::now())
        .min(ceiling)
}
