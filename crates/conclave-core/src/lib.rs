//! Core deliberation engine for conclave.
//!
//! Orchestrates a panel of LLM endpoints through a three-stage
//! protocol -- parallel generation, anonymized peer review, synthesized
//! verdict -- with tiered model selection, peer-ranking aggregation
//! (self-vote exclusion, bias correction, deterministic tie-breaks),
//! cross-session bias auditing, and an event fabric that surfaces every
//! stage transition to webhook and streaming subscribers.
//!
//! # Architecture
//!
//! - [`MetadataProvider`] supplies per-model attributes (static
//!   manifest or dynamic index with graceful fallback)
//! - [`TierSelector`] binds panel slots to concrete models
//! - [`rubric`] parses reviewer output into validated peer reviews
//! - [`Aggregator`] turns rankings into a final ordering and verdict
//! - [`BiasAuditor`] tracks reviewer skew across sessions
//! - [`EventBus`] / [`EventEmitter`] publish the ordered event stream
//! - [`WebhookDispatcher`] delivers signed events externally
//! - [`TranscriptStore`] persists the append-only session record
//! - [`Orchestrator`] drives the state machine end to end

pub mod aggregate;
pub mod audit;
pub mod bus;
pub mod orchestrator;
pub mod prompts;
pub mod registry;
pub mod rubric;
pub mod selector;
pub mod transcript;
pub mod webhook;

pub use aggregate::{Aggregator, CandidateMeta, ReviewerDeviation};
pub use audit::{BiasAuditor, SessionAudit};
pub use bus::{EventBus, EventEmitter, EventSink, EventSubscription};
pub use orchestrator::{Orchestrator, SessionState};
pub use registry::{DynamicRegistry, MetadataProvider, StaticRegistry};
pub use rubric::{parse_review, ParsedReview};
pub use selector::{PanelRequest, SelectionWeights, TierSelector};
pub use transcript::{SessionTranscript, TranscriptStore};
pub use webhook::WebhookDispatcher;
