//! Shared data model for the conclave deliberation engine.
//!
//! This crate holds the types every other conclave crate speaks:
//! queries, model metadata, panel slots, peer reviews, aggregate
//! results, lifecycle events, configuration and the error taxonomy.
//! It has no dependency on other workspace crates.

pub mod aggregate;
pub mod config;
pub mod deliberation;
pub mod error;
pub mod event;
pub mod model;
pub mod panel;
pub mod query;
pub mod review;

pub use aggregate::{AggregateResult, BinaryOutcome, BinaryVerdict, RankingMethod};
pub use config::{CouncilConfig, WebhookConfig};
pub use deliberation::DeliberationResult;
pub use error::{CouncilError, FailureReason, Result};
pub use event::{EventKind, LayerEvent, Stage};
pub use model::{Capability, HardwareProfile, ModelDescriptor, Pricing};
pub use panel::{
    DegradationNotice, PanelSlot, SlotRole, SlotStatus, StageOneResponse, TokenUsage,
};
pub use query::{Mode, Query, Tier, VerdictType};
pub use review::{PeerReview, RankedCandidate, RubricScores};
