//! Lifecycle events published during a deliberation session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The deliberation stage an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    PanelSelection,
    Stage1,
    Normalization,
    Stage2,
    Aggregation,
    Stage3,
}

/// Every event kind the engine can emit.
///
/// Wire names use the dotted form (`stage1.slot.completed` etc.).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "council.started")]
    CouncilStarted,
    #[serde(rename = "stage1.slot.started")]
    Stage1SlotStarted,
    #[serde(rename = "stage1.slot.completed")]
    Stage1SlotCompleted,
    #[serde(rename = "stage1.complete")]
    Stage1Complete,
    #[serde(rename = "stage2.slot.started")]
    Stage2SlotStarted,
    #[serde(rename = "stage2.slot.completed")]
    Stage2SlotCompleted,
    #[serde(rename = "stage2.complete")]
    Stage2Complete,
    #[serde(rename = "stage3.started")]
    Stage3Started,
    #[serde(rename = "stage3.token")]
    Stage3Token,
    #[serde(rename = "stage3.complete")]
    Stage3Complete,
    #[serde(rename = "council.completed")]
    CouncilCompleted,
    #[serde(rename = "council.failed")]
    CouncilFailed,
    #[serde(rename = "degradation.notice")]
    DegradationNotice,
    /// Internal only: never dispatched to webhooks.
    #[serde(rename = "webhook.delivery.failed")]
    WebhookDeliveryFailed,
}

impl EventKind {
    /// True for the kinds that terminate a session's event stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventKind::CouncilCompleted | EventKind::CouncilFailed)
    }

    /// True for kinds that may be delivered to external subscribers.
    pub fn is_dispatchable(&self) -> bool {
        !matches!(self, EventKind::WebhookDeliveryFailed)
    }
}

/// One event in a session's strictly ordered stream.
///
/// Sequence numbers are assigned from a single per-query counter and form
/// the gap-free sequence `1, 2, .., K`: a consumer that sees `N` has not
/// missed any number below `N` for the same query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub query_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<usize>,
    /// Opaque structured payload.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
    /// Monotonic sequence number within the query, starting at 1.
    pub seq: u64,
    /// Wall-clock timestamp at emission.
    pub timestamp: DateTime<Utc>,
}
