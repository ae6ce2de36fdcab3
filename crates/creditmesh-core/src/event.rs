//! Event stream types.
//!
//! Every edge reference in event payloads uses the keys `from` and `to`
//! in the **TrustLine** direction (creditor→debtor). Payments and cycles
//! operate on the debt direction; the engines transform between the two
//! views at their boundary, never in payloads. Amounts are wire decimal
//! strings, PIDs are Base58 strings, so a payload serializes to its wire
//! JSON without further conversion.

use serde::{Deserialize, Serialize};

use crate::types::{EventSeq, Timestamp};

// ── Event envelope ───────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    TxUpdated,
    TxFailed,
    ClearingDone,
    TopologyChanged,
    RunStatus,
    Lost,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TxUpdated => "tx.updated",
            Self::TxFailed => "tx.failed",
            Self::ClearingDone => "clearing.done",
            Self::TopologyChanged => "topology.changed",
            Self::RunStatus => "run_status",
            Self::Lost => "lost",
        }
    }
}

/// One emitted event: `{seq, ts, kind, payload}`. Subscribers observe
/// strictly increasing `seq` and may replay from any prior value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: EventSeq,
    pub ts: Timestamp,
    pub kind: EventKind,
    pub payload: EventPayload,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    TxUpdated(TxUpdatedPayload),
    TxFailed(TxFailedPayload),
    ClearingDone(ClearingDonePayload),
    TopologyChanged(TopologyChangedPayload),
    RunStatus(RunStatusPayload),
    Lost(LostPayload),
}

impl Event {
    /// Wire JSON: `{"seq":…,"ts":…,"kind":"tx.updated","payload":{…}}`.
    pub fn to_wire_json(&self) -> serde_json::Value {
        let payload = match &self.payload {
            EventPayload::TxUpdated(p) => serde_json::to_value(p),
            EventPayload::TxFailed(p) => serde_json::to_value(p),
            EventPayload::ClearingDone(p) => serde_json::to_value(p),
            EventPayload::TopologyChanged(p) => serde_json::to_value(p),
            EventPayload::RunStatus(p) => serde_json::to_value(p),
            EventPayload::Lost(p) => serde_json::to_value(p),
        }
        .unwrap_or(serde_json::Value::Null);
        serde_json::json!({
            "seq": self.seq,
            "ts": self.ts,
            "kind": self.kind.as_str(),
            "payload": payload,
        })
    }
}

// ── Edge / node references ───────────────────────────────────────────────────

/// An edge in TrustLine direction: `from` = creditor, `to` = debtor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeRef {
    pub from: String,
    pub to: String,
}

/// Fresh state of one edge after a committed mutation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EdgePatchEntry {
    pub from: String,
    pub to: String,
    pub equivalent: String,
    pub limit: String,
    pub used: String,
    pub available: String,
    pub status: String,
    /// Decile bucket of `used` within the equivalent, for edge widths.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viz_width_bucket: Option<u8>,
}

/// Never emitted empty: builders drop events whose patch has no edges.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EdgePatch {
    pub edges: Vec<EdgePatchEntry>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodePatchEntry {
    pub pid: String,
    pub display_name: String,
    pub kind: String,
    pub status: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodePatch {
    pub nodes: Vec<NodePatchEntry>,
}

// ── Payloads ─────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TxUpdatedPayload {
    pub tx_id: String,
    #[serde(rename = "type")]
    pub tx_type: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub equivalent: String,
    pub amount: String,
    /// The exact edges mutated by the commit, with fresh
    /// `{limit, used, available}`.
    pub edges: Vec<EdgePatchEntry>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TxFailedPayload {
    pub tx_id: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub equivalent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClearingDonePayload {
    pub cycle_edges: Vec<EdgeRef>,
    pub cleared_amount: String,
    pub equivalent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleared_cycles: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TopologyChangedPayload {
    pub reason: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub added_nodes: Vec<NodePatchEntry>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub added_edges: Vec<EdgeRef>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub frozen_nodes: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub frozen_edges: Vec<EdgeRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge_patch: Option<EdgePatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_patch: Option<NodePatch>,
}

impl TopologyChangedPayload {
    pub fn with_reason(reason: &str) -> Self {
        Self {
            reason: reason.to_string(),
            added_nodes: Vec::new(),
            added_edges: Vec::new(),
            frozen_nodes: Vec::new(),
            frozen_edges: Vec::new(),
            edge_patch: None,
            node_patch: None,
        }
    }

    /// A topology event must carry at least one non-empty field besides
    /// the reason; empty ones are dropped before emission.
    pub fn is_empty(&self) -> bool {
        self.added_nodes.is_empty()
            && self.added_edges.is_empty()
            && self.frozen_nodes.is_empty()
            && self.frozen_edges.is_empty()
            && self.edge_patch.as_ref().map_or(true, |p| p.edges.is_empty())
            && self.node_patch.as_ref().map_or(true, |p| p.nodes.is_empty())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunStatusPayload {
    pub state: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LostPayload {
    pub last_seen_seq: EventSeq,
}
