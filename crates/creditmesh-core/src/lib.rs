pub mod amount;
pub mod constants;
pub mod error;
pub mod event;
pub mod scenario;
pub mod types;

pub use amount::{format_amount, parse_amount};
pub use constants::*;
pub use error::MeshError;
pub use event::{
    EdgePatch, EdgePatchEntry, EdgeRef, Event, EventKind, EventPayload, LostPayload, NodePatch,
    NodePatchEntry, RunStatusPayload, TopologyChangedPayload, TxFailedPayload, TxUpdatedPayload,
};
pub use event::ClearingDonePayload;
pub use scenario::{
    ClearingConfig, DriftConfig, EquivalentDef, InjectOp, ParticipantDef, RouterConfig, Scenario,
    ScenarioEvent, ScheduledPayment, TrustLineDef,
};
pub use types::*;
