pub mod clearing;
pub mod drift;
pub mod inject;
pub mod invalidate;
pub mod metrics;
pub mod payment;

use creditmesh_core::event::{EventKind, EventPayload};

/// An event produced during a tick, published by the orchestrator once the
/// originating commit is durable.
pub type PendingEvent = (EventKind, EventPayload);

pub use clearing::{enumerate_cycles, ClearingEngine, ClearingOutcome, Cycle};
pub use drift::{DriftDecayOutcome, TrustDriftEngine};
pub use inject::{InjectExecutor, InjectResult};
pub use invalidate::CacheInvalidator;
pub use metrics::HubMetrics;
pub use payment::{PaymentEngine, PaymentOutcome, PaymentRequest};
