use thiserror::Error;

use crate::types::{Atoms, ErrorKind};

#[derive(Debug, Error)]
pub enum MeshError {
    // ── Request errors ───────────────────────────────────────────────────────
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unknown participant: {0}")]
    UnknownParticipant(String),

    #[error("unknown equivalent: {0}")]
    UnknownEquivalent(String),

    #[error("self trust line not allowed")]
    SelfEdge,

    #[error("amount must be greater than zero")]
    ZeroAmount,

    // ── Routing / payment errors ─────────────────────────────────────────────
    #[error("no path from {from} to {to} in {equivalent}")]
    NoPath {
        from: String,
        to: String,
        equivalent: String,
    },

    #[error("insufficient capacity: need {need} atoms, routable {routable}")]
    InsufficientCapacity { need: Atoms, routable: Atoms },

    #[error("lock conflict on {0}")]
    Conflict(String),

    #[error("participant or edge is frozen: {0}")]
    Frozen(String),

    #[error("deadline exceeded before commit")]
    Timeout,

    // ── Topology errors ──────────────────────────────────────────────────────
    #[error("trust line still carries {amount} atoms of debt")]
    NotEmpty { amount: Atoms },

    #[error("already exists with conflicting state: {0}")]
    AlreadyExists(String),

    #[error("transaction {0} is still in flight")]
    InProgress(String),

    // ── Serialization / storage ──────────────────────────────────────────────
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl MeshError {
    /// The caller-visible kind recorded on transaction records and
    /// `tx.failed` payloads.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest(_)
            | Self::UnknownParticipant(_)
            | Self::UnknownEquivalent(_)
            | Self::SelfEdge
            | Self::ZeroAmount => ErrorKind::InvalidRequest,
            Self::NoPath { .. } => ErrorKind::NoPath,
            Self::InsufficientCapacity { .. } => ErrorKind::InsufficientCapacity,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Frozen(_) => ErrorKind::Frozen,
            Self::Timeout => ErrorKind::Timeout,
            Self::NotEmpty { .. } => ErrorKind::NotEmpty,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::InProgress(_) => ErrorKind::InProgress,
            Self::Serialization(_) | Self::Storage(_) => ErrorKind::Internal,
        }
    }

    /// Errors the engines recover from by skipping the affected payment or
    /// cycle and continuing the tick.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_taxonomy() {
        assert_eq!(
            MeshError::UnknownEquivalent("XYZ".into()).kind(),
            ErrorKind::InvalidRequest
        );
        assert_eq!(
            MeshError::Conflict("edge".into()).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(MeshError::Timeout.kind(), ErrorKind::Timeout);
        assert_eq!(
            MeshError::Storage("io".into()).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn only_conflict_is_recoverable() {
        assert!(MeshError::Conflict("e".into()).is_recoverable());
        assert!(!MeshError::Timeout.is_recoverable());
        assert!(!MeshError::ZeroAmount.is_recoverable());
    }
}
