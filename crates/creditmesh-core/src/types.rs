use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::MeshError;

/// Amount in atoms: base-10 integer units with the equivalent's precision
/// implied (e.g. precision 2 → 1 nominal unit = 100 atoms). u128 leaves
/// ample headroom for any community-scale ledger.
pub type Atoms = u128;

/// Unix timestamp (seconds, UTC).
pub type Timestamp = i64;

/// One orchestrator iteration; unit of scheduling and deterministic replay.
pub type Tick = u64;

/// Durable, monotonically increasing event sequence number.
pub type EventSeq = u64;

// ── Pid ──────────────────────────────────────────────────────────────────────

/// Participant identifier: the SHA-256 digest of the participant's public
/// key. Rendered as Base58 (~44 ASCII chars) everywhere outside the store.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pid(pub [u8; 32]);

impl Pid {
    pub fn from_bytes(b: [u8; 32]) -> Self {
        Self(b)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Base-58 encoded string representation.
    pub fn to_b58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }

    pub fn from_b58(s: &str) -> Result<Self, MeshError> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| MeshError::InvalidRequest(format!("bad pid {s:?}: {e}")))?;
        if bytes.len() != 32 {
            return Err(MeshError::InvalidRequest(format!(
                "bad pid {s:?}: expected 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_b58())
    }
}

impl fmt::Debug for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pid({})", &self.to_b58()[..8])
    }
}

// ── Equivalent ───────────────────────────────────────────────────────────────

/// An opaque currency/unit code with a declared decimal precision.
/// All amounts for the equivalent are carried as atoms; decimal strings on
/// the wire convert both ways exactly. No cross-equivalent arithmetic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Equivalent {
    /// Unit code, e.g. `UAH` or `HOUR_DEV`.
    pub code: String,
    /// Implied fractional digits for wire amounts.
    pub precision: u32,
    pub created_at: Timestamp,
}

// ── Participant ──────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantKind {
    Person,
    Business,
    Hub,
}

impl ParticipantKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Business => "business",
            Self::Hub => "hub",
        }
    }

    pub fn parse(s: &str) -> Result<Self, MeshError> {
        match s {
            "person" => Ok(Self::Person),
            "business" => Ok(Self::Business),
            "hub" => Ok(Self::Hub),
            other => Err(MeshError::InvalidRequest(format!(
                "unknown participant kind {other:?}"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantStatus {
    Active,
    Suspended,
    Left,
    /// Tombstone: participants are never deleted in place.
    Deleted,
}

impl ParticipantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Left => "left",
            Self::Deleted => "deleted",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub pid: Pid,
    pub display_name: String,
    pub kind: ParticipantKind,
    pub status: ParticipantStatus,
    pub created_at: Timestamp,
}

impl Participant {
    pub fn new(pid: Pid, display_name: String, kind: ParticipantKind, now: Timestamp) -> Self {
        Self {
            pid,
            display_name,
            kind,
            status: ParticipantStatus::Active,
            created_at: now,
        }
    }
}

// ── TrustLine ────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustLineStatus {
    Active,
    Frozen,
    Closed,
}

/// A directed credit ceiling from creditor `from` to debtor `to` in one
/// equivalent. Primary key is the (from, to, equivalent) triple.
///
/// The paired Debt (to, from, equivalent) always carries `amount == used`;
/// the two views are updated atomically inside the same lock scope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrustLine {
    /// Creditor: extends the credit.
    pub from: Pid,
    /// Debtor: may owe up to `limit`.
    pub to: Pid,
    pub equivalent: String,
    pub limit: Atoms,
    pub used: Atoms,
    pub status: TrustLineStatus,
    pub created_at: Timestamp,
    /// Last time a payment or clearing touched this edge. Drives drift decay.
    pub last_active_at: Timestamp,
    /// Opaque policy blob (raw JSON text), uninterpreted by the core.
    pub policy: Option<String>,
}

impl TrustLine {
    pub fn new(from: Pid, to: Pid, equivalent: String, limit: Atoms, now: Timestamp) -> Self {
        Self {
            from,
            to,
            equivalent,
            limit,
            used: 0,
            status: TrustLineStatus::Active,
            created_at: now,
            last_active_at: now,
            policy: None,
        }
    }

    /// Residual capacity. `used <= limit` is invariant after every commit.
    pub fn available(&self) -> Atoms {
        self.limit.saturating_sub(self.used)
    }

    pub fn is_active(&self) -> bool {
        self.status == TrustLineStatus::Active
    }
}

// ── Debt ─────────────────────────────────────────────────────────────────────

/// A directed obligation: `debtor` owes `creditor` `amount` in `equivalent`.
/// Mirror of the opposite-direction TrustLine's `used`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Debt {
    pub debtor: Pid,
    pub creditor: Pid,
    pub equivalent: String,
    pub amount: Atoms,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

// ── Canonical lock key ───────────────────────────────────────────────────────

/// Row-lock key for one TrustLine/Debt aggregate. All locks taken by a
/// single logical operation must be acquired in ascending `LockKey` order:
/// equivalent, then the unordered participant pair, then direction. This
/// ordering is the sole deadlock-avoidance mechanism between the payment
/// and clearing sessions.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockKey {
    pub equivalent: String,
    lo: Pid,
    hi: Pid,
    /// 0 when the TrustLine direction runs lo→hi, 1 otherwise.
    dir: u8,
}

impl LockKey {
    /// Key for the TrustLine edge (creditor `from` → debtor `to`) and its
    /// paired Debt. The pair is one aggregate under one lock.
    pub fn edge(equivalent: &str, from: Pid, to: Pid) -> Self {
        let (lo, hi, dir) = if from <= to { (from, to, 0) } else { (to, from, 1) };
        Self {
            equivalent: equivalent.to_string(),
            lo,
            hi,
            dir,
        }
    }
}

// ── Transaction record ───────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxType {
    Payment,
    Clearing,
}

impl TxType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Payment => "PAYMENT",
            Self::Clearing => "CLEARING",
        }
    }
}

/// Transaction lifecycle state. Transitions are monotonic along one of two
/// linear paths: Pending→Preparing→Prepared→Committed, or any non-terminal
/// state →RolledBack/Failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxState {
    Pending,
    Preparing,
    Prepared,
    Committed,
    RolledBack,
    Failed,
}

impl TxState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack | Self::Failed)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_become(&self, next: TxState) -> bool {
        use TxState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (Pending, Preparing) | (Preparing, Prepared) | (Prepared, Committed) => true,
            (_, RolledBack) | (_, Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Preparing => "preparing",
            Self::Prepared => "prepared",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
            Self::Failed => "failed",
        }
    }
}

/// What the transaction attempted. Stored on the append-only record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TxPayload {
    Payment {
        from: Pid,
        to: Pid,
        equivalent: String,
        amount: Atoms,
    },
    Clearing {
        equivalent: String,
        /// TrustLine-direction edges of the cancelled cycle.
        cycle: Vec<(Pid, Pid)>,
        amount: Atoms,
    },
}

/// Append-only record of an attempted state change. Immutable once the
/// state is terminal. `tx_id` is the caller-supplied idempotency key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TxRecord {
    pub tx_id: String,
    pub tx_type: TxType,
    pub initiator: Pid,
    pub payload: TxPayload,
    pub state: TxState,
    pub error: Option<ErrorKind>,
    /// SHA-256 of the canonical JSON of the signed request, when the caller
    /// provided a signed operation. Verification happens outside the core.
    pub payload_hash: Option<String>,
    pub created_at: Timestamp,
    pub finished_at: Option<Timestamp>,
}

// ── ErrorKind ────────────────────────────────────────────────────────────────

/// Caller-visible error kinds. The wire form of a failure reason.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidRequest,
    NoPath,
    InsufficientCapacity,
    Conflict,
    Frozen,
    Timeout,
    NotEmpty,
    AlreadyExists,
    InProgress,
    /// Storage or serialization fault; not part of the request taxonomy.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "InvalidRequest",
            Self::NoPath => "NoPath",
            Self::InsufficientCapacity => "InsufficientCapacity",
            Self::Conflict => "Conflict",
            Self::Frozen => "Frozen",
            Self::Timeout => "Timeout",
            Self::NotEmpty => "NotEmpty",
            Self::AlreadyExists => "AlreadyExists",
            Self::InProgress => "InProgress",
            Self::Internal => "Internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(n: u8) -> Pid {
        Pid::from_bytes([n; 32])
    }

    #[test]
    fn pid_b58_round_trip() {
        let p = pid(7);
        let s = p.to_b58();
        assert_eq!(Pid::from_b58(&s).unwrap(), p);
    }

    #[test]
    fn pid_from_b58_rejects_wrong_length() {
        assert!(Pid::from_b58("abc").is_err());
    }

    #[test]
    fn lock_key_orders_by_equivalent_then_pair() {
        let a = pid(1);
        let b = pid(2);
        let k1 = LockKey::edge("EUR", a, b);
        let k2 = LockKey::edge("UAH", a, b);
        assert!(k1 < k2);

        // Same unordered pair, both directions: keys differ only in dir.
        let fwd = LockKey::edge("UAH", a, b);
        let rev = LockKey::edge("UAH", b, a);
        assert!(fwd < rev);
        assert_ne!(fwd, rev);
    }

    #[test]
    fn trustline_available() {
        let mut tl = TrustLine::new(pid(1), pid(2), "UAH".into(), 1000, 0);
        assert_eq!(tl.available(), 1000);
        tl.used = 250;
        assert_eq!(tl.available(), 750);
    }

    #[test]
    fn tx_state_transitions_are_monotonic() {
        use TxState::*;
        assert!(Pending.can_become(Preparing));
        assert!(Preparing.can_become(Prepared));
        assert!(Prepared.can_become(Committed));
        assert!(Preparing.can_become(RolledBack));
        assert!(Pending.can_become(Failed));
        assert!(!Committed.can_become(Failed));
        assert!(!RolledBack.can_become(Committed));
        assert!(!Pending.can_become(Prepared));
    }
}
