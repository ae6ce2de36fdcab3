use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::info;

use creditmesh_core::constants::SCHEMA_VERSION;
use creditmesh_core::error::MeshError;
use creditmesh_core::event::Event;
use creditmesh_core::types::{
    Atoms, Debt, Equivalent, EventSeq, Participant, Pid, Timestamp, TrustLine, TxRecord,
};

/// Persistent hub database backed by sled (pure-Rust, no C dependencies).
///
/// Named trees:
///   participants   — pid bytes                     → bincode(Participant)
///   equivalents    — code utf8                     → bincode(Equivalent)
///   trustlines     — code|0x00|from|to             → bincode(TrustLine)
///   debts          — code|0x00|debtor|creditor     → bincode(Debt)
///   transactions   — tx_id utf8                    → bincode(TxRecord)
///   scenario_fired — index u64 be                  → [] (membership set)
///   drift          — code|0x00|from|to             → bincode(EdgeDriftState)
///   events         — seq u64 be                    → bincode(Event)
///   meta           — utf8 key                      → raw bytes
pub struct StoreDb {
    _db: sled::Db,
    pub(crate) participants: sled::Tree,
    pub(crate) equivalents: sled::Tree,
    pub(crate) trustlines: sled::Tree,
    pub(crate) debts: sled::Tree,
    pub(crate) transactions: sled::Tree,
    pub(crate) scenario_fired: sled::Tree,
    pub(crate) drift: sled::Tree,
    events: sled::Tree,
    meta: sled::Tree,
    /// Serialises event_seq allocation; the bus is the only caller but the
    /// counter must never be handed out twice.
    seq_alloc: Mutex<()>,
}

pub(crate) fn store_err(e: impl std::fmt::Display) -> MeshError {
    MeshError::Storage(e.to_string())
}

pub(crate) fn ser_err(e: impl std::fmt::Display) -> MeshError {
    MeshError::Serialization(e.to_string())
}

/// Storage key for one edge (TrustLine or its paired Debt).
pub(crate) fn edge_key(equivalent: &str, a: &Pid, b: &Pid) -> Vec<u8> {
    let mut key = Vec::with_capacity(equivalent.len() + 1 + 64);
    key.extend_from_slice(equivalent.as_bytes());
    key.push(0);
    key.extend_from_slice(a.as_bytes());
    key.extend_from_slice(b.as_bytes());
    key
}

pub(crate) fn equivalent_prefix(equivalent: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(equivalent.len() + 1);
    key.extend_from_slice(equivalent.as_bytes());
    key.push(0);
    key
}

/// Per-edge usage history that drives trust drift.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeDriftState {
    /// Last clearing that touched this edge.
    pub last_cleared_at: Timestamp,
    /// Start of the current cleared-volume accounting window.
    pub window_start: Timestamp,
    /// Volume cleared on this edge inside the window.
    pub cleared_in_window: Atoms,
    /// Last growth step, for cooldown spacing.
    pub last_growth_at: Timestamp,
}

impl StoreDb {
    /// Open or create the hub database at `path` and apply migrations.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, MeshError> {
        let db = sled::open(path).map_err(store_err)?;
        let participants = db.open_tree("participants").map_err(store_err)?;
        let equivalents = db.open_tree("equivalents").map_err(store_err)?;
        let trustlines = db.open_tree("trustlines").map_err(store_err)?;
        let debts = db.open_tree("debts").map_err(store_err)?;
        let transactions = db.open_tree("transactions").map_err(store_err)?;
        let scenario_fired = db.open_tree("scenario_fired").map_err(store_err)?;
        let drift = db.open_tree("drift").map_err(store_err)?;
        let events = db.open_tree("events").map_err(store_err)?;
        let meta = db.open_tree("meta").map_err(store_err)?;
        let store = Self {
            _db: db,
            participants,
            equivalents,
            trustlines,
            debts,
            transactions,
            scenario_fired,
            drift,
            events,
            meta,
            seq_alloc: Mutex::new(()),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Bring the schema version up to date. Runs before the orchestrator
    /// starts; a database written by a newer hub is refused.
    fn migrate(&self) -> Result<(), MeshError> {
        let current = self.get_meta("schema_version")?.map(|b| {
            let mut arr = [0u8; 4];
            arr.copy_from_slice(&b[..4]);
            u32::from_be_bytes(arr)
        });
        match current {
            None => {
                self.put_meta("schema_version", &SCHEMA_VERSION.to_be_bytes())?;
                info!(version = SCHEMA_VERSION, "initialised fresh store");
                Ok(())
            }
            Some(v) if v == SCHEMA_VERSION => Ok(()),
            Some(v) if v < SCHEMA_VERSION => {
                // Future migrations step here, one version at a time.
                self.put_meta("schema_version", &SCHEMA_VERSION.to_be_bytes())?;
                info!(from = v, to = SCHEMA_VERSION, "migrated store schema");
                Ok(())
            }
            Some(v) => Err(MeshError::Storage(format!(
                "store schema version {v} is newer than supported {SCHEMA_VERSION}"
            ))),
        }
    }

    // ── Typed reads (read-committed; sessions layer staging on top) ──────────

    pub fn get_participant(&self, pid: &Pid) -> Result<Option<Participant>, MeshError> {
        decode_opt(self.participants.get(pid.as_bytes()).map_err(store_err)?)
    }

    pub fn get_equivalent(&self, code: &str) -> Result<Option<Equivalent>, MeshError> {
        decode_opt(self.equivalents.get(code.as_bytes()).map_err(store_err)?)
    }

    pub fn get_trustline(
        &self,
        equivalent: &str,
        from: &Pid,
        to: &Pid,
    ) -> Result<Option<TrustLine>, MeshError> {
        decode_opt(
            self.trustlines
                .get(edge_key(equivalent, from, to))
                .map_err(store_err)?,
        )
    }

    pub fn get_debt(
        &self,
        equivalent: &str,
        debtor: &Pid,
        creditor: &Pid,
    ) -> Result<Option<Debt>, MeshError> {
        decode_opt(
            self.debts
                .get(edge_key(equivalent, debtor, creditor))
                .map_err(store_err)?,
        )
    }

    pub fn get_transaction(&self, tx_id: &str) -> Result<Option<TxRecord>, MeshError> {
        decode_opt(self.transactions.get(tx_id.as_bytes()).map_err(store_err)?)
    }

    pub fn get_drift_state(
        &self,
        equivalent: &str,
        from: &Pid,
        to: &Pid,
    ) -> Result<Option<EdgeDriftState>, MeshError> {
        decode_opt(
            self.drift
                .get(edge_key(equivalent, from, to))
                .map_err(store_err)?,
        )
    }

    pub fn is_fired(&self, index: u64) -> Result<bool, MeshError> {
        self.scenario_fired
            .contains_key(index.to_be_bytes())
            .map_err(store_err)
    }

    // ── Scans ────────────────────────────────────────────────────────────────

    pub fn iter_participants(&self) -> Result<Vec<Participant>, MeshError> {
        decode_all(self.participants.iter())
    }

    pub fn iter_equivalents(&self) -> Result<Vec<Equivalent>, MeshError> {
        decode_all(self.equivalents.iter())
    }

    pub fn iter_trustlines(&self, equivalent: &str) -> Result<Vec<TrustLine>, MeshError> {
        decode_all(self.trustlines.scan_prefix(equivalent_prefix(equivalent)))
    }

    pub fn iter_all_trustlines(&self) -> Result<Vec<TrustLine>, MeshError> {
        decode_all(self.trustlines.iter())
    }

    pub fn iter_debts(&self, equivalent: &str) -> Result<Vec<Debt>, MeshError> {
        decode_all(self.debts.scan_prefix(equivalent_prefix(equivalent)))
    }

    pub fn iter_all_debts(&self) -> Result<Vec<Debt>, MeshError> {
        decode_all(self.debts.iter())
    }

    pub fn iter_transactions(&self) -> Result<Vec<TxRecord>, MeshError> {
        decode_all(self.transactions.iter())
    }

    // ── Event log ────────────────────────────────────────────────────────────

    /// Allocate the next durable event sequence number.
    pub fn next_event_seq(&self) -> Result<EventSeq, MeshError> {
        let _guard = self.seq_alloc.lock().unwrap_or_else(|e| e.into_inner());
        let current = self
            .get_meta("event_seq")?
            .map(|b| {
                let mut arr = [0u8; 8];
                arr.copy_from_slice(&b[..8]);
                u64::from_be_bytes(arr)
            })
            .unwrap_or(0);
        let next = current + 1;
        self.put_meta("event_seq", &next.to_be_bytes())?;
        Ok(next)
    }

    /// Append an event to the durable log under its assigned seq.
    pub fn append_event(&self, event: &Event) -> Result<(), MeshError> {
        let bytes = bincode::serialize(event).map_err(ser_err)?;
        self.events
            .insert(event.seq.to_be_bytes(), bytes)
            .map_err(store_err)?;
        Ok(())
    }

    /// Events with `seq > after`, ascending, up to `limit`.
    pub fn read_events_after(
        &self,
        after: EventSeq,
        limit: usize,
    ) -> Result<Vec<Event>, MeshError> {
        let mut out = Vec::new();
        for item in self.events.range((after + 1).to_be_bytes()..) {
            if out.len() >= limit {
                break;
            }
            let (_, bytes) = item.map_err(store_err)?;
            out.push(bincode::deserialize(&bytes).map_err(ser_err)?);
        }
        Ok(out)
    }

    // ── Meta ─────────────────────────────────────────────────────────────────

    pub fn put_meta(&self, key: &str, value: &[u8]) -> Result<(), MeshError> {
        self.meta.insert(key.as_bytes(), value).map_err(store_err)?;
        Ok(())
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>, MeshError> {
        self.meta
            .get(key.as_bytes())
            .map(|v| v.map(|iv| iv.to_vec()))
            .map_err(store_err)
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> Result<(), MeshError> {
        self._db.flush().map_err(store_err)?;
        Ok(())
    }
}

fn decode_opt<T: for<'de> Deserialize<'de>>(
    bytes: Option<sled::IVec>,
) -> Result<Option<T>, MeshError> {
    match bytes {
        Some(b) => Ok(Some(bincode::deserialize(&b).map_err(ser_err)?)),
        None => Ok(None),
    }
}

fn decode_all<T: for<'de> Deserialize<'de>>(
    iter: impl Iterator<Item = Result<(sled::IVec, sled::IVec), sled::Error>>,
) -> Result<Vec<T>, MeshError> {
    let mut out = Vec::new();
    for item in iter {
        let (_, bytes) = item.map_err(store_err)?;
        out.push(bincode::deserialize(&bytes).map_err(ser_err)?);
    }
    Ok(out)
}
