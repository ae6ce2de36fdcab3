pub mod db;
pub mod lock;
pub mod session;

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use creditmesh_core::error::MeshError;
use creditmesh_core::types::{Debt, Equivalent, LockKey, Participant, TrustLine};

pub use db::{EdgeDriftState, StoreDb};
pub use lock::{LockGuard, LockOwner, LockTable};
pub use session::Session;

/// The authoritative ledger: sled persistence plus the in-process row-lock
/// table. Shared across the orchestrator, the clearing worker, and the
/// router's snapshot reads.
pub struct Store {
    pub db: StoreDb,
    locks: Arc<LockTable>,
}

/// Full-state view for `snapshot{equivalent?}` queries and resyncs.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HubSnapshot {
    pub participants: Vec<Participant>,
    pub equivalents: Vec<Equivalent>,
    pub trustlines: Vec<TrustLine>,
    pub debts: Vec<Debt>,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, MeshError> {
        Ok(Self {
            db: StoreDb::open(path)?,
            locks: LockTable::new(),
        })
    }

    /// Open a transactional session. The orchestrator holds one per tick;
    /// the clearing engine opens its own so the two proceed concurrently.
    pub fn session(&self) -> Session<'_> {
        Session::new(&self.db)
    }

    /// Allocate a lock owner for one transactional scope (a tick's outer
    /// session, one clearing cycle, one API call).
    pub fn new_lock_owner(&self) -> LockOwner {
        self.locks.new_owner()
    }

    /// Acquire row locks for a set of edges, canonical order, all or
    /// nothing. See [`lock::LockTable::acquire`].
    pub fn lock_edges(&self, owner: LockOwner, keys: Vec<LockKey>) -> Result<LockGuard, MeshError> {
        self.locks.acquire(owner, keys)
    }

    /// Committed-state snapshot, optionally scoped to one equivalent.
    pub fn snapshot(&self, equivalent: Option<&str>) -> Result<HubSnapshot, MeshError> {
        let (trustlines, debts) = match equivalent {
            Some(code) => (self.db.iter_trustlines(code)?, self.db.iter_debts(code)?),
            None => (self.db.iter_all_trustlines()?, self.db.iter_all_debts()?),
        };
        Ok(HubSnapshot {
            participants: self.db.iter_participants()?,
            equivalents: self.db.iter_equivalents()?,
            trustlines,
            debts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use creditmesh_core::event::{Event, EventKind, EventPayload, RunStatusPayload};
    use creditmesh_core::types::{Pid, TrustLine};

    fn temp_store(name: &str) -> Store {
        let dir = std::env::temp_dir().join(format!("creditmesh_store_test_{name}"));
        let _ = std::fs::remove_dir_all(&dir);
        Store::open(&dir).expect("open temp store")
    }

    fn pid(n: u8) -> Pid {
        Pid::from_bytes([n; 32])
    }

    fn tl(from: u8, to: u8, limit: u128) -> TrustLine {
        TrustLine::new(pid(from), pid(to), "UAH".into(), limit, 0)
    }

    #[test]
    fn session_reads_its_own_writes() {
        let store = temp_store("ryw");
        let mut session = store.session();
        session.put_trustline(&tl(1, 2, 1000)).unwrap();
        let read = session
            .get_trustline("UAH", &pid(1), &pid(2))
            .unwrap()
            .unwrap();
        assert_eq!(read.limit, 1000);
        // Not yet visible outside the session.
        assert!(store.db.get_trustline("UAH", &pid(1), &pid(2)).unwrap().is_none());
        session.commit().unwrap();
        assert!(store.db.get_trustline("UAH", &pid(1), &pid(2)).unwrap().is_some());
    }

    #[test]
    fn savepoint_rollback_discards_nested_writes() {
        let store = temp_store("savepoint");
        let mut session = store.session();
        session.put_trustline(&tl(1, 2, 1000)).unwrap();

        session.savepoint();
        session.put_trustline(&tl(1, 2, 555)).unwrap();
        session.put_trustline(&tl(2, 3, 700)).unwrap();
        session.rollback_savepoint().unwrap();

        let kept = session
            .get_trustline("UAH", &pid(1), &pid(2))
            .unwrap()
            .unwrap();
        assert_eq!(kept.limit, 1000);
        assert!(session.get_trustline("UAH", &pid(2), &pid(3)).unwrap().is_none());

        session.commit().unwrap();
        assert!(store.db.get_trustline("UAH", &pid(2), &pid(3)).unwrap().is_none());
    }

    #[test]
    fn savepoint_release_folds_writes_in() {
        let store = temp_store("release");
        let mut session = store.session();
        session.savepoint();
        session.put_trustline(&tl(1, 2, 300)).unwrap();
        session.release_savepoint().unwrap();
        assert_eq!(session.savepoint_depth(), 0);
        session.commit().unwrap();
        assert_eq!(
            store
                .db
                .get_trustline("UAH", &pid(1), &pid(2))
                .unwrap()
                .unwrap()
                .limit,
            300
        );
    }

    #[test]
    fn rollback_without_savepoint_is_an_error() {
        let store = temp_store("no_sp");
        let mut session = store.session();
        assert!(session.rollback_savepoint().is_err());
        assert!(session.release_savepoint().is_err());
    }

    #[test]
    fn iter_trustlines_overlays_staged_state() {
        let store = temp_store("overlay");
        let mut setup = store.session();
        setup.put_trustline(&tl(1, 2, 100)).unwrap();
        setup.commit().unwrap();

        let mut session = store.session();
        session.put_trustline(&tl(1, 2, 999)).unwrap();
        session.put_trustline(&tl(3, 4, 50)).unwrap();
        let lines = session.iter_trustlines("UAH").unwrap();
        assert_eq!(lines.len(), 2);
        let updated = lines.iter().find(|t| t.from == pid(1)).unwrap();
        assert_eq!(updated.limit, 999);
    }

    #[test]
    fn event_seq_is_monotonic_and_durable() {
        let store = temp_store("seq");
        let first = store.db.next_event_seq().unwrap();
        let second = store.db.next_event_seq().unwrap();
        assert_eq!(second, first + 1);
    }

    #[test]
    fn event_log_replays_after_seq() {
        let store = temp_store("replay");
        for i in 1..=5u64 {
            let seq = store.db.next_event_seq().unwrap();
            assert_eq!(seq, i);
            store
                .db
                .append_event(&Event {
                    seq,
                    ts: 100 + i as i64,
                    kind: EventKind::RunStatus,
                    payload: EventPayload::RunStatus(RunStatusPayload {
                        state: "running".into(),
                    }),
                })
                .unwrap();
        }
        let tail = store.db.read_events_after(3, 10).unwrap();
        assert_eq!(tail.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![4, 5]);
        let capped = store.db.read_events_after(0, 2).unwrap();
        assert_eq!(capped.len(), 2);
    }

    #[test]
    fn scenario_fired_markers_persist() {
        let store = temp_store("fired");
        let mut session = store.session();
        assert!(!session.is_fired(7).unwrap());
        session.mark_fired(7);
        assert!(session.is_fired(7).unwrap());
        session.commit().unwrap();
        assert!(store.db.is_fired(7).unwrap());
        assert!(!store.db.is_fired(8).unwrap());
    }

    #[test]
    fn snapshot_scopes_to_equivalent() {
        let store = temp_store("snapshot");
        let mut session = store.session();
        session.put_trustline(&tl(1, 2, 100)).unwrap();
        let mut other = tl(1, 2, 100);
        other.equivalent = "HOUR_DEV".into();
        session.put_trustline(&other).unwrap();
        session.commit().unwrap();

        let scoped = store.snapshot(Some("UAH")).unwrap();
        assert_eq!(scoped.trustlines.len(), 1);
        let full = store.snapshot(None).unwrap();
        assert_eq!(full.trustlines.len(), 2);
    }
}
