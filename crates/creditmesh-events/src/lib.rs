pub mod bus;
pub mod patch;

pub use bus::{EventBus, Subscription};
pub use patch::{edge_ref, node_entry, node_patch, PatchBuilder};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use creditmesh_core::event::{EventKind, EventPayload, RunStatusPayload};
    use creditmesh_core::types::{Pid, TrustLine};
    use creditmesh_store::Store;

    fn temp_store(name: &str) -> Arc<Store> {
        let dir = std::env::temp_dir().join(format!("creditmesh_events_test_{name}"));
        let _ = std::fs::remove_dir_all(&dir);
        Arc::new(Store::open(&dir).expect("open temp store"))
    }

    fn pid(n: u8) -> Pid {
        Pid::from_bytes([n; 32])
    }

    fn run_status(state: &str) -> EventPayload {
        EventPayload::RunStatus(RunStatusPayload {
            state: state.into(),
        })
    }

    #[test]
    fn publish_assigns_increasing_seq() {
        let bus = EventBus::new(temp_store("seq"));
        let sub = bus.subscribe(None).unwrap();
        let e1 = bus.publish(10, EventKind::RunStatus, run_status("running")).unwrap();
        let e2 = bus.publish(11, EventKind::RunStatus, run_status("paused")).unwrap();
        assert!(e2.seq > e1.seq);
        let drained = sub.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].seq, e1.seq);
        assert_eq!(drained[1].seq, e2.seq);
    }

    #[test]
    fn replay_from_last_seen_seq() {
        let store = temp_store("bus_replay");
        let bus = EventBus::new(Arc::clone(&store));
        for i in 0..4 {
            bus.publish(i, EventKind::RunStatus, run_status("running"))
                .unwrap();
        }
        let sub = bus.subscribe(Some(2)).unwrap();
        let seqs: Vec<u64> = sub.drain().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4]);

        // Live events keep flowing after the replayed backlog.
        bus.publish(9, EventKind::RunStatus, run_status("paused"))
            .unwrap();
        assert_eq!(sub.try_next().unwrap().seq, 5);
    }

    #[test]
    fn overflow_disconnects_with_lost_sentinel() {
        let store = temp_store("bus_overflow");
        let bus = EventBus::with_capacity(Arc::clone(&store), 2);
        let sub = bus.subscribe(None).unwrap();
        for i in 0..5 {
            bus.publish(i, EventKind::RunStatus, run_status("running"))
                .unwrap();
        }
        let drained = sub.drain();
        // Two queued events plus the sentinel.
        assert_eq!(drained.len(), 3);
        let sentinel = drained.last().unwrap();
        assert_eq!(sentinel.kind, EventKind::Lost);
        match &sentinel.payload {
            EventPayload::Lost(p) => assert_eq!(p.last_seen_seq, 2),
            other => panic!("unexpected payload {other:?}"),
        }

        // The slot was dropped: later events don't reach this subscriber.
        bus.publish(9, EventKind::RunStatus, run_status("running"))
            .unwrap();
        assert!(sub.try_next().is_none());

        // Resync hands back a snapshot and a live subscription.
        let (snapshot, live) = bus.resync().unwrap();
        assert!(snapshot.trustlines.is_empty());
        bus.publish(10, EventKind::RunStatus, run_status("running"))
            .unwrap();
        assert!(live.try_next().is_some());
    }

    fn seed_equivalent(store: &Store, code: &str, precision: u32) {
        let mut session = store.session();
        session
            .put_equivalent(&creditmesh_core::types::Equivalent {
                code: code.into(),
                precision,
                created_at: 0,
            })
            .unwrap();
        session.commit().unwrap();
    }

    #[test]
    fn scoped_patch_carries_only_given_edges() {
        let store = temp_store("patch_scoped");
        seed_equivalent(&store, "UAH", 2);
        let mut session = store.session();
        let mut tl = TrustLine::new(pid(1), pid(2), "UAH".into(), 100_000, 0);
        tl.used = 25_000;
        session.put_trustline(&tl).unwrap();
        session
            .put_trustline(&TrustLine::new(pid(2), pid(3), "UAH".into(), 50_000, 0))
            .unwrap();
        session.commit().unwrap();

        let builder = PatchBuilder::new();
        let patch = builder.scoped(&store, &[tl]).unwrap().unwrap();
        assert_eq!(patch.edges.len(), 1);
        let entry = &patch.edges[0];
        assert_eq!(entry.limit, "1000.00");
        assert_eq!(entry.used, "250.00");
        assert_eq!(entry.available, "750.00");
        assert_eq!(entry.from, pid(1).to_b58());
    }

    #[test]
    fn empty_scoped_patch_is_none() {
        let store = temp_store("patch_empty");
        let builder = PatchBuilder::new();
        assert!(builder.scoped(&store, &[]).unwrap().is_none());
    }

    #[test]
    fn full_equivalent_patch_lists_every_edge() {
        let store = temp_store("patch_full");
        seed_equivalent(&store, "UAH", 2);
        let mut session = store.session();
        session
            .put_trustline(&TrustLine::new(pid(1), pid(2), "UAH".into(), 10_000, 0))
            .unwrap();
        session
            .put_trustline(&TrustLine::new(pid(2), pid(3), "UAH".into(), 20_000, 0))
            .unwrap();
        session.commit().unwrap();

        let builder = PatchBuilder::new();
        let patch = builder.full_equivalent(&store, "UAH").unwrap().unwrap();
        assert_eq!(patch.edges.len(), 2);
        assert!(builder.full_equivalent(&store, "EUR").unwrap().is_none());
    }
}
