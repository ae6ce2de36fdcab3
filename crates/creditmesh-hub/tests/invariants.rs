//! Property checks over randomized workloads: whatever mix of payments,
//! clearing, and drift a run produces, every committed state must satisfy
//! the capacity and dual-consistency invariants.
//!
//! Run with:
//!   cargo test -p creditmesh-hub --test invariants

use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use creditmesh_core::scenario::{
    DriftConfig, EquivalentDef, ParticipantDef, Scenario, ScheduledPayment, TrustLineDef,
};
use creditmesh_core::types::Pid;
use creditmesh_hub::{HubConfig, Orchestrator};
use creditmesh_store::Store;

const NOW: i64 = 1_700_000_000;

fn pid(n: u8) -> Pid {
    Pid::from_bytes([n; 32])
}

fn b58(n: u8) -> String {
    pid(n).to_b58()
}

fn temp_store(name: &str) -> Arc<Store> {
    let dir = std::env::temp_dir().join(format!("creditmesh_invariants_test_{name}"));
    let _ = std::fs::remove_dir_all(&dir);
    Arc::new(Store::open(&dir).expect("open temp store"))
}

/// P1: 0 <= used <= limit. P2: every active-or-frozen line's paired debt
/// equals its `used` (a missing debt record counts as zero).
fn assert_invariants(store: &Store) {
    let snapshot = store.snapshot(None).unwrap();
    let mut debts: HashMap<(Pid, Pid, String), u128> = HashMap::new();
    for d in &snapshot.debts {
        debts.insert((d.debtor, d.creditor, d.equivalent.clone()), d.amount);
    }
    for tl in &snapshot.trustlines {
        assert!(
            tl.used <= tl.limit,
            "capacity violated on {} -> {}: used {} limit {}",
            tl.from,
            tl.to,
            tl.used,
            tl.limit
        );
        let paired = debts
            .get(&(tl.to, tl.from, tl.equivalent.clone()))
            .copied()
            .unwrap_or(0);
        assert_eq!(
            paired, tl.used,
            "dual view diverged on {} -> {}",
            tl.from, tl.to
        );
    }
    // Every debt edge is backed by the opposite-direction trust line.
    for d in &snapshot.debts {
        assert!(
            snapshot
                .trustlines
                .iter()
                .any(|tl| tl.from == d.creditor && tl.to == d.debtor
                    && tl.equivalent == d.equivalent),
            "orphan debt {} -> {}",
            d.debtor,
            d.creditor
        );
    }
}

#[test]
fn random_payment_storm_preserves_invariants() {
    let mut rng = StdRng::seed_from_u64(0xC0FFEE);
    let participants: Vec<u8> = (1..=8).collect();

    // A ring of trust lines plus random chords.
    let mut trustlines = Vec::new();
    for i in 0..8u8 {
        trustlines.push(TrustLineDef {
            from: b58(participants[i as usize]),
            to: b58(participants[((i + 1) % 8) as usize]),
            equivalent: "UAH".into(),
            limit: format!("{}.00", 200 + rng.gen_range(0..800)),
        });
    }
    for _ in 0..6 {
        let a = rng.gen_range(1..=8u8);
        let b = rng.gen_range(1..=8u8);
        if a == b || trustlines.iter().any(|t| t.from == b58(a) && t.to == b58(b)) {
            continue;
        }
        trustlines.push(TrustLineDef {
            from: b58(a),
            to: b58(b),
            equivalent: "UAH".into(),
            limit: format!("{}.00", 100 + rng.gen_range(0..400)),
        });
    }

    // Random payments spread over ten ticks. Many will fail (NoPath,
    // InsufficientCapacity) — partial failure is the norm.
    let mut payments = Vec::new();
    for i in 0..60 {
        let from = rng.gen_range(1..=8u8);
        let mut to = rng.gen_range(1..=8u8);
        if to == from {
            to = if to == 8 { 1 } else { to + 1 };
        }
        payments.push(ScheduledPayment {
            at_tick: i % 10,
            tx_id: format!("storm-{i}"),
            from: b58(from),
            to: b58(to),
            equivalent: "UAH".into(),
            amount: format!("{}.00", 1 + rng.gen_range(0..150)),
        });
    }

    let scenario = Scenario {
        equivalents: vec![EquivalentDef {
            code: "UAH".into(),
            precision: 2,
        }],
        participants: participants
            .iter()
            .map(|n| ParticipantDef {
                pid: Some(b58(*n)),
                public_key_hex: None,
                display_name: format!("p{n}"),
                kind: "person".into(),
            })
            .collect(),
        trustlines,
        // Aggressive drift so growth and decay both run during the storm.
        drift: Some(DriftConfig {
            growth_threshold_atoms: 1,
            growth_cooldown_secs: 0,
            decay_bp: 9_500,
            idle_secs: 1,
            limit_min_atoms: 100,
            ..DriftConfig::default()
        }),
        payments,
        ..Scenario::default()
    };

    let store = temp_store("storm");
    let mut hub = Orchestrator::new(Arc::clone(&store), scenario, HubConfig::default(), NOW)
        .expect("build hub");

    assert_invariants(&store);
    for tick in 0..12 {
        hub.run_tick(NOW + tick * 3600).unwrap();
        assert_invariants(&store);
    }

    // The storm must have actually exercised the engines.
    let committed = creditmesh_engine::HubMetrics::get(&hub.metrics.payments_committed);
    assert!(committed > 0, "no payment committed in the storm");
}
