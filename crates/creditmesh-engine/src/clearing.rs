//! Debt-cycle clearing: find closed directed cycles in the debt graph and
//! cancel the common minimum amount along each, shrinking total nominal
//! debt without moving value.
//!
//! Enumeration is a bounded DFS from each seed node in ascending PID
//! order, restricted to nodes above the seed, so every simple cycle is
//! produced exactly once already in its canonical rotation (smallest PID
//! first). Candidates are processed in ascending (length, canonical key)
//! order: when cycles share an edge, the first to commit claims the
//! residual and later ones drop out as stale, and the order makes that
//! outcome reproducible.
//!
//! The engine runs on its own session, one store transaction per cycle,
//! concurrent with the payment session. A cycle that loses a lock race or
//! whose debt moved between enumeration and lock acquisition is skipped,
//! surfacing only in metrics.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use creditmesh_core::amount::format_amount;
use creditmesh_core::error::MeshError;
use creditmesh_core::event::{
    ClearingDonePayload, EventKind, EventPayload, TopologyChangedPayload, TxUpdatedPayload,
};
use creditmesh_core::scenario::ClearingConfig;
use creditmesh_core::types::{
    Atoms, Debt, Equivalent, LockKey, Pid, Tick, Timestamp, TrustLine, TxPayload, TxRecord,
    TxState, TxType,
};
use creditmesh_events::{edge_ref, PatchBuilder};
use creditmesh_store::Store;

use crate::drift::TrustDriftEngine;
use crate::invalidate::CacheInvalidator;
use crate::metrics::HubMetrics;
use crate::PendingEvent;

// ── Cycle enumeration ────────────────────────────────────────────────────────

/// One candidate cycle: `nodes[i]` owes `nodes[i+1]` (ring). `amounts`
/// are the debts observed at enumeration time, used to detect staleness.
#[derive(Clone, Debug, PartialEq)]
pub struct Cycle {
    pub nodes: Vec<Pid>,
    pub amounts: Vec<Atoms>,
}

impl Cycle {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The cancellable amount: minimum debt on the ring.
    pub fn min_amount(&self) -> Atoms {
        self.amounts.iter().copied().min().unwrap_or(0)
    }

    /// Canonical ordering key (the node ring, smallest PID first by
    /// construction).
    pub fn key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.nodes.len() * 32);
        for node in &self.nodes {
            key.extend_from_slice(node.as_bytes());
        }
        key
    }

    /// Ring edges flipped to TrustLine direction (creditor → debtor):
    /// the debt `d → c` lives on the TrustLine `c → d`.
    pub fn trustline_edges(&self) -> Vec<(Pid, Pid)> {
        let n = self.nodes.len();
        (0..n)
            .map(|i| (self.nodes[(i + 1) % n], self.nodes[i]))
            .collect()
    }
}

/// Enumerate simple directed cycles of 2..=`len_max` edges in the debt
/// graph, deduplicated by canonical rotation, sorted ascending by
/// (length, key).
pub fn enumerate_cycles(debts: &[Debt], len_max: usize) -> Vec<Cycle> {
    let mut adjacency: BTreeMap<Pid, Vec<(Pid, Atoms)>> = BTreeMap::new();
    for debt in debts {
        if debt.amount == 0 {
            continue;
        }
        adjacency
            .entry(debt.debtor)
            .or_default()
            .push((debt.creditor, debt.amount));
    }
    for next in adjacency.values_mut() {
        next.sort_by_key(|(creditor, _)| *creditor);
    }

    let seeds: Vec<Pid> = adjacency.keys().copied().collect();
    let mut found = Vec::new();
    for seed in seeds {
        let mut path = vec![seed];
        let mut amounts = Vec::new();
        walk(&adjacency, seed, seed, &mut path, &mut amounts, len_max, &mut found);
    }
    found.sort_by(|a, b| (a.len(), a.key()).cmp(&(b.len(), b.key())));
    found
}

fn walk(
    adjacency: &BTreeMap<Pid, Vec<(Pid, Atoms)>>,
    seed: Pid,
    node: Pid,
    path: &mut Vec<Pid>,
    amounts: &mut Vec<Atoms>,
    len_max: usize,
    found: &mut Vec<Cycle>,
) {
    let Some(next_hops) = adjacency.get(&node) else {
        return;
    };
    for (next, amount) in next_hops {
        if *next == seed {
            if path.len() >= 2 {
                let mut cycle_amounts = amounts.clone();
                cycle_amounts.push(*amount);
                found.push(Cycle {
                    nodes: path.clone(),
                    amounts: cycle_amounts,
                });
            }
            continue;
        }
        // Restricting the walk to nodes above the seed makes the smallest
        // node the unique starting point of every cycle found.
        if *next < seed || path.contains(next) || path.len() >= len_max {
            continue;
        }
        path.push(*next);
        amounts.push(*amount);
        walk(adjacency, seed, *next, path, amounts, len_max, found);
        path.pop();
        amounts.pop();
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ClearingOutcome {
    pub cleared_cycles: u32,
    pub touched_equivalents: BTreeSet<String>,
}

enum CycleResult {
    Cleared { grew: bool },
    SkippedConflict,
    SkippedStale,
}

pub struct ClearingEngine {
    pub config: ClearingConfig,
}

impl ClearingEngine {
    pub fn new(config: ClearingConfig) -> Self {
        Self { config }
    }

    /// One clearing run over every equivalent. Stops at
    /// `max_cycles_per_run` attempts or the time budget, whichever comes
    /// first; the deadline is only checked between cycles, never inside a
    /// locked section.
    #[allow(clippy::too_many_arguments)]
    pub fn run(
        &self,
        store: &Store,
        drift: &TrustDriftEngine,
        patches: &PatchBuilder,
        invalidator: &CacheInvalidator,
        metrics: &HubMetrics,
        events: &mut Vec<PendingEvent>,
        tick: Tick,
        now: Timestamp,
    ) -> Result<ClearingOutcome, MeshError> {
        let deep = tick > 0 && tick % self.config.deep_every_n_ticks == 0;
        let len_max = if deep {
            self.config.deep_cycle_len_max
        } else {
            self.config.cycle_len_max
        };
        let deadline = Instant::now() + Duration::from_millis(self.config.time_budget_ms);
        let mut outcome = ClearingOutcome::default();
        let mut attempts = 0usize;

        let mut equivalents = store.db.iter_equivalents()?;
        equivalents.sort_by(|a, b| a.code.cmp(&b.code));

        'run: for equivalent in &equivalents {
            let debts: Vec<Debt> = store
                .db
                .iter_debts(&equivalent.code)?
                .into_iter()
                .filter(|d| d.amount > 0)
                .collect();
            let cycles = enumerate_cycles(&debts, len_max);
            for cycle in cycles {
                if attempts >= self.config.max_cycles_per_run || Instant::now() > deadline {
                    break 'run;
                }
                attempts += 1;
                match self.apply_cycle(
                    store,
                    drift,
                    patches,
                    metrics,
                    events,
                    equivalent,
                    &cycle,
                    tick,
                    now,
                    outcome.cleared_cycles,
                )? {
                    CycleResult::Cleared { grew } => {
                        outcome.cleared_cycles += 1;
                        outcome.touched_equivalents.insert(equivalent.code.clone());
                        HubMetrics::incr(&metrics.cycles_cleared);
                        if grew {
                            HubMetrics::incr(&metrics.growth_updates);
                        }
                    }
                    CycleResult::SkippedConflict => {
                        HubMetrics::incr(&metrics.cycles_skipped_conflict);
                    }
                    CycleResult::SkippedStale => {
                        HubMetrics::incr(&metrics.cycles_skipped_stale);
                    }
                }
            }
        }

        invalidator.invalidate(&outcome.touched_equivalents);
        if outcome.cleared_cycles > 0 {
            info!(
                tick,
                cycles = outcome.cleared_cycles,
                deep,
                "clearing run finished"
            );
        }
        Ok(outcome)
    }

    /// Clear one cycle in its own store transaction: lock the ring in
    /// canonical order, re-verify the enumerated amounts under the locks,
    /// decrement each Debt and its paired TrustLine together, run the
    /// growth hook, commit, then emit events.
    #[allow(clippy::too_many_arguments)]
    fn apply_cycle(
        &self,
        store: &Store,
        drift: &TrustDriftEngine,
        patches: &PatchBuilder,
        _metrics: &HubMetrics,
        events: &mut Vec<PendingEvent>,
        equivalent: &Equivalent,
        cycle: &Cycle,
        tick: Tick,
        now: Timestamp,
        cleared_before: u32,
    ) -> Result<CycleResult, MeshError> {
        let mut session = store.session();
        let tl_edges = cycle.trustline_edges();
        let keys: Vec<LockKey> = tl_edges
            .iter()
            .map(|(from, to)| LockKey::edge(&equivalent.code, *from, *to))
            .collect();
        // Each cycle is its own transaction with its own lock scope.
        let owner = store.new_lock_owner();
        let _guard = match store.lock_edges(owner, keys) {
            Ok(g) => g,
            Err(MeshError::Conflict(_)) => return Ok(CycleResult::SkippedConflict),
            Err(e) => return Err(e),
        };

        // Re-read under the locks; any moved edge invalidates the cycle.
        let n = cycle.len();
        let mut ring: Vec<(Debt, TrustLine)> = Vec::with_capacity(n);
        for i in 0..n {
            let debtor = cycle.nodes[i];
            let creditor = cycle.nodes[(i + 1) % n];
            let Some(debt) = session.get_debt(&equivalent.code, &debtor, &creditor)? else {
                return Ok(CycleResult::SkippedStale);
            };
            if debt.amount != cycle.amounts[i] {
                return Ok(CycleResult::SkippedStale);
            }
            let Some(line) = session.get_trustline(&equivalent.code, &creditor, &debtor)? else {
                return Ok(CycleResult::SkippedStale);
            };
            ring.push((debt, line));
        }
        let cleared = ring.iter().map(|(d, _)| d.amount).min().unwrap_or(0);
        if cleared == 0 {
            return Ok(CycleResult::SkippedStale);
        }

        let mut lines: Vec<TrustLine> = Vec::with_capacity(n);
        for (mut debt, mut line) in ring {
            if line.used < cleared {
                // Dual-view mismatch would break I2; treat as stale rather
                // than committing a corrupt decrement.
                return Ok(CycleResult::SkippedStale);
            }
            debt.amount -= cleared;
            debt.updated_at = now;
            session.put_debt(&debt)?;
            line.used -= cleared;
            line.last_active_at = now;
            session.put_trustline(&line)?;
            lines.push(line);
        }

        let mut record = TxRecord {
            tx_id: format!("clr-{}-{}-{}", equivalent.code, tick, cleared_before),
            tx_type: TxType::Clearing,
            initiator: cycle.nodes[0],
            payload: TxPayload::Clearing {
                equivalent: equivalent.code.clone(),
                cycle: tl_edges.clone(),
                amount: cleared,
            },
            state: TxState::Pending,
            error: None,
            payload_hash: None,
            created_at: now,
            finished_at: None,
        };
        for state in [TxState::Preparing, TxState::Prepared, TxState::Committed] {
            debug_assert!(record.state.can_become(state));
            record.state = state;
        }
        record.finished_at = Some(now);
        session.put_transaction(&record)?;

        // Growth runs inside the cycle's transaction, under its locks.
        let grown = drift.on_cycle_cleared(&mut session, &equivalent.code, &tl_edges, cleared, now)?;
        for g in &grown {
            if let Some(line) = lines.iter_mut().find(|l| l.from == g.from && l.to == g.to) {
                *line = g.clone();
            }
        }
        session.commit()?;
        debug!(
            equivalent = %equivalent.code,
            len = n,
            amount = cleared,
            "cycle cleared"
        );

        let edges = patches
            .scoped(store, &lines)?
            .map(|p| p.edges)
            .unwrap_or_default();
        events.push((
            EventKind::TxUpdated,
            EventPayload::TxUpdated(TxUpdatedPayload {
                tx_id: record.tx_id.clone(),
                tx_type: TxType::Clearing.as_str().to_string(),
                state: TxState::Committed.as_str().to_string(),
                from: None,
                to: None,
                equivalent: equivalent.code.clone(),
                amount: format_amount(cleared, equivalent.precision),
                edges,
            }),
        ));
        events.push((
            EventKind::ClearingDone,
            EventPayload::ClearingDone(ClearingDonePayload {
                cycle_edges: tl_edges.iter().map(|(f, t)| edge_ref(f, t)).collect(),
                cleared_amount: format_amount(cleared, equivalent.precision),
                equivalent: equivalent.code.clone(),
                cleared_cycles: Some(cleared_before + 1),
            }),
        ));
        if !grown.is_empty() {
            if let Some(patch) = patches.full_equivalent(store, &equivalent.code)? {
                let mut payload = TopologyChangedPayload::with_reason("trust_growth");
                payload.edge_patch = Some(patch);
                events.push((EventKind::TopologyChanged, EventPayload::TopologyChanged(payload)));
            }
        }
        Ok(CycleResult::Cleared { grew: !grown.is_empty() })
    }
}
