//! Trust drift: two opposing processes that slowly reshape the trust
//! graph from usage history. Growth rewards edges that keep clearing
//! debt; decay shrinks limits nobody uses. Both are integer-exact
//! (basis-point factors), ignore frozen and closed lines, and never
//! violate `used <= limit`.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use creditmesh_core::error::MeshError;
use creditmesh_core::scenario::DriftConfig;
use creditmesh_core::types::{Atoms, LockKey, Pid, Timestamp, TrustLine};
use creditmesh_store::{LockGuard, LockOwner, Session, Store};

use crate::metrics::HubMetrics;

const BP_SCALE: u128 = 10_000;

pub struct TrustDriftEngine {
    pub config: DriftConfig,
}

/// What a decay pass touched, per equivalent. Drives cache invalidation
/// and patch emission: an equivalent with no touched edges gets neither.
#[derive(Debug, Default)]
pub struct DriftDecayOutcome {
    pub updated_count: usize,
    pub touched_equivalents: BTreeSet<String>,
    pub touched_edges_by_eq: BTreeMap<String, Vec<TrustLine>>,
}

impl TrustDriftEngine {
    pub fn new(config: DriftConfig) -> Self {
        Self { config }
    }

    /// Growth hook, called by the clearing engine for each committed cycle
    /// while it still holds the cycle's edge locks. `edges` are in
    /// TrustLine direction. Returns the lines whose limit grew.
    pub fn on_cycle_cleared(
        &self,
        session: &mut Session<'_>,
        equivalent: &str,
        edges: &[(Pid, Pid)],
        cleared: Atoms,
        now: Timestamp,
    ) -> Result<Vec<TrustLine>, MeshError> {
        let mut grown = Vec::new();
        for (from, to) in edges {
            let mut state = session
                .get_drift_state(equivalent, from, to)?
                .unwrap_or_default();
            if now - state.window_start > self.config.growth_window_secs {
                state.window_start = now;
                state.cleared_in_window = 0;
            }
            state.cleared_in_window += cleared;
            state.last_cleared_at = now;

            let qualifies = state.cleared_in_window >= self.config.growth_threshold_atoms as Atoms
                && now - state.last_growth_at >= self.config.growth_cooldown_secs;
            if qualifies {
                if let Some(mut tl) = session.get_trustline(equivalent, from, to)? {
                    if tl.is_active() {
                        let mut new_limit = tl.limit * self.config.growth_bp as u128 / BP_SCALE;
                        if let Some(cap) = self.config.limit_max_atoms {
                            new_limit = new_limit.min(cap as Atoms);
                        }
                        if new_limit > tl.limit {
                            tl.limit = new_limit;
                            session.put_trustline(&tl)?;
                            state.last_growth_at = now;
                            debug!(equivalent, %from, %to, limit = tl.limit, "trust limit grew");
                            grown.push(tl);
                        }
                    }
                }
            }
            session.put_drift_state(equivalent, from, to, &state)?;
        }
        Ok(grown)
    }

    /// Per-tick decay: every active line with `used == 0` for longer than
    /// the idle threshold shrinks toward the floor `max(used, limit_min)`.
    /// Each edge is its own logical operation: a busy lock skips the edge
    /// into metrics and the next tick retries. Locks for decayed edges are
    /// appended to `guards` and held until the session commits.
    pub fn decay(
        &self,
        store: &Store,
        session: &mut Session<'_>,
        owner: LockOwner,
        guards: &mut Vec<LockGuard>,
        metrics: &HubMetrics,
        now: Timestamp,
    ) -> Result<DriftDecayOutcome, MeshError> {
        let mut outcome = DriftDecayOutcome::default();
        if self.config.decay_bp >= BP_SCALE as u32 {
            return Ok(outcome);
        }
        let mut equivalents = store.db.iter_equivalents()?;
        equivalents.sort_by(|a, b| a.code.cmp(&b.code));

        for equivalent in &equivalents {
            let mut lines = session.iter_trustlines(&equivalent.code)?;
            lines.sort_by(|a, b| (a.from, a.to).cmp(&(b.from, b.to)));
            for mut tl in lines {
                if !tl.is_active() || tl.used != 0 {
                    continue;
                }
                if now - tl.last_active_at < self.config.idle_secs {
                    continue;
                }
                let floor = tl.used.max(self.config.limit_min_atoms as Atoms);
                if tl.limit <= floor {
                    continue;
                }
                let guard = store.lock_edges(
                    owner,
                    vec![LockKey::edge(&equivalent.code, tl.from, tl.to)],
                );
                let Ok(guard) = guard else {
                    HubMetrics::incr(&metrics.decay_skipped_conflict);
                    continue;
                };
                // Re-read under the lock; clearing may have moved `used`.
                let Some(fresh) = session.get_trustline(&equivalent.code, &tl.from, &tl.to)?
                else {
                    continue;
                };
                tl = fresh;
                if !tl.is_active() || tl.used != 0 {
                    continue;
                }
                let decayed = tl.limit * self.config.decay_bp as u128 / BP_SCALE;
                let new_limit = decayed.max(floor).max(tl.used);
                if new_limit >= tl.limit {
                    continue;
                }
                tl.limit = new_limit;
                session.put_trustline(&tl)?;
                guards.push(guard);
                outcome.updated_count += 1;
                outcome.touched_equivalents.insert(equivalent.code.clone());
                outcome
                    .touched_edges_by_eq
                    .entry(equivalent.code.clone())
                    .or_default()
                    .push(tl);
            }
        }
        if outcome.updated_count > 0 {
            debug!(updated = outcome.updated_count, "trust decay pass");
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use creditmesh_core::types::Equivalent;

    const NOW: Timestamp = 1_700_000_000;
    const DAY: i64 = 24 * 3600;

    fn temp_store(name: &str) -> Store {
        let dir = std::env::temp_dir().join(format!("creditmesh_drift_test_{name}"));
        let _ = std::fs::remove_dir_all(&dir);
        Store::open(&dir).expect("open temp store")
    }

    fn pid(n: u8) -> Pid {
        Pid::from_bytes([n; 32])
    }

    fn seed_line(store: &Store, limit: u128, used: u128, last_active_at: Timestamp) {
        let mut session = store.session();
        session
            .put_equivalent(&Equivalent {
                code: "UAH".into(),
                precision: 0,
                created_at: 0,
            })
            .unwrap();
        let mut tl = TrustLine::new(pid(1), pid(2), "UAH".into(), limit, 0);
        tl.used = used;
        tl.last_active_at = last_active_at;
        session.put_trustline(&tl).unwrap();
        session.commit().unwrap();
    }

    fn config() -> DriftConfig {
        DriftConfig {
            decay_bp: 9_000,
            idle_secs: 30 * DAY,
            limit_min_atoms: 100,
            growth_bp: 11_000,
            growth_threshold_atoms: 50,
            growth_window_secs: 7 * DAY,
            growth_cooldown_secs: 0,
            limit_max_atoms: None,
        }
    }

    #[test]
    fn decay_shrinks_idle_line_by_factor() {
        let store = temp_store("decay_step");
        seed_line(&store, 1_000, 0, NOW - 31 * DAY);
        let engine = TrustDriftEngine::new(config());
        let metrics = HubMetrics::default();

        let mut session = store.session();
        let outcome = engine.decay(&store, &mut session, store.new_lock_owner(), &mut Vec::new(), &metrics, NOW).unwrap();
        session.commit().unwrap();

        assert_eq!(outcome.updated_count, 1);
        assert!(outcome.touched_equivalents.contains("UAH"));
        let tl = store.db.get_trustline("UAH", &pid(1), &pid(2)).unwrap().unwrap();
        assert_eq!(tl.limit, 900);
        assert_eq!(tl.used, 0);
    }

    #[test]
    fn decay_settles_at_limit_min() {
        let store = temp_store("decay_floor");
        seed_line(&store, 1_000, 0, NOW - 31 * DAY);
        let engine = TrustDriftEngine::new(config());
        let metrics = HubMetrics::default();

        for _ in 0..60 {
            let mut session = store.session();
            engine.decay(&store, &mut session, store.new_lock_owner(), &mut Vec::new(), &metrics, NOW).unwrap();
            session.commit().unwrap();
        }
        let tl = store.db.get_trustline("UAH", &pid(1), &pid(2)).unwrap().unwrap();
        assert_eq!(tl.limit, 100);

        // Once at the floor nothing is touched, so nothing is reported.
        let mut session = store.session();
        let outcome = engine.decay(&store, &mut session, store.new_lock_owner(), &mut Vec::new(), &metrics, NOW).unwrap();
        assert_eq!(outcome.updated_count, 0);
        assert!(outcome.touched_equivalents.is_empty());
    }

    #[test]
    fn decay_ignores_busy_and_recent_lines() {
        let store = temp_store("decay_skip");
        seed_line(&store, 1_000, 250, NOW - 31 * DAY);
        let engine = TrustDriftEngine::new(config());
        let metrics = HubMetrics::default();
        let mut session = store.session();
        let outcome = engine.decay(&store, &mut session, store.new_lock_owner(), &mut Vec::new(), &metrics, NOW).unwrap();
        assert_eq!(outcome.updated_count, 0);

        let store2 = temp_store("decay_recent");
        seed_line(&store2, 1_000, 0, NOW - DAY);
        let mut session2 = store2.session();
        let outcome2 = engine.decay(&store2, &mut session2, store2.new_lock_owner(), &mut Vec::new(), &metrics, NOW).unwrap();
        assert_eq!(outcome2.updated_count, 0);
    }

    #[test]
    fn decay_never_cuts_below_used() {
        let store = temp_store("decay_clamp");
        // limit_min below used: the floor is `used`, never less.
        let mut cfg = config();
        cfg.limit_min_atoms = 0;
        seed_line(&store, 1_000, 0, NOW - 31 * DAY);
        let engine = TrustDriftEngine::new(cfg);
        let metrics = HubMetrics::default();
        for _ in 0..200 {
            let mut session = store.session();
            engine.decay(&store, &mut session, store.new_lock_owner(), &mut Vec::new(), &metrics, NOW).unwrap();
            session.commit().unwrap();
        }
        let tl = store.db.get_trustline("UAH", &pid(1), &pid(2)).unwrap().unwrap();
        assert!(tl.limit >= tl.used);
    }

    #[test]
    fn decay_skips_locked_edge_into_metrics() {
        let store = temp_store("decay_conflict");
        seed_line(&store, 1_000, 0, NOW - 31 * DAY);
        let engine = TrustDriftEngine::new(config());
        let metrics = HubMetrics::default();

        let _guard = store
            .lock_edges(
                store.new_lock_owner(),
                vec![LockKey::edge("UAH", pid(1), pid(2))],
            )
            .unwrap();
        let mut session = store.session();
        let outcome = engine.decay(&store, &mut session, store.new_lock_owner(), &mut Vec::new(), &metrics, NOW).unwrap();
        assert_eq!(outcome.updated_count, 0);
        assert_eq!(HubMetrics::get(&metrics.decay_skipped_conflict), 1);
    }

    #[test]
    fn growth_raises_limit_after_threshold() {
        let store = temp_store("growth");
        seed_line(&store, 1_000, 200, NOW);
        let engine = TrustDriftEngine::new(config());

        let mut session = store.session();
        let grown = engine
            .on_cycle_cleared(&mut session, "UAH", &[(pid(1), pid(2))], 60, NOW)
            .unwrap();
        session.commit().unwrap();

        assert_eq!(grown.len(), 1);
        assert_eq!(grown[0].limit, 1_100);
        let state = store.db.get_drift_state("UAH", &pid(1), &pid(2)).unwrap().unwrap();
        assert_eq!(state.cleared_in_window, 60);
        assert_eq!(state.last_growth_at, NOW);
    }

    #[test]
    fn growth_accumulates_across_window_and_respects_cap() {
        let store = temp_store("growth_cap");
        seed_line(&store, 1_000, 0, NOW);
        let mut cfg = config();
        cfg.limit_max_atoms = Some(1_050);
        let engine = TrustDriftEngine::new(cfg);

        let mut session = store.session();
        // Two small clearings sum past the threshold inside the window.
        let grown = engine
            .on_cycle_cleared(&mut session, "UAH", &[(pid(1), pid(2))], 30, NOW)
            .unwrap();
        assert!(grown.is_empty());
        let grown = engine
            .on_cycle_cleared(&mut session, "UAH", &[(pid(1), pid(2))], 30, NOW + 1)
            .unwrap();
        assert_eq!(grown.len(), 1);
        assert_eq!(grown[0].limit, 1_050);
    }

    #[test]
    fn growth_window_resets_after_expiry() {
        let store = temp_store("growth_window");
        seed_line(&store, 1_000, 0, NOW);
        let engine = TrustDriftEngine::new(config());

        let mut session = store.session();
        engine
            .on_cycle_cleared(&mut session, "UAH", &[(pid(1), pid(2))], 30, NOW)
            .unwrap();
        // Eight days later the window restarts: 30 more does not qualify.
        let grown = engine
            .on_cycle_cleared(&mut session, "UAH", &[(pid(1), pid(2))], 30, NOW + 8 * DAY)
            .unwrap();
        assert!(grown.is_empty());
        let state = session.get_drift_state("UAH", &pid(1), &pid(2)).unwrap().unwrap();
        assert_eq!(state.cleared_in_window, 30);
    }

    #[test]
    fn growth_ignores_frozen_lines() {
        let store = temp_store("growth_frozen");
        seed_line(&store, 1_000, 0, NOW);
        let mut session = store.session();
        let mut tl = session.get_trustline("UAH", &pid(1), &pid(2)).unwrap().unwrap();
        tl.status = creditmesh_core::types::TrustLineStatus::Frozen;
        session.put_trustline(&tl).unwrap();
        session.commit().unwrap();

        let engine = TrustDriftEngine::new(config());
        let mut session = store.session();
        let grown = engine
            .on_cycle_cleared(&mut session, "UAH", &[(pid(1), pid(2))], 500, NOW)
            .unwrap();
        assert!(grown.is_empty());
    }
}
