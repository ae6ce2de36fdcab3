use std::sync::atomic::{AtomicU64, Ordering};

/// Hub-wide counters. Recoverable skips (lock conflicts, stale cycles)
/// surface only here, never as caller errors.
#[derive(Default)]
pub struct HubMetrics {
    pub payments_committed: AtomicU64,
    pub payments_failed: AtomicU64,
    pub cycles_cleared: AtomicU64,
    pub cycles_skipped_conflict: AtomicU64,
    pub cycles_skipped_stale: AtomicU64,
    pub growth_updates: AtomicU64,
    pub decay_updates: AtomicU64,
    pub decay_skipped_conflict: AtomicU64,
    pub injects_applied: AtomicU64,
    pub injects_skipped: AtomicU64,
    pub ticks_over_budget: AtomicU64,
}

impl HubMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
