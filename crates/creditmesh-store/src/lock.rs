//! In-process row locks for TrustLine/Debt aggregates.
//!
//! The hub is the single authoritative writer, so row locks live in
//! process memory rather than in sled. One logical operation (a payment
//! across its paths, one cycle, one inject mutation, one drift update)
//! acquires every edge it touches in one call, keys sorted in canonical
//! order, all-or-nothing: a key held by another owner fails the whole
//! request with `Conflict` and the caller skips or retries.
//!
//! Locks are owned: each transactional session (the outer tick session,
//! each clearing cycle) allocates an owner id and holds its guards until
//! its writes are durable. Re-acquiring a key the same owner already
//! holds succeeds and registers nothing, so sequential operations inside
//! one session compose; the key is released when the first guard drops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use creditmesh_core::error::MeshError;
use creditmesh_core::types::LockKey;

/// Identifies the transactional scope holding a set of row locks.
pub type LockOwner = u64;

#[derive(Default)]
pub struct LockTable {
    held: Mutex<HashMap<LockKey, LockOwner>>,
    next_owner: AtomicU64,
}

impl LockTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn new_owner(&self) -> LockOwner {
        self.next_owner.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Acquire all `keys` for `owner`, or none. Keys are sorted and
    /// deduplicated into the canonical order before the attempt. Keys the
    /// owner already holds pass through without double-registration.
    pub fn acquire(
        self: &Arc<Self>,
        owner: LockOwner,
        mut keys: Vec<LockKey>,
    ) -> Result<LockGuard, MeshError> {
        keys.sort();
        keys.dedup();
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(busy) = keys
            .iter()
            .find(|k| held.get(*k).is_some_and(|o| *o != owner))
        {
            return Err(MeshError::Conflict(format!(
                "edge lock busy in {}",
                busy.equivalent
            )));
        }
        let mut acquired = Vec::with_capacity(keys.len());
        for key in keys {
            if held.contains_key(&key) {
                continue;
            }
            held.insert(key.clone(), owner);
            acquired.push(key);
        }
        Ok(LockGuard {
            table: Arc::clone(self),
            keys: acquired,
        })
    }

    fn release(&self, keys: &[LockKey]) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        for key in keys {
            held.remove(key);
        }
    }
}

/// Releases its newly-acquired keys on drop.
pub struct LockGuard {
    table: Arc<LockTable>,
    keys: Vec<LockKey>,
}

impl LockGuard {
    pub fn keys(&self) -> &[LockKey] {
        &self.keys
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.table.release(&self.keys);
    }
}
