//! Payment routing.
//!
//! A payment from sender S to receiver R moves debt debtor→creditor, which
//! traverses TrustLine edges creditor→debtor in reverse: the hop X→Y is
//! usable exactly when an active TrustLine (Y→X) has residual capacity.
//! The router searches breadth-first over that reverse graph, yielding
//! shortest paths first, tie-broken by lexical edge key so equal-length
//! paths have a reproducible order. It never takes locks: it works from a
//! short-lived snapshot, and every capacity it reports is re-verified by
//! the payment engine under row locks.

pub mod snapshot;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::debug;

use creditmesh_core::error::MeshError;
use creditmesh_core::scenario::RouterConfig;
use creditmesh_core::types::{Atoms, Pid};
use creditmesh_store::Store;

pub use snapshot::{EdgeSnap, GraphSnapshot};

/// One candidate route: TrustLine edges in traversal order sender→receiver.
#[derive(Clone, Debug, PartialEq)]
pub struct Path {
    pub edges: Vec<EdgeSnap>,
}

impl Path {
    /// The bottleneck residual along the path.
    pub fn min_available(&self) -> Atoms {
        self.edges.iter().map(|e| e.available).min().unwrap_or(0)
    }

    /// Lexical key: concatenated (from, to) pairs. Deterministic tie-break
    /// for equal-length paths.
    pub fn lexical_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.edges.len() * 64);
        for e in &self.edges {
            key.extend_from_slice(e.from.as_bytes());
            key.extend_from_slice(e.to.as_bytes());
        }
        key
    }
}

struct CacheSlot {
    generation: u64,
    snapshot: Arc<GraphSnapshot>,
}

#[derive(Default)]
struct RouterInner {
    /// Bumped by the cache invalidator whenever a writer finishes.
    generations: HashMap<String, u64>,
    cache: HashMap<String, CacheSlot>,
}

/// Read-through, per-equivalent cache of the routing snapshot, keyed by
/// `(equivalent, generation)`. The authoritative source is always the
/// Store; a reader holding an older generation transparently reloads.
#[derive(Default)]
pub struct Router {
    inner: Mutex<RouterInner>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invalidate the cached snapshot for one equivalent. Only the cache
    /// invalidator calls this; no other component may touch router
    /// internals.
    pub fn bump_generation(&self, equivalent: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *inner.generations.entry(equivalent.to_string()).or_insert(0) += 1;
    }

    pub fn generation(&self, equivalent: &str) -> u64 {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.generations.get(equivalent).copied().unwrap_or(0)
    }

    /// Current snapshot for `equivalent`, reloading if the generation moved.
    pub fn snapshot(
        &self,
        store: &Store,
        equivalent: &str,
    ) -> Result<Arc<GraphSnapshot>, MeshError> {
        let generation = self.generation(equivalent);
        {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(slot) = inner.cache.get(equivalent) {
                if slot.generation == generation {
                    return Ok(Arc::clone(&slot.snapshot));
                }
            }
        }
        let snapshot = Arc::new(GraphSnapshot::load(store, equivalent, generation)?);
        debug!(equivalent, generation, "reloaded router snapshot");
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.cache.insert(
            equivalent.to_string(),
            CacheSlot {
                generation,
                snapshot: Arc::clone(&snapshot),
            },
        );
        Ok(snapshot)
    }

    /// Find up to `k_max` acyclic candidate paths from `sender` to
    /// `receiver`, shortest first. `Err(NoPath)` when the graph is
    /// disconnected for this equivalent; `Ok` paths all carry at least
    /// `min_path_share_atoms` of residual.
    pub fn find_paths(
        &self,
        store: &Store,
        equivalent: &str,
        sender: &Pid,
        receiver: &Pid,
        config: &RouterConfig,
    ) -> Result<Vec<Path>, MeshError> {
        let snapshot = self.snapshot(store, equivalent)?;
        let paths = enumerate_paths(&snapshot, sender, receiver, config.k_max, config.hop_max);
        if paths.is_empty() {
            return Err(MeshError::NoPath {
                from: sender.to_b58(),
                to: receiver.to_b58(),
                equivalent: equivalent.to_string(),
            });
        }
        let min_share = config.min_path_share_atoms as Atoms;
        Ok(paths
            .into_iter()
            .filter(|p| p.min_available() >= min_share)
            .collect())
    }
}

/// Breadth-first path enumeration. The queue is processed in insertion
/// order and every adjacency list is pre-sorted by lexical edge key, so
/// completed paths arrive in (length, lexical key) order without an extra
/// sort. Paths are acyclic: a node never repeats within one path.
fn enumerate_paths(
    snapshot: &GraphSnapshot,
    sender: &Pid,
    receiver: &Pid,
    k_max: usize,
    hop_max: usize,
) -> Vec<Path> {
    if sender == receiver || k_max == 0 {
        return Vec::new();
    }
    let mut found = Vec::new();
    let mut queue: VecDeque<(Pid, Vec<EdgeSnap>, HashSet<Pid>)> = VecDeque::new();
    queue.push_back((*sender, Vec::new(), HashSet::from([*sender])));

    while let Some((node, path, visited)) = queue.pop_front() {
        if found.len() >= k_max {
            break;
        }
        if path.len() >= hop_max {
            continue;
        }
        for edge in snapshot.outgoing(&node) {
            // Reverse traversal: the next hop is the trustline's creditor.
            let next = edge.from;
            if visited.contains(&next) {
                continue;
            }
            let mut new_path = path.clone();
            new_path.push(edge.clone());
            if next == *receiver {
                found.push(Path { edges: new_path });
                if found.len() >= k_max {
                    return found;
                }
                continue;
            }
            let mut new_visited = visited.clone();
            new_visited.insert(next);
            queue.push_back((next, new_path, new_visited));
        }
    }
    found
}
