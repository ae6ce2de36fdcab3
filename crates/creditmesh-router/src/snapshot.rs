//! Short-lived adjacency snapshots of the routable graph.

use std::collections::HashMap;

use creditmesh_core::error::MeshError;
use creditmesh_core::types::{Atoms, Pid};
use creditmesh_store::Store;

/// One routable TrustLine edge: `from` = creditor, `to` = debtor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EdgeSnap {
    pub from: Pid,
    pub to: Pid,
    pub available: Atoms,
}

/// Reverse-direction adjacency for one equivalent: for each debtor node,
/// the active TrustLines extended to it, i.e. the hops it can pay over.
/// Built from committed state only; the router takes no locks.
pub struct GraphSnapshot {
    pub equivalent: String,
    pub generation: u64,
    adjacency: HashMap<Pid, Vec<EdgeSnap>>,
    edge_count: usize,
}

impl GraphSnapshot {
    /// Load the snapshot for `equivalent`, restricted to active edges with
    /// residual capacity. Each adjacency list is sorted by lexical edge
    /// key (creditor bytes) for deterministic traversal order.
    pub fn load(store: &Store, equivalent: &str, generation: u64) -> Result<Self, MeshError> {
        let mut adjacency: HashMap<Pid, Vec<EdgeSnap>> = HashMap::new();
        let mut edge_count = 0usize;
        for tl in store.db.iter_trustlines(equivalent)? {
            if !tl.is_active() || tl.available() == 0 {
                continue;
            }
            edge_count += 1;
            adjacency.entry(tl.to).or_default().push(EdgeSnap {
                from: tl.from,
                to: tl.to,
                available: tl.available(),
            });
        }
        for edges in adjacency.values_mut() {
            edges.sort_by(|a, b| (a.from, a.to).cmp(&(b.from, b.to)));
        }
        Ok(Self {
            equivalent: equivalent.to_string(),
            generation,
            adjacency,
            edge_count,
        })
    }

    /// Hops available to `debtor`: the TrustLines extended to it.
    pub fn outgoing(&self, debtor: &Pid) -> &[EdgeSnap] {
        self.adjacency.get(debtor).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn edge_count(&self) -> usize {
        self.edge_count
    }
}
