//! Incremental patch construction.
//!
//! Two modes: *scoped* patches carry only the edges a commit actually
//! mutated, with their fresh `{limit, used, available}`; *full-equivalent*
//! patches re-emit every edge of an equivalent when the viz width
//! quantiles must be recomputed (trust-drift growth). A patch is never
//! emitted empty — builders return `None` instead, and callers drop the
//! event.
//!
//! Edge references use `from`/`to` in TrustLine direction (creditor →
//! debtor). Engines working in debt direction flip at their boundary
//! before calling in here.

use std::collections::HashMap;
use std::sync::Mutex;

use creditmesh_core::amount::format_amount;
use creditmesh_core::error::MeshError;
use creditmesh_core::event::{EdgePatch, EdgePatchEntry, EdgeRef, NodePatch, NodePatchEntry};
use creditmesh_core::types::{Atoms, Participant, Pid, TrustLine, TrustLineStatus};
use creditmesh_store::Store;

/// Builds edge/node patches; caches per-equivalent viz quantiles (decile
/// thresholds of `used`) until the cache invalidator drops them.
#[derive(Default)]
pub struct PatchBuilder {
    quantiles: Mutex<HashMap<String, Vec<Atoms>>>,
}

impl PatchBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop cached quantiles for one equivalent. Called by the cache
    /// invalidator only.
    pub fn drop_quantiles(&self, equivalent: &str) {
        let mut cache = self.quantiles.lock().unwrap_or_else(|e| e.into_inner());
        cache.remove(equivalent);
    }

    /// Scoped patch: exactly the given freshly-mutated lines (any mix of
    /// equivalents). Returns `None` when `lines` is empty.
    pub fn scoped(
        &self,
        store: &Store,
        lines: &[TrustLine],
    ) -> Result<Option<EdgePatch>, MeshError> {
        if lines.is_empty() {
            return Ok(None);
        }
        let mut edges = Vec::with_capacity(lines.len());
        for tl in lines {
            edges.push(self.entry(store, tl)?);
        }
        Ok(Some(EdgePatch { edges }))
    }

    /// Full-equivalent patch: every edge of `equivalent` with freshly
    /// recomputed quantiles. Returns `None` for an empty equivalent.
    pub fn full_equivalent(
        &self,
        store: &Store,
        equivalent: &str,
    ) -> Result<Option<EdgePatch>, MeshError> {
        self.drop_quantiles(equivalent);
        let mut lines = store.db.iter_trustlines(equivalent)?;
        if lines.is_empty() {
            return Ok(None);
        }
        lines.sort_by(|a, b| (a.from, a.to).cmp(&(b.from, b.to)));
        let mut edges = Vec::with_capacity(lines.len());
        for tl in &lines {
            edges.push(self.entry(store, tl)?);
        }
        Ok(Some(EdgePatch { edges }))
    }

    /// One fresh patch entry for a mutated line.
    pub fn entry(&self, store: &Store, tl: &TrustLine) -> Result<EdgePatchEntry, MeshError> {
        let precision = store
            .db
            .get_equivalent(&tl.equivalent)?
            .map(|eq| eq.precision)
            .unwrap_or(0);
        let thresholds = self.thresholds(store, &tl.equivalent)?;
        let bucket = if thresholds.is_empty() {
            None
        } else {
            Some(thresholds.iter().filter(|t| **t < tl.used).count() as u8)
        };
        Ok(EdgePatchEntry {
            from: tl.from.to_b58(),
            to: tl.to.to_b58(),
            equivalent: tl.equivalent.clone(),
            limit: format_amount(tl.limit, precision),
            used: format_amount(tl.used, precision),
            available: format_amount(tl.available(), precision),
            status: status_str(tl.status).to_string(),
            viz_width_bucket: bucket,
        })
    }

    fn thresholds(&self, store: &Store, equivalent: &str) -> Result<Vec<Atoms>, MeshError> {
        {
            let cache = self.quantiles.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(t) = cache.get(equivalent) {
                return Ok(t.clone());
            }
        }
        let mut used: Vec<Atoms> = store
            .db
            .iter_trustlines(equivalent)?
            .into_iter()
            .map(|tl| tl.used)
            .collect();
        used.sort_unstable();
        let thresholds: Vec<Atoms> = if used.is_empty() {
            Vec::new()
        } else {
            (1..10).map(|d| used[(used.len() - 1) * d / 10]).collect()
        };
        let mut cache = self.quantiles.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(equivalent.to_string(), thresholds.clone());
        Ok(thresholds)
    }
}

fn status_str(status: TrustLineStatus) -> &'static str {
    match status {
        TrustLineStatus::Active => "active",
        TrustLineStatus::Frozen => "frozen",
        TrustLineStatus::Closed => "closed",
    }
}

/// Wire edge reference in TrustLine direction.
pub fn edge_ref(from: &Pid, to: &Pid) -> EdgeRef {
    EdgeRef {
        from: from.to_b58(),
        to: to.to_b58(),
    }
}

pub fn node_entry(p: &Participant) -> NodePatchEntry {
    NodePatchEntry {
        pid: p.pid.to_b58(),
        display_name: p.display_name.clone(),
        kind: p.kind.as_str().to_string(),
        status: p.status.as_str().to_string(),
    }
}

pub fn node_patch(participants: &[Participant]) -> Option<NodePatch> {
    if participants.is_empty() {
        return None;
    }
    Some(NodePatch {
        nodes: participants.iter().map(node_entry).collect(),
    })
}
