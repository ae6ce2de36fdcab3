//! Transactional sessions over the store.
//!
//! A session stages every write in memory and applies the whole set as
//! sled batches at commit. Two nesting levels are supported the way the
//! orchestrator needs them: the outer session spans a tick, and nested
//! savepoints wrap single payments so a rolled-back payment does not
//! abort the tick. Reads through a session see its own staged writes.

use std::collections::BTreeMap;

use creditmesh_core::error::MeshError;
use creditmesh_core::types::{Debt, Equivalent, Participant, Pid, TrustLine, TxRecord};
use serde::{de::DeserializeOwned, Serialize};

use crate::db::{edge_key, equivalent_prefix, ser_err, store_err, EdgeDriftState, StoreDb};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
enum TreeId {
    Participants = 0,
    Equivalents = 1,
    TrustLines = 2,
    Debts = 3,
    Transactions = 4,
    ScenarioFired = 5,
    Drift = 6,
}

type StagedKey = (u8, Vec<u8>);
type Layer = BTreeMap<StagedKey, Vec<u8>>;

pub struct Session<'a> {
    db: &'a StoreDb,
    /// Staged write layers. `layers[0]` is the session base; each open
    /// savepoint pushes one more. Reads scan top-down.
    layers: Vec<Layer>,
}

impl<'a> Session<'a> {
    pub(crate) fn new(db: &'a StoreDb) -> Self {
        Self {
            db,
            layers: vec![Layer::new()],
        }
    }

    // ── Savepoints ───────────────────────────────────────────────────────────

    /// Open a nested savepoint. Writes after this call can be rolled back
    /// without touching the rest of the session.
    pub fn savepoint(&mut self) {
        self.layers.push(Layer::new());
    }

    /// Fold the top savepoint's writes into the enclosing scope.
    pub fn release_savepoint(&mut self) -> Result<(), MeshError> {
        if self.layers.len() < 2 {
            return Err(MeshError::Storage("release without open savepoint".into()));
        }
        let top = self.layers.pop().unwrap_or_default();
        let below = self.layers.last_mut().unwrap_or_else(|| unreachable!());
        below.extend(top);
        Ok(())
    }

    /// Discard every write made since the matching `savepoint()`.
    pub fn rollback_savepoint(&mut self) -> Result<(), MeshError> {
        if self.layers.len() < 2 {
            return Err(MeshError::Storage("rollback without open savepoint".into()));
        }
        self.layers.pop();
        Ok(())
    }

    pub fn savepoint_depth(&self) -> usize {
        self.layers.len() - 1
    }

    // ── Raw staged access ────────────────────────────────────────────────────

    fn staged_get(&self, tree: TreeId, key: &[u8]) -> Option<&Vec<u8>> {
        let staged_key = (tree as u8, key.to_vec());
        self.layers.iter().rev().find_map(|l| l.get(&staged_key))
    }

    fn stage(&mut self, tree: TreeId, key: Vec<u8>, value: Vec<u8>) {
        let top = self.layers.last_mut().unwrap_or_else(|| unreachable!());
        top.insert((tree as u8, key), value);
    }

    fn get<T: DeserializeOwned>(
        &self,
        tree: TreeId,
        sled_tree: &sled::Tree,
        key: &[u8],
    ) -> Result<Option<T>, MeshError> {
        if let Some(bytes) = self.staged_get(tree, key) {
            return Ok(Some(bincode::deserialize(bytes).map_err(ser_err)?));
        }
        match sled_tree.get(key).map_err(store_err)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(ser_err)?)),
            None => Ok(None),
        }
    }

    fn put<T: Serialize>(&mut self, tree: TreeId, key: Vec<u8>, value: &T) -> Result<(), MeshError> {
        let bytes = bincode::serialize(value).map_err(ser_err)?;
        self.stage(tree, key, bytes);
        Ok(())
    }

    // ── Typed accessors ──────────────────────────────────────────────────────

    pub fn get_participant(&self, pid: &Pid) -> Result<Option<Participant>, MeshError> {
        self.get(TreeId::Participants, &self.db.participants, pid.as_bytes())
    }

    pub fn put_participant(&mut self, p: &Participant) -> Result<(), MeshError> {
        self.put(TreeId::Participants, p.pid.as_bytes().to_vec(), p)
    }

    pub fn get_equivalent(&self, code: &str) -> Result<Option<Equivalent>, MeshError> {
        self.get(TreeId::Equivalents, &self.db.equivalents, code.as_bytes())
    }

    pub fn put_equivalent(&mut self, eq: &Equivalent) -> Result<(), MeshError> {
        self.put(TreeId::Equivalents, eq.code.as_bytes().to_vec(), eq)
    }

    pub fn get_trustline(
        &self,
        equivalent: &str,
        from: &Pid,
        to: &Pid,
    ) -> Result<Option<TrustLine>, MeshError> {
        self.get(
            TreeId::TrustLines,
            &self.db.trustlines,
            &edge_key(equivalent, from, to),
        )
    }

    pub fn put_trustline(&mut self, tl: &TrustLine) -> Result<(), MeshError> {
        self.put(
            TreeId::TrustLines,
            edge_key(&tl.equivalent, &tl.from, &tl.to),
            tl,
        )
    }

    pub fn get_debt(
        &self,
        equivalent: &str,
        debtor: &Pid,
        creditor: &Pid,
    ) -> Result<Option<Debt>, MeshError> {
        self.get(
            TreeId::Debts,
            &self.db.debts,
            &edge_key(equivalent, debtor, creditor),
        )
    }

    pub fn put_debt(&mut self, d: &Debt) -> Result<(), MeshError> {
        self.put(
            TreeId::Debts,
            edge_key(&d.equivalent, &d.debtor, &d.creditor),
            d,
        )
    }

    pub fn get_transaction(&self, tx_id: &str) -> Result<Option<TxRecord>, MeshError> {
        self.get(TreeId::Transactions, &self.db.transactions, tx_id.as_bytes())
    }

    pub fn put_transaction(&mut self, tx: &TxRecord) -> Result<(), MeshError> {
        self.put(TreeId::Transactions, tx.tx_id.as_bytes().to_vec(), tx)
    }

    pub fn get_drift_state(
        &self,
        equivalent: &str,
        from: &Pid,
        to: &Pid,
    ) -> Result<Option<EdgeDriftState>, MeshError> {
        self.get(TreeId::Drift, &self.db.drift, &edge_key(equivalent, from, to))
    }

    pub fn put_drift_state(
        &mut self,
        equivalent: &str,
        from: &Pid,
        to: &Pid,
        state: &EdgeDriftState,
    ) -> Result<(), MeshError> {
        self.put(TreeId::Drift, edge_key(equivalent, from, to), state)
    }

    pub fn is_fired(&self, index: u64) -> Result<bool, MeshError> {
        if self
            .staged_get(TreeId::ScenarioFired, &index.to_be_bytes())
            .is_some()
        {
            return Ok(true);
        }
        self.db.is_fired(index)
    }

    pub fn mark_fired(&mut self, index: u64) {
        self.stage(TreeId::ScenarioFired, index.to_be_bytes().to_vec(), Vec::new());
    }

    /// TrustLines of one equivalent with this session's staged writes
    /// overlaid on the committed state.
    pub fn iter_trustlines(&self, equivalent: &str) -> Result<Vec<TrustLine>, MeshError> {
        let mut merged: BTreeMap<Vec<u8>, TrustLine> = BTreeMap::new();
        for item in self
            .db
            .trustlines
            .scan_prefix(equivalent_prefix(equivalent))
        {
            let (key, bytes) = item.map_err(store_err)?;
            merged.insert(key.to_vec(), bincode::deserialize(&bytes).map_err(ser_err)?);
        }
        let prefix = equivalent_prefix(equivalent);
        for layer in &self.layers {
            for ((tree, key), bytes) in layer {
                if *tree == TreeId::TrustLines as u8 && key.starts_with(&prefix) {
                    merged.insert(key.clone(), bincode::deserialize(bytes).map_err(ser_err)?);
                }
            }
        }
        Ok(merged.into_values().collect())
    }

    /// All TrustLines incident to `pid` (either side, any equivalent),
    /// staged writes overlaid. Full scan: community-hub scale.
    pub fn iter_trustlines_incident(&self, pid: &Pid) -> Result<Vec<TrustLine>, MeshError> {
        let mut merged: BTreeMap<Vec<u8>, TrustLine> = BTreeMap::new();
        for item in self.db.trustlines.iter() {
            let (key, bytes) = item.map_err(store_err)?;
            merged.insert(key.to_vec(), bincode::deserialize(&bytes).map_err(ser_err)?);
        }
        for layer in &self.layers {
            for ((tree, key), bytes) in layer {
                if *tree == TreeId::TrustLines as u8 {
                    merged.insert(key.clone(), bincode::deserialize(bytes).map_err(ser_err)?);
                }
            }
        }
        Ok(merged
            .into_values()
            .filter(|tl| tl.from == *pid || tl.to == *pid)
            .collect())
    }

    // ── Commit / rollback ────────────────────────────────────────────────────

    /// Apply every staged write. Open savepoints are folded in first.
    pub fn commit(mut self) -> Result<(), MeshError> {
        while self.layers.len() > 1 {
            self.release_savepoint()?;
        }
        let layer = self.layers.pop().unwrap_or_default();

        let mut batches: BTreeMap<u8, sled::Batch> = BTreeMap::new();
        for ((tree, key), value) in layer {
            batches
                .entry(tree)
                .or_insert_with(sled::Batch::default)
                .insert(key, value);
        }
        for (tree, batch) in batches {
            let sled_tree = match tree {
                t if t == TreeId::Participants as u8 => &self.db.participants,
                t if t == TreeId::Equivalents as u8 => &self.db.equivalents,
                t if t == TreeId::TrustLines as u8 => &self.db.trustlines,
                t if t == TreeId::Debts as u8 => &self.db.debts,
                t if t == TreeId::Transactions as u8 => &self.db.transactions,
                t if t == TreeId::ScenarioFired as u8 => &self.db.scenario_fired,
                _ => &self.db.drift,
            };
            sled_tree.apply_batch(batch).map_err(store_err)?;
        }
        self.db.flush()
    }

    /// Discard the whole session.
    pub fn rollback(self) {}
}
