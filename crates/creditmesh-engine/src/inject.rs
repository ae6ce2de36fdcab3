//! Scenario inject executor: applies scheduled topology mutations at
//! their tick times and reports the affected set for cache invalidation
//! and patch emission.
//!
//! Every scenario event carries a monotonically increasing `index`; fired
//! indices are persisted with the session, so replaying a scenario after
//! a crash skips work that already happened. Each op runs inside its own
//! savepoint: a rejected op rolls back cleanly and the tick continues. A
//! lock conflict leaves the event unfired so the next tick retries it;
//! every other rejection is recorded and not retried.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{info, warn};

use creditmesh_core::amount::parse_amount;
use creditmesh_core::error::MeshError;
use creditmesh_core::scenario::{InjectOp, Scenario, TrustLineDef};
use creditmesh_core::types::{
    Atoms, Debt, LockKey, Participant, ParticipantKind, ParticipantStatus, Pid, Tick, Timestamp,
    TrustLine, TrustLineStatus,
};
use creditmesh_store::{LockGuard, LockOwner, Session, Store};

use crate::metrics::HubMetrics;

/// Everything one inject pass changed, for the cache invalidator and the
/// patch builder.
#[derive(Debug, Default)]
pub struct InjectResult {
    pub affected_equivalents: BTreeSet<String>,
    pub new_participants: Vec<Participant>,
    pub new_trustlines: Vec<TrustLine>,
    pub frozen_pids: Vec<Pid>,
    pub frozen_edges: Vec<TrustLine>,
    pub closed_trustlines: Vec<TrustLine>,
    pub inject_debt_equivalents: BTreeSet<String>,
    pub inject_debt_edges_by_eq: BTreeMap<String, Vec<TrustLine>>,
    pub applied: Vec<u64>,
    pub skipped: Vec<u64>,
}

impl InjectResult {
    pub fn total_applied(&self) -> u64 {
        self.applied.len() as u64
    }

    /// Every line whose visible state changed, for a scoped edge patch.
    pub fn patched_lines(&self) -> Vec<TrustLine> {
        let mut lines = Vec::new();
        lines.extend(self.new_trustlines.iter().cloned());
        lines.extend(self.frozen_edges.iter().cloned());
        lines.extend(self.closed_trustlines.iter().cloned());
        for edges in self.inject_debt_edges_by_eq.values() {
            lines.extend(edges.iter().cloned());
        }
        lines
    }

    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }

    /// Fold one successfully-applied op's result into the pass total.
    fn merge(&mut self, other: InjectResult) {
        self.affected_equivalents.extend(other.affected_equivalents);
        self.new_participants.extend(other.new_participants);
        self.new_trustlines.extend(other.new_trustlines);
        self.frozen_pids.extend(other.frozen_pids);
        self.frozen_edges.extend(other.frozen_edges);
        self.closed_trustlines.extend(other.closed_trustlines);
        self.inject_debt_equivalents
            .extend(other.inject_debt_equivalents);
        for (equivalent, edges) in other.inject_debt_edges_by_eq {
            self.inject_debt_edges_by_eq
                .entry(equivalent)
                .or_default()
                .extend(edges);
        }
        self.applied.extend(other.applied);
        self.skipped.extend(other.skipped);
    }
}

fn is_internal(err: &MeshError) -> bool {
    matches!(err, MeshError::Storage(_) | MeshError::Serialization(_))
}

#[derive(Default)]
pub struct InjectExecutor;

impl InjectExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Apply every scheduled event due at or before `tick` that has not
    /// fired yet. `owner`/`guards` are the enclosing session's lock scope:
    /// edges mutated here stay locked until the session commits.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_due(
        &self,
        store: &Store,
        session: &mut Session<'_>,
        owner: LockOwner,
        guards: &mut Vec<LockGuard>,
        scenario: &Scenario,
        tick: Tick,
        now: Timestamp,
        metrics: &HubMetrics,
    ) -> Result<InjectResult, MeshError> {
        let mut result = InjectResult::default();
        for event in scenario.events_due(tick) {
            if session.is_fired(event.index)? {
                continue;
            }
            // A scratch result per op: a rejected op rolls its staged
            // writes back, so nothing it recorded may leak into the pass
            // total either.
            let mut op_result = InjectResult::default();
            session.savepoint();
            match self.execute_op(store, session, owner, guards, &event.op, now, &mut op_result) {
                Ok(()) => {
                    session.mark_fired(event.index);
                    session.release_savepoint()?;
                    result.merge(op_result);
                    result.applied.push(event.index);
                    HubMetrics::incr(&metrics.injects_applied);
                }
                Err(e) => {
                    session.rollback_savepoint()?;
                    if is_internal(&e) {
                        return Err(e);
                    }
                    if e.is_recoverable() {
                        // Lock race with a concurrent worker: leave the
                        // event unfired and let the next tick retry it.
                        warn!(index = event.index, error = %e, "scenario event deferred");
                    } else {
                        session.mark_fired(event.index);
                        warn!(index = event.index, error = %e, "scenario event rejected");
                    }
                    result.skipped.push(event.index);
                    HubMetrics::incr(&metrics.injects_skipped);
                }
            }
        }
        Ok(result)
    }

    /// Apply one op against the session. Public so the request API
    /// (register/open/close calls) routes through the same code path as
    /// scheduled scenario events.
    #[allow(clippy::too_many_arguments)]
    pub fn execute_op(
        &self,
        store: &Store,
        session: &mut Session<'_>,
        owner: LockOwner,
        guards: &mut Vec<LockGuard>,
        op: &InjectOp,
        now: Timestamp,
        result: &mut InjectResult,
    ) -> Result<(), MeshError> {
        match op {
            InjectOp::AddParticipant {
                pid,
                kind,
                display_name,
                initial_trustlines,
            } => {
                let pid = Pid::from_b58(pid)?;
                if session.get_participant(&pid)?.is_none() {
                    let participant =
                        Participant::new(pid, display_name.clone(), ParticipantKind::parse(kind)?, now);
                    session.put_participant(&participant)?;
                    result.new_participants.push(participant);
                }
                for def in initial_trustlines {
                    self.create_trustline(store, session, owner, guards, def, now, result)?;
                }
                Ok(())
            }

            InjectOp::CreateTrustline {
                from,
                to,
                equivalent,
                limit,
            } => self.create_trustline(
                store,
                session,
                owner,
                guards,
                &TrustLineDef {
                    from: from.clone(),
                    to: to.clone(),
                    equivalent: equivalent.clone(),
                    limit: limit.clone(),
                },
                now,
                result,
            ),

            InjectOp::CloseTrustline {
                from,
                to,
                equivalent,
            } => {
                let from = Pid::from_b58(from)?;
                let to = Pid::from_b58(to)?;
                let guard = store.lock_edges(owner, vec![LockKey::edge(equivalent, from, to)])?;
                let mut line = session.get_trustline(equivalent, &from, &to)?.ok_or_else(
                    || MeshError::InvalidRequest(format!("no trust line {from} -> {to}")),
                )?;
                let owed = session
                    .get_debt(equivalent, &to, &from)?
                    .map(|d| d.amount)
                    .unwrap_or(0);
                if owed != 0 {
                    return Err(MeshError::NotEmpty { amount: owed });
                }
                line.status = TrustLineStatus::Closed;
                session.put_trustline(&line)?;
                result.affected_equivalents.insert(equivalent.clone());
                result.closed_trustlines.push(line);
                guards.push(guard);
                Ok(())
            }

            InjectOp::FreezeParticipant { pid } => {
                let pid = Pid::from_b58(pid)?;
                let mut participant = session
                    .get_participant(&pid)?
                    .ok_or_else(|| MeshError::UnknownParticipant(pid.to_b58()))?;
                if participant.status == ParticipantStatus::Suspended {
                    return Ok(());
                }
                participant.status = ParticipantStatus::Suspended;
                session.put_participant(&participant)?;

                let incident: Vec<TrustLine> = session
                    .iter_trustlines_incident(&pid)?
                    .into_iter()
                    .filter(|tl| tl.status == TrustLineStatus::Active)
                    .collect();
                let keys: Vec<LockKey> = incident
                    .iter()
                    .map(|tl| LockKey::edge(&tl.equivalent, tl.from, tl.to))
                    .collect();
                let guard = store.lock_edges(owner, keys)?;
                for mut line in incident {
                    line.status = TrustLineStatus::Frozen;
                    session.put_trustline(&line)?;
                    result.affected_equivalents.insert(line.equivalent.clone());
                    result.frozen_edges.push(line);
                }
                result.frozen_pids.push(pid);
                guards.push(guard);
                Ok(())
            }

            InjectOp::InjectDebt {
                debtor,
                creditor,
                equivalent,
                amount,
            } => {
                let debtor = Pid::from_b58(debtor)?;
                let creditor = Pid::from_b58(creditor)?;
                let atoms = self.parse_amount(session, equivalent, amount)?;
                let guard =
                    store.lock_edges(owner, vec![LockKey::edge(equivalent, creditor, debtor)])?;
                // The debt (debtor, creditor) lives on the TrustLine
                // (creditor → debtor).
                let mut line = session
                    .get_trustline(equivalent, &creditor, &debtor)?
                    .ok_or_else(|| {
                        MeshError::InvalidRequest(format!(
                            "no trust line backs debt {debtor} -> {creditor}"
                        ))
                    })?;
                if !line.is_active() {
                    return Err(MeshError::Frozen(format!("{creditor} -> {debtor}")));
                }
                if atoms > line.limit {
                    return Err(MeshError::InvalidRequest(format!(
                        "injected debt {atoms} exceeds limit {}",
                        line.limit
                    )));
                }
                line.used = atoms;
                line.last_active_at = now;
                session.put_trustline(&line)?;

                let mut debt = session.get_debt(equivalent, &debtor, &creditor)?.unwrap_or(
                    Debt {
                        debtor,
                        creditor,
                        equivalent: equivalent.clone(),
                        amount: 0,
                        created_at: now,
                        updated_at: now,
                    },
                );
                debt.amount = atoms;
                debt.updated_at = now;
                session.put_debt(&debt)?;

                result.affected_equivalents.insert(equivalent.clone());
                result.inject_debt_equivalents.insert(equivalent.clone());
                result
                    .inject_debt_edges_by_eq
                    .entry(equivalent.clone())
                    .or_default()
                    .push(line);
                guards.push(guard);
                Ok(())
            }

            InjectOp::Note { message } => {
                info!(message = %message, "scenario note");
                Ok(())
            }
        }
    }

    /// Idempotent by triple: an identical existing line is a no-op, a
    /// conflicting one is `AlreadyExists`.
    #[allow(clippy::too_many_arguments)]
    fn create_trustline(
        &self,
        store: &Store,
        session: &mut Session<'_>,
        owner: LockOwner,
        guards: &mut Vec<LockGuard>,
        def: &TrustLineDef,
        now: Timestamp,
        result: &mut InjectResult,
    ) -> Result<(), MeshError> {
        let from = Pid::from_b58(&def.from)?;
        let to = Pid::from_b58(&def.to)?;
        if from == to {
            return Err(MeshError::SelfEdge);
        }
        let limit = self.parse_amount(session, &def.equivalent, &def.limit)?;
        for pid in [&from, &to] {
            if session.get_participant(pid)?.is_none() {
                return Err(MeshError::UnknownParticipant(pid.to_b58()));
            }
        }
        let guard = store.lock_edges(owner, vec![LockKey::edge(&def.equivalent, from, to)])?;
        if let Some(existing) = session.get_trustline(&def.equivalent, &from, &to)? {
            if existing.is_active() && existing.limit == limit {
                return Ok(());
            }
            return Err(MeshError::AlreadyExists(format!(
                "trust line {from} -> {to} in {}",
                def.equivalent
            )));
        }
        let line = TrustLine::new(from, to, def.equivalent.clone(), limit, now);
        session.put_trustline(&line)?;
        result.affected_equivalents.insert(def.equivalent.clone());
        result.new_trustlines.push(line);
        guards.push(guard);
        Ok(())
    }

    fn parse_amount(
        &self,
        session: &Session<'_>,
        equivalent: &str,
        amount: &str,
    ) -> Result<Atoms, MeshError> {
        let eq = session
            .get_equivalent(equivalent)?
            .ok_or_else(|| MeshError::UnknownEquivalent(equivalent.to_string()))?;
        parse_amount(amount, eq.precision)
    }
}
