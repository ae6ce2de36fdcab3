//! Payment execution: an in-process two-phase commit with the Store as
//! the resource manager.
//!
//! Plan: shares are assigned greedily over the shortest candidate paths,
//! ties broken by lexical edge key. Prepare: a nested savepoint is opened,
//! every edge on every chosen path is locked in canonical order, and each
//! capacity is re-verified under the lock before `used` and the paired
//! Debt move together. Commit releases the savepoint into the outer tick
//! session. Any per-edge violation rolls the savepoint back, leaving the
//! tick untouched.

use std::collections::BTreeMap;
use std::time::Instant;

use tracing::{info, warn};

use creditmesh_core::amount::format_amount;
use creditmesh_core::error::MeshError;
use creditmesh_core::event::{EventKind, EventPayload, TxFailedPayload, TxUpdatedPayload};
use creditmesh_core::scenario::RouterConfig;
use creditmesh_core::types::{
    Atoms, LockKey, ParticipantStatus, Pid, Timestamp, TrustLine, TxPayload, TxRecord, TxState,
    TxType,
};
use creditmesh_events::PatchBuilder;
use creditmesh_router::{Path, Router};
use creditmesh_store::{LockGuard, LockOwner, Session, Store};

use crate::metrics::HubMetrics;
use crate::PendingEvent;

#[derive(Clone, Debug)]
pub struct PaymentRequest {
    /// Caller-supplied idempotency key.
    pub tx_id: String,
    pub from: Pid,
    pub to: Pid,
    pub equivalent: String,
    pub amount: Atoms,
    /// Canonical-JSON hash of the signed request, recorded for audit.
    pub payload_hash: Option<String>,
}

#[derive(Clone, Debug)]
pub enum PaymentOutcome {
    Committed(TxRecord),
    Failed(TxRecord),
    /// The idempotency key is reused while a prior attempt is in flight.
    InProgress(TxRecord),
}

pub struct PaymentEngine {
    pub router_config: RouterConfig,
}

fn is_internal(err: &MeshError) -> bool {
    matches!(err, MeshError::Storage(_) | MeshError::Serialization(_))
}

fn advance(record: &mut TxRecord, next: TxState) -> Result<(), MeshError> {
    if !record.state.can_become(next) {
        return Err(MeshError::Storage(format!(
            "illegal tx state transition {:?} -> {next:?}",
            record.state
        )));
    }
    record.state = next;
    Ok(())
}

impl PaymentEngine {
    pub fn new(router_config: RouterConfig) -> Self {
        Self { router_config }
    }

    /// Execute one payment. Exactly one terminal event is produced per
    /// `tx_id`: a `tx.updated{committed}` or a `tx.failed{reason}`.
    /// Internal storage faults propagate as `Err`; every business failure
    /// comes back as `Ok(Failed)` with the reason on the record.
    ///
    /// `owner` is the enclosing session's lock owner; on commit the edge
    /// locks are appended to `guards`, which the caller must keep alive
    /// until the session's writes are durable.
    #[allow(clippy::too_many_arguments)]
    pub fn submit(
        &self,
        store: &Store,
        session: &mut Session<'_>,
        owner: LockOwner,
        guards: &mut Vec<LockGuard>,
        router: &Router,
        patches: &PatchBuilder,
        metrics: &HubMetrics,
        events: &mut Vec<PendingEvent>,
        req: PaymentRequest,
        now: Timestamp,
        deadline: Instant,
    ) -> Result<PaymentOutcome, MeshError> {
        // ── Idempotency ──────────────────────────────────────────────────────
        if let Some(existing) = session.get_transaction(&req.tx_id)? {
            if existing.state == TxState::Committed {
                return Ok(PaymentOutcome::Committed(existing));
            }
            if existing.state.is_terminal() {
                return Ok(PaymentOutcome::Failed(existing));
            }
            return Ok(PaymentOutcome::InProgress(existing));
        }

        let mut record = TxRecord {
            tx_id: req.tx_id.clone(),
            tx_type: TxType::Payment,
            initiator: req.from,
            payload: TxPayload::Payment {
                from: req.from,
                to: req.to,
                equivalent: req.equivalent.clone(),
                amount: req.amount,
            },
            state: TxState::Pending,
            error: None,
            payload_hash: req.payload_hash.clone(),
            created_at: now,
            finished_at: None,
        };
        session.put_transaction(&record)?;

        // ── Validation ───────────────────────────────────────────────────────
        let precision = match self.validate(session, &req) {
            Ok(p) => p,
            Err(e) if is_internal(&e) => return Err(e),
            Err(e) => {
                return self.finish_failed(
                    session, metrics, events, record, TxState::Failed, &e, None, &req, now,
                )
            }
        };

        if Instant::now() > deadline {
            return self.finish_failed(
                session,
                metrics,
                events,
                record,
                TxState::Failed,
                &MeshError::Timeout,
                Some(precision),
                &req,
                now,
            );
        }

        // ── Route + plan ─────────────────────────────────────────────────────
        let plan = match self.plan(store, router, &req) {
            Ok(p) => p,
            Err(e) if is_internal(&e) => return Err(e),
            Err(e) => {
                return self.finish_failed(
                    session,
                    metrics,
                    events,
                    record,
                    TxState::Failed,
                    &e,
                    Some(precision),
                    &req,
                    now,
                )
            }
        };

        // ── Prepare under a nested savepoint ─────────────────────────────────
        advance(&mut record, TxState::Preparing)?;
        session.savepoint();
        match self.prepare(store, session, owner, &plan, &req.equivalent, now, deadline) {
            Ok((mutated, guard)) => {
                advance(&mut record, TxState::Prepared)?;
                // ── Commit: fold the savepoint into the outer session ────────
                session.release_savepoint()?;
                advance(&mut record, TxState::Committed)?;
                record.finished_at = Some(now);
                session.put_transaction(&record)?;

                let edges = patches
                    .scoped(store, &mutated)?
                    .map(|p| p.edges)
                    .unwrap_or_default();
                events.push((
                    EventKind::TxUpdated,
                    EventPayload::TxUpdated(TxUpdatedPayload {
                        tx_id: record.tx_id.clone(),
                        tx_type: TxType::Payment.as_str().to_string(),
                        state: TxState::Committed.as_str().to_string(),
                        from: Some(req.from.to_b58()),
                        to: Some(req.to.to_b58()),
                        equivalent: req.equivalent.clone(),
                        amount: format_amount(req.amount, precision),
                        edges,
                    }),
                ));
                HubMetrics::incr(&metrics.payments_committed);
                info!(tx_id = %record.tx_id, paths = plan.len(), "payment committed");
                // Two-phase locking: the edges stay locked until the
                // session's commit makes the mutation durable.
                guards.push(guard);
                Ok(PaymentOutcome::Committed(record))
            }
            Err(e) => {
                session.rollback_savepoint()?;
                if is_internal(&e) {
                    return Err(e);
                }
                self.finish_failed(
                    session,
                    metrics,
                    events,
                    record,
                    TxState::RolledBack,
                    &e,
                    Some(precision),
                    &req,
                    now,
                )
            }
        }
    }

    fn validate(&self, session: &Session<'_>, req: &PaymentRequest) -> Result<u32, MeshError> {
        if req.from == req.to {
            return Err(MeshError::InvalidRequest("sender equals receiver".into()));
        }
        if req.amount == 0 {
            return Err(MeshError::ZeroAmount);
        }
        let equivalent = session
            .get_equivalent(&req.equivalent)?
            .ok_or_else(|| MeshError::UnknownEquivalent(req.equivalent.clone()))?;
        for pid in [&req.from, &req.to] {
            let participant = session
                .get_participant(pid)?
                .ok_or_else(|| MeshError::UnknownParticipant(pid.to_b58()))?;
            if participant.status != ParticipantStatus::Active {
                return Err(MeshError::Frozen(pid.to_b58()));
            }
        }
        Ok(equivalent.precision)
    }

    /// Greedy share assignment over the router's shortest-first candidate
    /// paths, tracking a residual per edge so overlapping paths are not
    /// double-counted.
    fn plan(
        &self,
        store: &Store,
        router: &Router,
        req: &PaymentRequest,
    ) -> Result<Vec<(Path, Atoms)>, MeshError> {
        let paths = router.find_paths(
            store,
            &req.equivalent,
            &req.from,
            &req.to,
            &self.router_config,
        )?;
        let mut residual: BTreeMap<(Pid, Pid), Atoms> = BTreeMap::new();
        for path in &paths {
            for edge in &path.edges {
                residual.entry((edge.from, edge.to)).or_insert(edge.available);
            }
        }

        let min_share = self.router_config.min_path_share_atoms as Atoms;
        let mut remaining = req.amount;
        let mut plan = Vec::new();
        for path in paths {
            if remaining == 0 {
                break;
            }
            let capacity = path
                .edges
                .iter()
                .map(|e| residual[&(e.from, e.to)])
                .min()
                .unwrap_or(0);
            let share = remaining.min(capacity);
            if share < min_share {
                continue;
            }
            for edge in &path.edges {
                if let Some(r) = residual.get_mut(&(edge.from, edge.to)) {
                    *r -= share;
                }
            }
            remaining -= share;
            plan.push((path, share));
        }
        if remaining > 0 {
            return Err(MeshError::InsufficientCapacity {
                need: req.amount,
                routable: req.amount - remaining,
            });
        }
        Ok(plan)
    }

    /// Lock every planned edge in canonical order, re-verify capacity under
    /// the lock, and move `used` plus the paired Debt together. Runs inside
    /// the caller's savepoint; any error aborts the whole set and drops the
    /// guard, while success hands the guard back for the caller to hold
    /// until commit.
    fn prepare(
        &self,
        store: &Store,
        session: &mut Session<'_>,
        owner: LockOwner,
        plan: &[(Path, Atoms)],
        equivalent: &str,
        now: Timestamp,
        deadline: Instant,
    ) -> Result<(Vec<TrustLine>, LockGuard), MeshError> {
        let keys: Vec<LockKey> = plan
            .iter()
            .flat_map(|(path, _)| {
                path.edges
                    .iter()
                    .map(|e| LockKey::edge(equivalent, e.from, e.to))
            })
            .collect();
        let guard = store.lock_edges(owner, keys)?;

        if Instant::now() > deadline {
            return Err(MeshError::Timeout);
        }

        let mut shares: BTreeMap<(Pid, Pid), Atoms> = BTreeMap::new();
        for (path, share) in plan {
            for edge in &path.edges {
                *shares.entry((edge.from, edge.to)).or_insert(0) += share;
            }
        }

        let mut mutated = Vec::with_capacity(shares.len());
        for ((from, to), share) in shares {
            let mut tl = session
                .get_trustline(equivalent, &from, &to)?
                .ok_or_else(|| MeshError::Conflict("edge disappeared under lock".into()))?;
            if !tl.is_active() {
                return Err(MeshError::Frozen(format!("{from} -> {to}")));
            }
            for pid in [&tl.from, &tl.to] {
                let participant = session
                    .get_participant(pid)?
                    .ok_or_else(|| MeshError::UnknownParticipant(pid.to_b58()))?;
                if participant.status != ParticipantStatus::Active {
                    return Err(MeshError::Frozen(pid.to_b58()));
                }
            }
            if tl.used + share > tl.limit {
                return Err(MeshError::InsufficientCapacity {
                    need: share,
                    routable: tl.available(),
                });
            }
            tl.used += share;
            tl.last_active_at = now;
            session.put_trustline(&tl)?;

            let mut debt = session.get_debt(equivalent, &to, &from)?.unwrap_or(
                creditmesh_core::types::Debt {
                    debtor: to,
                    creditor: from,
                    equivalent: equivalent.to_string(),
                    amount: 0,
                    created_at: now,
                    updated_at: now,
                },
            );
            debt.amount += share;
            debt.updated_at = now;
            session.put_debt(&debt)?;
            mutated.push(tl);
        }
        Ok((mutated, guard))
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_failed(
        &self,
        session: &mut Session<'_>,
        metrics: &HubMetrics,
        events: &mut Vec<PendingEvent>,
        mut record: TxRecord,
        terminal: TxState,
        err: &MeshError,
        precision: Option<u32>,
        req: &PaymentRequest,
        now: Timestamp,
    ) -> Result<PaymentOutcome, MeshError> {
        advance(&mut record, terminal)?;
        record.error = Some(err.kind());
        record.finished_at = Some(now);
        session.put_transaction(&record)?;
        events.push((
            EventKind::TxFailed,
            EventPayload::TxFailed(TxFailedPayload {
                tx_id: record.tx_id.clone(),
                reason: err.kind().as_str().to_string(),
                equivalent: Some(req.equivalent.clone()),
                amount: precision.map(|p| format_amount(req.amount, p)),
            }),
        ));
        HubMetrics::incr(&metrics.payments_failed);
        warn!(tx_id = %record.tx_id, reason = %err, "payment failed");
        Ok(PaymentOutcome::Failed(record))
    }
}
