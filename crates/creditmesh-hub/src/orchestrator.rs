//! The per-tick orchestrator.
//!
//! One tick drives inject → payments → clearing → drift under a shared
//! outer session; the clearing engine opens its own sessions so it can
//! proceed concurrently with payment work on other edges. Events produced
//! by the phases are collected in order and published once the outer
//! session has committed, so subscribers never observe a seq for a
//! mutation that did not land. A tick has a wall-clock budget: exceeding
//! it skips the remaining phases (counted in metrics) but never partially
//! commits a mutation.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use creditmesh_core::amount::parse_amount;
use creditmesh_core::constants::{DEFAULT_TICK_BUDGET_MS, DEFAULT_TICK_INTERVAL_MS};
use creditmesh_core::error::MeshError;
use creditmesh_core::event::{
    EventKind, EventPayload, RunStatusPayload, TopologyChangedPayload, TxFailedPayload,
};
use creditmesh_core::scenario::{InjectOp, Scenario, ScheduledPayment};
use creditmesh_core::types::{
    ErrorKind, LockKey, Participant, ParticipantKind, Pid, Tick, Timestamp, TxRecord,
};
use creditmesh_engine::{
    CacheInvalidator, ClearingEngine, HubMetrics, InjectExecutor, InjectResult, PaymentEngine,
    PaymentOutcome, PaymentRequest, PendingEvent, TrustDriftEngine,
};
use creditmesh_events::{edge_ref, node_patch, EventBus, PatchBuilder, Subscription};
use creditmesh_router::Router;
use creditmesh_store::{HubSnapshot, LockGuard, LockOwner, Store};

/// Conflict-failed payments are requeued with a derived attempt key this
/// many times before the hub gives up on them.
const MAX_PAYMENT_ATTEMPTS: u32 = 3;

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub tick_budget_ms: u64,
    pub tick_interval_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            tick_budget_ms: DEFAULT_TICK_BUDGET_MS,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Default)]
pub struct TickReport {
    pub tick: Tick,
    pub injects_applied: u64,
    pub payments_committed: u64,
    pub payments_failed: u64,
    pub cycles_cleared: u32,
    pub decayed_edges: usize,
    pub events_published: u64,
    pub over_budget: bool,
}

pub struct Orchestrator {
    store: Arc<Store>,
    router: Arc<Router>,
    patches: Arc<PatchBuilder>,
    bus: Arc<EventBus>,
    invalidator: CacheInvalidator,
    payment: PaymentEngine,
    clearing: ClearingEngine,
    drift: TrustDriftEngine,
    inject: InjectExecutor,
    pub metrics: Arc<HubMetrics>,
    scenario: Scenario,
    config: HubConfig,
    tick: Tick,
    retry_queue: Vec<(ScheduledPayment, u32)>,
}

impl Orchestrator {
    /// Wire the engines together and apply the scenario bootstrap
    /// (equivalents, participants, initial trust lines) if missing.
    pub fn new(
        store: Arc<Store>,
        scenario: Scenario,
        config: HubConfig,
        now: Timestamp,
    ) -> Result<Self, MeshError> {
        let router = Arc::new(Router::new());
        let patches = Arc::new(PatchBuilder::new());
        let bus = Arc::new(EventBus::new(Arc::clone(&store)));
        let invalidator = CacheInvalidator::new(Arc::clone(&router), Arc::clone(&patches));

        let payment = PaymentEngine::new(scenario.router.clone().unwrap_or_default());
        let clearing = ClearingEngine::new(scenario.clearing.clone().unwrap_or_default());
        let drift = TrustDriftEngine::new(scenario.drift.clone().unwrap_or_default());
        let inject = InjectExecutor::new();

        let orchestrator = Self {
            store,
            router,
            patches,
            bus,
            invalidator,
            payment,
            clearing,
            drift,
            inject,
            metrics: Arc::new(HubMetrics::default()),
            scenario,
            config,
            tick: 0,
            retry_queue: Vec::new(),
        };
        orchestrator.bootstrap(now)?;
        Ok(orchestrator)
    }

    fn bootstrap(&self, now: Timestamp) -> Result<(), MeshError> {
        let mut session = self.store.session();
        for def in &self.scenario.equivalents {
            if session.get_equivalent(&def.code)?.is_some() {
                continue;
            }
            if def.code.is_empty()
                || def.code.len() > creditmesh_core::constants::MAX_EQUIVALENT_CODE_LEN
                || def.precision > creditmesh_core::constants::MAX_EQUIVALENT_PRECISION
            {
                return Err(MeshError::InvalidRequest(format!(
                    "bad equivalent definition {:?}",
                    def.code
                )));
            }
            session.put_equivalent(&creditmesh_core::types::Equivalent {
                code: def.code.clone(),
                precision: def.precision,
                created_at: now,
            })?;
        }
        for def in &self.scenario.participants {
            let pid = resolve_pid(def.pid.as_deref(), def.public_key_hex.as_deref())?;
            if session.get_participant(&pid)?.is_some() {
                continue;
            }
            session.put_participant(&Participant::new(
                pid,
                def.display_name.clone(),
                ParticipantKind::parse(&def.kind)?,
                now,
            ))?;
        }
        let owner = self.store.new_lock_owner();
        let mut guards = Vec::new();
        let mut scratch = InjectResult::default();
        for def in &self.scenario.trustlines {
            self.inject.execute_op(
                &self.store,
                &mut session,
                owner,
                &mut guards,
                &InjectOp::CreateTrustline {
                    from: def.from.clone(),
                    to: def.to.clone(),
                    equivalent: def.equivalent.clone(),
                    limit: def.limit.clone(),
                },
                now,
                &mut scratch,
            )?;
        }
        session.commit()?;
        drop(guards);
        if !self.scenario.equivalents.is_empty() {
            info!(
                equivalents = self.scenario.equivalents.len(),
                participants = self.scenario.participants.len(),
                trustlines = self.scenario.trustlines.len(),
                "scenario bootstrap applied"
            );
        }
        Ok(())
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn current_tick(&self) -> Tick {
        self.tick
    }

    // ── Request API (§ external interfaces) ──────────────────────────────────

    /// `subscribe_events{last_seen_seq?}`.
    pub fn subscribe_events(
        &self,
        last_seen_seq: Option<u64>,
    ) -> Result<Subscription, MeshError> {
        self.bus.subscribe(last_seen_seq)
    }

    /// `snapshot{equivalent?}`.
    pub fn snapshot(&self, equivalent: Option<&str>) -> Result<HubSnapshot, MeshError> {
        self.store.snapshot(equivalent)
    }

    pub fn get_transaction(&self, tx_id: &str) -> Result<Option<TxRecord>, MeshError> {
        self.store.db.get_transaction(tx_id)
    }

    /// `submit_payment{...}` outside the tick loop: executes immediately
    /// in its own session and publishes the terminal event.
    pub fn submit_payment(
        &self,
        tx_id: &str,
        from: &str,
        to: &str,
        equivalent: &str,
        amount: &str,
        now: Timestamp,
    ) -> Result<PaymentOutcome, MeshError> {
        let precision = self
            .store
            .db
            .get_equivalent(equivalent)?
            .ok_or_else(|| MeshError::UnknownEquivalent(equivalent.to_string()))?
            .precision;
        let request = PaymentRequest {
            tx_id: tx_id.to_string(),
            from: Pid::from_b58(from)?,
            to: Pid::from_b58(to)?,
            equivalent: equivalent.to_string(),
            amount: parse_amount(amount, precision)?,
            payload_hash: None,
        };
        let deadline = Instant::now() + Duration::from_millis(self.config.tick_budget_ms);
        let mut session = self.store.session();
        let owner = self.store.new_lock_owner();
        let mut guards: Vec<LockGuard> = Vec::new();
        let mut events: Vec<PendingEvent> = Vec::new();
        let outcome = self.payment.submit(
            &self.store,
            &mut session,
            owner,
            &mut guards,
            &self.router,
            &self.patches,
            &self.metrics,
            &mut events,
            request,
            now,
            deadline,
        )?;
        session.commit()?;
        drop(guards);
        if matches!(outcome, PaymentOutcome::Committed(_)) {
            self.invalidator.invalidate([equivalent]);
        }
        for (kind, payload) in events {
            self.bus.publish(now, kind, payload)?;
        }
        Ok(outcome)
    }

    /// `register_participant{...}`. Signature verification happens outside
    /// the core; `payload_hash` is the canonical-JSON hash recorded for
    /// audit by the caller.
    pub fn register_participant(
        &self,
        pid: &str,
        kind: &str,
        display_name: &str,
        now: Timestamp,
    ) -> Result<Participant, MeshError> {
        let pid = Pid::from_b58(pid)?;
        let mut session = self.store.session();
        if let Some(existing) = session.get_participant(&pid)? {
            return Err(MeshError::AlreadyExists(existing.pid.to_b58()));
        }
        let participant =
            Participant::new(pid, display_name.to_string(), ParticipantKind::parse(kind)?, now);
        session.put_participant(&participant)?;
        session.commit()?;

        let mut payload = TopologyChangedPayload::with_reason("participant_registered");
        payload.added_nodes = vec![creditmesh_events::node_entry(&participant)];
        self.bus
            .publish(now, EventKind::TopologyChanged, EventPayload::TopologyChanged(payload))?;
        Ok(participant)
    }

    /// `open_trustline{...}` / `close_trustline{...}`: routed through the
    /// same executor path as scheduled scenario events.
    pub fn open_trustline(
        &self,
        from: &str,
        to: &str,
        equivalent: &str,
        limit: &str,
        now: Timestamp,
    ) -> Result<(), MeshError> {
        self.run_topology_op(
            &InjectOp::CreateTrustline {
                from: from.to_string(),
                to: to.to_string(),
                equivalent: equivalent.to_string(),
                limit: limit.to_string(),
            },
            "trustline_opened",
            now,
        )
    }

    pub fn close_trustline(
        &self,
        from: &str,
        to: &str,
        equivalent: &str,
        now: Timestamp,
    ) -> Result<(), MeshError> {
        self.run_topology_op(
            &InjectOp::CloseTrustline {
                from: from.to_string(),
                to: to.to_string(),
                equivalent: equivalent.to_string(),
            },
            "trustline_closed",
            now,
        )
    }

    /// `update_trustline{...}`: raise or lower the limit. Lowering clamps
    /// at the current `used`.
    pub fn update_trustline(
        &self,
        from: &str,
        to: &str,
        equivalent: &str,
        limit: &str,
        now: Timestamp,
    ) -> Result<(), MeshError> {
        let from = Pid::from_b58(from)?;
        let to = Pid::from_b58(to)?;
        let precision = self
            .store
            .db
            .get_equivalent(equivalent)?
            .ok_or_else(|| MeshError::UnknownEquivalent(equivalent.to_string()))?
            .precision;
        let new_limit = parse_amount(limit, precision)?;

        let mut session = self.store.session();
        let owner = self.store.new_lock_owner();
        let _guard = self
            .store
            .lock_edges(owner, vec![LockKey::edge(equivalent, from, to)])?;
        let mut line = session
            .get_trustline(equivalent, &from, &to)?
            .ok_or_else(|| MeshError::InvalidRequest(format!("no trust line {from} -> {to}")))?;
        if !line.is_active() {
            return Err(MeshError::Frozen(format!("{from} -> {to}")));
        }
        if new_limit < line.used {
            return Err(MeshError::InvalidRequest(format!(
                "limit {new_limit} below current used {}",
                line.used
            )));
        }
        line.limit = new_limit;
        session.put_trustline(&line)?;
        session.commit()?;
        self.invalidator.invalidate([equivalent]);

        let mut payload = TopologyChangedPayload::with_reason("trustline_updated");
        payload.edge_patch = self.patches.scoped(&self.store, &[line])?;
        self.bus
            .publish(now, EventKind::TopologyChanged, EventPayload::TopologyChanged(payload))?;
        Ok(())
    }

    fn run_topology_op(
        &self,
        op: &InjectOp,
        reason: &str,
        now: Timestamp,
    ) -> Result<(), MeshError> {
        let mut session = self.store.session();
        let owner = self.store.new_lock_owner();
        let mut guards = Vec::new();
        let mut result = InjectResult::default();
        self.inject
            .execute_op(&self.store, &mut session, owner, &mut guards, op, now, &mut result)?;
        session.commit()?;
        drop(guards);
        self.invalidator.invalidate(&result.affected_equivalents);
        if let Some(payload) = self.inject_topology_payload(&result, reason)? {
            self.bus
                .publish(now, EventKind::TopologyChanged, EventPayload::TopologyChanged(payload))?;
        }
        Ok(())
    }

    // ── Tick loop ────────────────────────────────────────────────────────────

    /// Drive one tick at `now`. Returns what happened.
    pub fn run_tick(&mut self, now: Timestamp) -> Result<TickReport, MeshError> {
        let tick = self.tick;
        let deadline = Instant::now() + Duration::from_millis(self.config.tick_budget_ms);
        let mut events: Vec<PendingEvent> = Vec::new();
        let mut report = TickReport {
            tick,
            ..TickReport::default()
        };
        let committed_before = HubMetrics::get(&self.metrics.payments_committed);
        let failed_before = HubMetrics::get(&self.metrics.payments_failed);

        // The session borrows a local handle so `self` stays free for the
        // phase calls below. The outer session is one lock scope: its row
        // locks are held in `guards` until the commit below, and router
        // cache invalidation for its writes is deferred to the same point
        // so no reader caches a pre-commit snapshot under a fresh
        // generation.
        let store = Arc::clone(&self.store);
        let mut session = store.session();
        let owner = store.new_lock_owner();
        let mut guards: Vec<LockGuard> = Vec::new();
        let mut stale_equivalents: BTreeSet<String> = BTreeSet::new();

        // ── 1. Scenario inject ───────────────────────────────────────────────
        let inject_result = self.inject.apply_due(
            &self.store,
            &mut session,
            owner,
            &mut guards,
            &self.scenario,
            tick,
            now,
            &self.metrics,
        )?;
        stale_equivalents.extend(inject_result.affected_equivalents.iter().cloned());
        if let Some(payload) = self.inject_topology_payload(&inject_result, "inject")? {
            events.push((
                EventKind::TopologyChanged,
                EventPayload::TopologyChanged(payload),
            ));
        }
        report.injects_applied = inject_result.total_applied();

        // ── 2. Payments ──────────────────────────────────────────────────────
        report.over_budget = Instant::now() > deadline;
        if !report.over_budget {
            let mut work: Vec<(ScheduledPayment, u32)> = std::mem::take(&mut self.retry_queue);
            work.extend(self.scenario.payments_due(tick).cloned().map(|p| (p, 0)));
            for (payment, attempt) in work {
                if Instant::now() > deadline {
                    report.over_budget = true;
                    self.retry_queue.push((payment, attempt));
                    continue;
                }
                self.run_one_payment(
                    &mut session,
                    owner,
                    &mut guards,
                    &mut events,
                    &mut stale_equivalents,
                    payment,
                    attempt,
                    now,
                    deadline,
                )?;
            }
        }

        // ── 3. Clearing (isolated sessions, one per cycle) ───────────────────
        if !report.over_budget {
            let outcome = self.clearing.run(
                &self.store,
                &self.drift,
                &self.patches,
                &self.invalidator,
                &self.metrics,
                &mut events,
                tick,
                now,
            )?;
            report.cycles_cleared = outcome.cleared_cycles;
            report.over_budget = Instant::now() > deadline;
        }

        // ── 4. Trust decay on the outer session ──────────────────────────────
        if !report.over_budget {
            let outcome = self.drift.decay(
                &self.store,
                &mut session,
                owner,
                &mut guards,
                &self.metrics,
                now,
            )?;
            // Only equivalents with a non-empty patch get invalidated and
            // announced; a decay pass that touched nothing stays silent.
            stale_equivalents.extend(outcome.touched_equivalents.iter().cloned());
            report.decayed_edges = outcome.updated_count;
            for (_, lines) in &outcome.touched_edges_by_eq {
                let mut payload = TopologyChangedPayload::with_reason("trust_decay");
                payload.edge_patch = self.patches.scoped(&self.store, lines)?;
                if !payload.is_empty() {
                    events.push((
                        EventKind::TopologyChanged,
                        EventPayload::TopologyChanged(payload),
                    ));
                }
            }
            for _ in 0..outcome.updated_count {
                HubMetrics::incr(&self.metrics.decay_updates);
            }
        }

        // ── 5. Commit, release locks, invalidate, then publish ───────────────
        session.commit()?;
        drop(guards);
        self.invalidator.invalidate(&stale_equivalents);
        for (kind, payload) in events {
            self.bus.publish(now, kind, payload)?;
            report.events_published += 1;
        }
        if report.over_budget {
            HubMetrics::incr(&self.metrics.ticks_over_budget);
            warn!(tick, "tick exceeded its budget; remaining phases skipped");
        }

        report.payments_committed =
            HubMetrics::get(&self.metrics.payments_committed) - committed_before;
        report.payments_failed = HubMetrics::get(&self.metrics.payments_failed) - failed_before;
        self.tick += 1;
        info!(
            tick,
            injects = report.injects_applied,
            payments = report.payments_committed,
            cycles = report.cycles_cleared,
            decayed = report.decayed_edges,
            events = report.events_published,
            "tick done"
        );
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_one_payment(
        &mut self,
        session: &mut creditmesh_store::Session<'_>,
        owner: LockOwner,
        guards: &mut Vec<LockGuard>,
        events: &mut Vec<PendingEvent>,
        stale_equivalents: &mut BTreeSet<String>,
        payment: ScheduledPayment,
        attempt: u32,
        now: Timestamp,
        deadline: Instant,
    ) -> Result<(), MeshError> {
        let tx_id = if attempt == 0 {
            payment.tx_id.clone()
        } else {
            format!("{}#r{attempt}", payment.tx_id)
        };
        let request = match self.parse_payment(&payment, &tx_id, session) {
            Ok(r) => r,
            Err(e) => {
                warn!(tx_id = %tx_id, error = %e, "scheduled payment rejected");
                events.push((
                    EventKind::TxFailed,
                    EventPayload::TxFailed(TxFailedPayload {
                        tx_id,
                        reason: e.kind().as_str().to_string(),
                        equivalent: Some(payment.equivalent.clone()),
                        amount: None,
                    }),
                ));
                HubMetrics::incr(&self.metrics.payments_failed);
                return Ok(());
            }
        };
        let outcome = self.payment.submit(
            &self.store,
            session,
            owner,
            guards,
            &self.router,
            &self.patches,
            &self.metrics,
            events,
            request,
            now,
            deadline,
        )?;
        match outcome {
            PaymentOutcome::Committed(_) => {
                stale_equivalents.insert(payment.equivalent.clone());
            }
            PaymentOutcome::Failed(record)
                if record.error == Some(ErrorKind::Conflict)
                    && attempt + 1 < MAX_PAYMENT_ATTEMPTS =>
            {
                // Lost a lock race against clearing; the next tick retries
                // under a derived attempt key.
                self.retry_queue.push((payment, attempt + 1));
            }
            PaymentOutcome::Failed(_) | PaymentOutcome::InProgress(_) => {}
        }
        Ok(())
    }

    fn parse_payment(
        &self,
        payment: &ScheduledPayment,
        tx_id: &str,
        session: &creditmesh_store::Session<'_>,
    ) -> Result<PaymentRequest, MeshError> {
        let precision = session
            .get_equivalent(&payment.equivalent)?
            .ok_or_else(|| MeshError::UnknownEquivalent(payment.equivalent.clone()))?
            .precision;
        Ok(PaymentRequest {
            tx_id: tx_id.to_string(),
            from: Pid::from_b58(&payment.from)?,
            to: Pid::from_b58(&payment.to)?,
            equivalent: payment.equivalent.clone(),
            amount: parse_amount(&payment.amount, precision)?,
            payload_hash: None,
        })
    }

    /// Build the inject `topology.changed` payload, or `None` when every
    /// field would be empty (such an event is never emitted).
    fn inject_topology_payload(
        &self,
        result: &InjectResult,
        reason: &str,
    ) -> Result<Option<TopologyChangedPayload>, MeshError> {
        let mut payload = TopologyChangedPayload::with_reason(reason);
        payload.added_nodes = result
            .new_participants
            .iter()
            .map(creditmesh_events::node_entry)
            .collect();
        payload.added_edges = result
            .new_trustlines
            .iter()
            .map(|tl| edge_ref(&tl.from, &tl.to))
            .collect();
        payload.frozen_nodes = result.frozen_pids.iter().map(Pid::to_b58).collect();
        payload.frozen_edges = result
            .frozen_edges
            .iter()
            .map(|tl| edge_ref(&tl.from, &tl.to))
            .collect();
        payload.edge_patch = self.patches.scoped(&self.store, &result.patched_lines())?;
        payload.node_patch = node_patch(&result.new_participants);
        if payload.is_empty() {
            return Ok(None);
        }
        Ok(Some(payload))
    }

    // ── Free-running loop ────────────────────────────────────────────────────

    /// Run `ticks` ticks at the configured cadence, bracketed by
    /// `run_status` events.
    pub async fn run(&mut self, ticks: u64) -> Result<(), MeshError> {
        self.publish_run_status("running")?;
        for _ in 0..ticks {
            let now = chrono::Utc::now().timestamp();
            if let Err(e) = self.run_tick(now) {
                // A single failed tick does not stop the hub; partial
                // failure is the norm.
                warn!(error = %e, "tick failed");
            }
            tokio::time::sleep(Duration::from_millis(self.config.tick_interval_ms)).await;
        }
        self.publish_run_status("stopping")?;
        self.publish_run_status("stopped")?;
        Ok(())
    }

    fn publish_run_status(&self, state: &str) -> Result<(), MeshError> {
        self.bus.publish(
            chrono::Utc::now().timestamp(),
            EventKind::RunStatus,
            EventPayload::RunStatus(RunStatusPayload {
                state: state.to_string(),
            }),
        )?;
        Ok(())
    }
}

/// Resolve a participant definition to its PID: an explicit Base58 PID or
/// the SHA-256 of a hex public key.
pub fn resolve_pid(pid: Option<&str>, public_key_hex: Option<&str>) -> Result<Pid, MeshError> {
    match (pid, public_key_hex) {
        (Some(p), _) => Pid::from_b58(p),
        (None, Some(hex_key)) => {
            let bytes = hex::decode(hex_key)
                .map_err(|e| MeshError::InvalidRequest(format!("bad public key hex: {e}")))?;
            Ok(creditmesh_crypto::pid_from_pubkey(&bytes))
        }
        (None, None) => Err(MeshError::InvalidRequest(
            "participant needs a pid or a public key".into(),
        )),
    }
}
