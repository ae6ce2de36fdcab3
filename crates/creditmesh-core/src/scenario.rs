//! Scenario files: the community bootstrap plus scheduled inject events
//! and payments, parsed from JSON. PIDs and amounts appear in wire form
//! (Base58 / decimal strings) and are resolved against the store when the
//! event fires.

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_CYCLE_LEN_MAX, DEFAULT_DECAY_BP, DEFAULT_DEEP_CYCLE_LEN_MAX,
    DEFAULT_DEEP_EVERY_N_TICKS, DEFAULT_GROWTH_BP, DEFAULT_GROWTH_COOLDOWN_SECS,
    DEFAULT_GROWTH_THRESHOLD_ATOMS, DEFAULT_GROWTH_WINDOW_SECS, DEFAULT_HOP_MAX,
    DEFAULT_IDLE_SECS, DEFAULT_K_MAX, DEFAULT_LIMIT_MIN_ATOMS, DEFAULT_MAX_CYCLES_PER_RUN,
    DEFAULT_TIME_BUDGET_MS,
};
use crate::types::Tick;

// ── Bootstrap definitions ────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EquivalentDef {
    pub code: String,
    pub precision: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParticipantDef {
    /// Base58 PID, or a raw public key under `public_key_hex` from which
    /// the PID is derived.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key_hex: Option<String>,
    pub display_name: String,
    #[serde(default = "default_kind")]
    pub kind: String,
}

fn default_kind() -> String {
    "person".into()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrustLineDef {
    pub from: String,
    pub to: String,
    pub equivalent: String,
    /// Decimal string in the equivalent's precision.
    pub limit: String,
}

// ── Scheduled work ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScheduledPayment {
    pub at_tick: Tick,
    pub tx_id: String,
    pub from: String,
    pub to: String,
    pub equivalent: String,
    pub amount: String,
}

/// One scheduled topology mutation. `index` is the executor's idempotency
/// marker: fired indices are persisted so a replayed scenario skips them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScenarioEvent {
    pub index: u64,
    pub at_tick: Tick,
    #[serde(flatten)]
    pub op: InjectOp,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum InjectOp {
    AddParticipant {
        pid: String,
        #[serde(default = "default_kind")]
        kind: String,
        display_name: String,
        #[serde(default)]
        initial_trustlines: Vec<TrustLineDef>,
    },
    CreateTrustline {
        from: String,
        to: String,
        equivalent: String,
        limit: String,
    },
    CloseTrustline {
        from: String,
        to: String,
        equivalent: String,
    },
    FreezeParticipant {
        pid: String,
    },
    InjectDebt {
        debtor: String,
        creditor: String,
        equivalent: String,
        amount: String,
    },
    Note {
        message: String,
    },
}

// ── Engine configuration ─────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Max candidate paths per request.
    #[serde(default = "d_k_max")]
    pub k_max: usize,
    /// Max hops per path.
    #[serde(default = "d_hop_max")]
    pub hop_max: usize,
    /// Minimum share routable over a single path, in atoms.
    #[serde(default = "d_min_share")]
    pub min_path_share_atoms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClearingConfig {
    /// Cycle length bound for the after-tick search.
    #[serde(default = "d_cycle_len")]
    pub cycle_len_max: usize,
    /// Cycle length bound for the periodic deep search.
    #[serde(default = "d_deep_cycle_len")]
    pub deep_cycle_len_max: usize,
    /// Deep search cadence, in ticks.
    #[serde(default = "d_deep_every")]
    pub deep_every_n_ticks: u64,
    #[serde(default = "d_max_cycles")]
    pub max_cycles_per_run: usize,
    #[serde(default = "d_time_budget")]
    pub time_budget_ms: u64,
}

/// Growth and decay knobs. Factors are basis points of the current limit
/// (10_000 = ×1.0) so drift arithmetic stays exact in integers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DriftConfig {
    /// Growth multiplier applied to limits on well-used edges (> 10_000).
    #[serde(default = "d_growth_bp")]
    pub growth_bp: u32,
    /// Cleared volume within the window that qualifies an edge for growth.
    #[serde(default = "d_growth_threshold")]
    pub growth_threshold_atoms: u64,
    /// Sliding window for cleared-volume accounting, seconds.
    #[serde(default = "d_growth_window")]
    pub growth_window_secs: i64,
    /// Minimum seconds between two growth steps on one edge.
    #[serde(default = "d_growth_cooldown")]
    pub growth_cooldown_secs: i64,
    /// Hard ceiling for grown limits, atoms. None = uncapped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_max_atoms: Option<u64>,
    /// Decay multiplier applied to idle limits (< 10_000).
    #[serde(default = "d_decay_bp")]
    pub decay_bp: u32,
    /// Seconds of `used == 0` idleness before decay starts.
    #[serde(default = "d_idle_secs")]
    pub idle_secs: i64,
    /// Decay floor, atoms. The effective floor per edge is
    /// `max(used, limit_min_atoms)`.
    #[serde(default = "d_limit_min")]
    pub limit_min_atoms: u64,
}

fn d_k_max() -> usize {
    DEFAULT_K_MAX
}
fn d_hop_max() -> usize {
    DEFAULT_HOP_MAX
}
fn d_min_share() -> u64 {
    1
}
fn d_cycle_len() -> usize {
    DEFAULT_CYCLE_LEN_MAX
}
fn d_deep_cycle_len() -> usize {
    DEFAULT_DEEP_CYCLE_LEN_MAX
}
fn d_deep_every() -> u64 {
    DEFAULT_DEEP_EVERY_N_TICKS
}
fn d_max_cycles() -> usize {
    DEFAULT_MAX_CYCLES_PER_RUN
}
fn d_time_budget() -> u64 {
    DEFAULT_TIME_BUDGET_MS
}
fn d_growth_bp() -> u32 {
    DEFAULT_GROWTH_BP
}
fn d_growth_threshold() -> u64 {
    DEFAULT_GROWTH_THRESHOLD_ATOMS
}
fn d_growth_window() -> i64 {
    DEFAULT_GROWTH_WINDOW_SECS
}
fn d_growth_cooldown() -> i64 {
    DEFAULT_GROWTH_COOLDOWN_SECS
}
fn d_decay_bp() -> u32 {
    DEFAULT_DECAY_BP
}
fn d_idle_secs() -> i64 {
    DEFAULT_IDLE_SECS
}
fn d_limit_min() -> u64 {
    DEFAULT_LIMIT_MIN_ATOMS
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            k_max: d_k_max(),
            hop_max: d_hop_max(),
            min_path_share_atoms: d_min_share(),
        }
    }
}

impl Default for ClearingConfig {
    fn default() -> Self {
        Self {
            cycle_len_max: d_cycle_len(),
            deep_cycle_len_max: d_deep_cycle_len(),
            deep_every_n_ticks: d_deep_every(),
            max_cycles_per_run: d_max_cycles(),
            time_budget_ms: d_time_budget(),
        }
    }
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            growth_bp: d_growth_bp(),
            growth_threshold_atoms: d_growth_threshold(),
            growth_window_secs: d_growth_window(),
            growth_cooldown_secs: d_growth_cooldown(),
            limit_max_atoms: None,
            decay_bp: d_decay_bp(),
            idle_secs: d_idle_secs(),
            limit_min_atoms: d_limit_min(),
        }
    }
}

// ── Scenario ─────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub equivalents: Vec<EquivalentDef>,
    #[serde(default)]
    pub participants: Vec<ParticipantDef>,
    #[serde(default)]
    pub trustlines: Vec<TrustLineDef>,
    #[serde(default)]
    pub router: Option<RouterConfig>,
    #[serde(default)]
    pub clearing: Option<ClearingConfig>,
    #[serde(default)]
    pub drift: Option<DriftConfig>,
    #[serde(default)]
    pub payments: Vec<ScheduledPayment>,
    #[serde(default)]
    pub events: Vec<ScenarioEvent>,
}

impl Scenario {
    /// Scheduled inject events due at or before `tick`, in index order.
    pub fn events_due(&self, tick: Tick) -> impl Iterator<Item = &ScenarioEvent> {
        let mut due: Vec<&ScenarioEvent> =
            self.events.iter().filter(|e| e.at_tick <= tick).collect();
        due.sort_by_key(|e| e.index);
        due.into_iter()
    }

    pub fn payments_due(&self, tick: Tick) -> impl Iterator<Item = &ScheduledPayment> {
        self.payments.iter().filter(move |p| p.at_tick == tick)
    }
}
