//! ─── creditmesh protocol constants ──────────────────────────────────────────
//!
//! Defaults for the routing, clearing, and drift knobs. Every one of these
//! can be overridden per scenario; the values here are the deployment
//! defaults for a small community hub.

// ── Routing ──────────────────────────────────────────────────────────────────

/// Max candidate paths considered per payment.
pub const DEFAULT_K_MAX: usize = 4;

/// Max hops on a single routing path.
pub const DEFAULT_HOP_MAX: usize = 6;

// ── Clearing ─────────────────────────────────────────────────────────────────

/// On-tick cycle search bound: cycles of length 3–4 are cheap enough to
/// look for after every tick.
pub const DEFAULT_CYCLE_LEN_MAX: usize = 4;

/// Deep-pass cycle search bound (lengths 5–6), run on a periodic cadence.
pub const DEFAULT_DEEP_CYCLE_LEN_MAX: usize = 6;

/// Deep-pass cadence, in ticks.
pub const DEFAULT_DEEP_EVERY_N_TICKS: u64 = 10;

/// Hard cap on cycles processed in one clearing run.
pub const DEFAULT_MAX_CYCLES_PER_RUN: usize = 64;

/// Wall-clock budget for one clearing run, milliseconds.
pub const DEFAULT_TIME_BUDGET_MS: u64 = 250;

// ── Trust drift ──────────────────────────────────────────────────────────────

/// Growth multiplier in basis points: 11_000 = limit × 1.10 per step.
pub const DEFAULT_GROWTH_BP: u32 = 11_000;

/// Cleared volume inside the window that qualifies an edge for growth.
pub const DEFAULT_GROWTH_THRESHOLD_ATOMS: u64 = 1;

/// Sliding window for cleared-volume accounting: 7 days.
pub const DEFAULT_GROWTH_WINDOW_SECS: i64 = 7 * 24 * 3600;

/// Minimum spacing between growth steps on one edge: 1 day.
pub const DEFAULT_GROWTH_COOLDOWN_SECS: i64 = 24 * 3600;

/// Decay multiplier in basis points: 9_000 = limit × 0.90 per decay tick.
pub const DEFAULT_DECAY_BP: u32 = 9_000;

/// Idle threshold before decay starts: 30 days of `used == 0`.
pub const DEFAULT_IDLE_SECS: i64 = 30 * 24 * 3600;

/// Decay floor in atoms; the per-edge floor is `max(used, limit_min)`.
pub const DEFAULT_LIMIT_MIN_ATOMS: u64 = 0;

// ── Orchestrator ─────────────────────────────────────────────────────────────

/// Wall-clock budget for a whole tick, milliseconds.
pub const DEFAULT_TICK_BUDGET_MS: u64 = 1_000;

/// Tick cadence for the free-running hub binary, milliseconds.
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;

// ── Event bus ────────────────────────────────────────────────────────────────

/// Bounded per-subscriber queue depth. A subscriber that falls this far
/// behind is disconnected with a `lost` sentinel.
pub const DEFAULT_SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

// ── Limits ───────────────────────────────────────────────────────────────────

/// Longest accepted equivalent code.
pub const MAX_EQUIVALENT_CODE_LEN: usize = 32;

/// Highest accepted decimal precision (keeps atom math inside u128).
pub const MAX_EQUIVALENT_PRECISION: u32 = 18;

/// Store schema version; bumped by migrations.
pub const SCHEMA_VERSION: u32 = 1;
