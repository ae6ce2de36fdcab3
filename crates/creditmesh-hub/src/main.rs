//! creditmesh-hub — the community-hub coordinator binary.
//!
//! Startup sequence:
//!   1. Open (or initialise) the store; schema migrations run on open
//!   2. Load the scenario file (bootstrap topology + scheduled events)
//!   3. Build the orchestrator (router, engines, event bus)
//!   4. Run the tick loop
//!   5. Log a state summary and exit

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use creditmesh_core::constants::{DEFAULT_TICK_BUDGET_MS, DEFAULT_TICK_INTERVAL_MS};
use creditmesh_core::scenario::Scenario;
use creditmesh_engine::HubMetrics;
use creditmesh_hub::{HubConfig, Orchestrator};
use creditmesh_store::Store;

#[derive(Parser, Debug)]
#[command(
    name = "creditmesh-hub",
    version,
    about = "creditmesh community hub — mutual-credit graph ledger coordinator"
)]
struct Args {
    /// Directory for the persistent store.
    #[arg(long, default_value = "~/.creditmesh/data")]
    data_dir: PathBuf,

    /// Scenario JSON (bootstrap topology + scheduled events).
    #[arg(long)]
    scenario: Option<PathBuf>,

    /// Number of ticks to run before exiting.
    #[arg(long, default_value_t = 60)]
    ticks: u64,

    /// Tick cadence in milliseconds.
    #[arg(long, default_value_t = DEFAULT_TICK_INTERVAL_MS)]
    tick_interval_ms: u64,

    /// Wall-clock budget per tick in milliseconds.
    #[arg(long, default_value_t = DEFAULT_TICK_BUDGET_MS)]
    tick_budget_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,creditmesh=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    info!("creditmesh hub starting");

    let data_dir = expand_tilde(&args.data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;
    let store = Arc::new(Store::open(&data_dir).context("opening store")?);

    let scenario = load_scenario(args.scenario.as_deref())?;
    let config = HubConfig {
        tick_budget_ms: args.tick_budget_ms,
        tick_interval_ms: args.tick_interval_ms,
    };
    let now = chrono::Utc::now().timestamp();
    let mut orchestrator =
        Orchestrator::new(Arc::clone(&store), scenario, config, now).context("building hub")?;

    info!(ticks = args.ticks, "hub ready");
    orchestrator.run(args.ticks).await.context("tick loop")?;

    let snapshot = store.snapshot(None).context("reading final snapshot")?;
    let metrics = &orchestrator.metrics;
    info!(
        participants = snapshot.participants.len(),
        trustlines = snapshot.trustlines.len(),
        debts = snapshot.debts.len(),
        payments_committed = HubMetrics::get(&metrics.payments_committed),
        payments_failed = HubMetrics::get(&metrics.payments_failed),
        cycles_cleared = HubMetrics::get(&metrics.cycles_cleared),
        decay_updates = HubMetrics::get(&metrics.decay_updates),
        ticks_over_budget = HubMetrics::get(&metrics.ticks_over_budget),
        "hub stopped"
    );
    Ok(())
}

fn load_scenario(path: Option<&Path>) -> anyhow::Result<Scenario> {
    let Some(path) = path else {
        info!("no --scenario provided; starting with an empty topology");
        return Ok(Scenario::default());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading scenario from {}", path.display()))?;
    serde_json::from_str(&json).context("parsing scenario JSON")
}

/// Expand a leading `~` to the user's home directory (`HOME` or `USERPROFILE`).
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
            return PathBuf::from(home).join(stripped);
        }
    }
    path.to_path_buf()
}
