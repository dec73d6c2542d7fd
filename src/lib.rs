//! Adaptive per-WAN rate control and congestion-aware steering for
//! CAKE-backed multi-WAN edges.
//!
//! The crate is the coupled control plane described by the two binaries in
//! `src/bin/`: the autorate controller (one process per WAN) and the
//! steering controller (one process for the whole edge). Everything here
//! is a library so both binaries, and tests, can drive the same core.

pub mod assessor;
pub mod autorate;
pub mod baseline;
pub mod cake_stats;
pub mod clock;
pub mod config;
pub mod error;
pub mod fallback;
pub mod metrics;
pub mod queue_controller;
pub mod rate_limiter;
pub mod router;
pub mod rtt;
pub mod runner;
pub mod steering;
pub mod state_store;

use std::path::PathBuf;
use std::sync::Arc;

use clock::Clock;
use metrics::ControllerMetrics;
use router::RouterClient;
use rtt::RttMeasurer;
use runner::{install_signal_handler, CancellationFlag, CycleRunner, ProcessLock};

/// Collaborator paths the runner needs for one controller instance (spec
/// §6: "environment and paths ... consulted by the core").
pub struct Paths {
    pub state_path: PathBuf,
    pub lock_path: PathBuf,
}

/// Runs the autorate controller loop for one WAN until cancelled. This is
/// the public entrypoint named in spec §6:
/// `run(config, clock, router_client, rtt_measurer, stats_reader,
/// state_store)` — `stats_reader` and `state_store` are free functions
/// here rather than injected objects since they carry no state the
/// controller doesn't already own.
pub fn run_autorate(
    cfg: config::AutorateConfig,
    clock: Arc<dyn Clock>,
    router: Arc<dyn RouterClient>,
    rtt_measurer: RttMeasurer,
    paths: Paths,
    initial_baseline_ms: f64,
    lock_timeout: std::time::Duration,
    metrics: Arc<ControllerMetrics>,
) -> anyhow::Result<()> {
    let _lock = ProcessLock::acquire(&paths.lock_path, lock_timeout)?;

    let flag = CancellationFlag::new();
    install_signal_handler(flag.clone());

    let cycle_interval = cfg.cycle_interval;
    let mut controller = autorate::AutorateController::new(
        cfg,
        clock,
        router,
        rtt_measurer,
        paths.state_path,
        initial_baseline_ms,
        metrics,
    );

    let cycle_runner = CycleRunner::new(cycle_interval, flag);
    cycle_runner.run_until_cancelled(|| controller.run_cycle().success);

    Ok(())
}

/// Runs the steering controller loop until cancelled. See [`run_autorate`]
/// for the shape of the entrypoint contract.
pub fn run_steering(
    cfg: config::SteeringConfig,
    router: Arc<dyn RouterClient>,
    rtt_measurer: RttMeasurer,
    paths: Paths,
    primary_autorate_state_path: PathBuf,
    lock_timeout: std::time::Duration,
    metrics: Arc<ControllerMetrics>,
) -> anyhow::Result<()> {
    let _lock = ProcessLock::acquire(&paths.lock_path, lock_timeout)?;

    let flag = CancellationFlag::new();
    install_signal_handler(flag.clone());

    let cycle_interval = cfg.cycle_interval;
    let mut controller = steering::SteeringController::new(
        cfg,
        router,
        rtt_measurer,
        paths.state_path,
        primary_autorate_state_path,
        metrics,
    );

    let cycle_runner = CycleRunner::new(cycle_interval, flag);
    cycle_runner.run_until_cancelled(|| controller.run_cycle().success);

    Ok(())
}
