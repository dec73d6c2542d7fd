//! Cross-WAN steering state machine (spec §4.9): hysteretic GOOD/DEGRADED
//! transitions driving one RouterOS mangle rule, grounded in the teacher's
//! `ModemSupervisor` hysteresis pattern (degraded/recovery thresholds with
//! asymmetric sample counts before a transition fires).

use crate::assessor::{self, Assessment};
use crate::baseline;
use crate::cake_stats::{CakeStatsReader, QueueDeltas};
use crate::config::SteeringConfig;
use crate::metrics::ControllerMetrics;
use crate::router::{self, RouterClient};
use crate::rtt::RttMeasurer;
use crate::state_store::{self, SCHEMA_VERSION};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SteeringState {
    Good,
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub from: SteeringState,
    pub to: SteeringState,
    pub timestamp: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SteeringRuntimeState {
    pub schema_version: u32,
    pub current_state: SteeringState,
    pub red_count: u32,
    pub good_count: u32,
    pub rtt_delta_ewma: f64,
    pub queued_ewma: f64,
    pub cake_read_failures: u32,
    pub transitions: VecDeque<Transition>,
    pub timestamp: String,
}

impl state_store::Versioned for SteeringRuntimeState {
    fn schema_version(&self) -> u32 {
        self.schema_version
    }
}

impl SteeringRuntimeState {
    pub fn initial() -> Self {
        SteeringRuntimeState {
            schema_version: SCHEMA_VERSION,
            current_state: SteeringState::Good,
            red_count: 0,
            good_count: 0,
            rtt_delta_ewma: 0.0,
            queued_ewma: 0.0,
            cake_read_failures: 0,
            transitions: VecDeque::new(),
            timestamp: String::new(),
        }
    }
}

pub struct CycleOutcome {
    pub success: bool,
}

pub struct SteeringController {
    cfg: SteeringConfig,
    router: Arc<dyn RouterClient>,
    rtt_measurer: RttMeasurer,
    cake_reader: CakeStatsReader,
    state: SteeringRuntimeState,
    state_path: PathBuf,
    primary_autorate_state_path: PathBuf,
    last_known_baseline_ms: Option<f64>,
    metrics: Arc<ControllerMetrics>,
}

impl SteeringController {
    pub fn new(
        cfg: SteeringConfig,
        router: Arc<dyn RouterClient>,
        rtt_measurer: RttMeasurer,
        state_path: PathBuf,
        primary_autorate_state_path: PathBuf,
        metrics: Arc<ControllerMetrics>,
    ) -> Self {
        let state =
            state_store::load(&state_path).unwrap_or_else(SteeringRuntimeState::initial);
        SteeringController {
            cfg,
            router,
            rtt_measurer,
            cake_reader: CakeStatsReader::new(),
            state,
            state_path,
            primary_autorate_state_path,
            last_known_baseline_ms: None,
            metrics,
        }
    }

    pub fn state(&self) -> &SteeringRuntimeState {
        &self.state
    }

    /// Runs one steering cycle end to end (spec §4.9 steps 1-8).
    pub fn run_cycle(&mut self) -> CycleOutcome {
        // Step 1: load baseline.
        let Some(baseline_ms) = baseline::load(
            &self.primary_autorate_state_path,
            self.cfg.baseline_min_ms,
            self.cfg.baseline_max_ms,
            &self.metrics,
        ) else {
            warn!(primary = %self.cfg.primary_wan, "baseline unavailable this cycle, skipping");
            return CycleOutcome { success: true };
        };
        self.last_known_baseline_ms = Some(baseline_ms);

        // Step 2: measure RTT.
        let Some(sample) = self.rtt_measurer.measure() else {
            self.metrics.inc_ping_failure();
            warn!(primary = %self.cfg.primary_wan, "RTT measurement failed, skipping steering cycle");
            return CycleOutcome { success: true };
        };
        let rtt_delta = sample.rtt_ms - baseline_ms;

        // Step 3: CAKE stats, degrading to RTT-only on sustained failure.
        let deltas = self.read_cake_stats();

        // Step 4: smoothed EWMAs.
        self.state.rtt_delta_ewma =
            (1.0 - self.cfg.alpha_rtt_delta) * self.state.rtt_delta_ewma
                + self.cfg.alpha_rtt_delta * rtt_delta;
        let queued = deltas.queued_packets as f64;
        self.state.queued_ewma =
            (1.0 - self.cfg.alpha_queue) * self.state.queued_ewma + self.cfg.alpha_queue * queued;

        // Step 5: assess.
        let assessment = assessor::assess(
            self.state.rtt_delta_ewma,
            deltas.dropped_delta,
            self.state.queued_ewma,
            &self.cfg.thresholds,
        );

        // Step 6: hysteresis counters (Invariant S).
        match assessment {
            Assessment::Red => {
                self.state.red_count += 1;
                self.state.good_count = 0;
            }
            Assessment::Green => {
                self.state.good_count += 1;
                self.state.red_count = 0;
            }
            Assessment::Yellow => {
                // Hold state: counters unchanged.
            }
        }

        // Step 7: evaluate transitions.
        let success = self.evaluate_transition();

        // Step 8: persist.
        self.persist();

        CycleOutcome { success }
    }

    fn read_cake_stats(&mut self) -> QueueDeltas {
        let dl = self.router.get_queue_stats(&self.cfg.primary_download_queue);
        let ul = self.router.get_queue_stats(&self.cfg.primary_upload_queue);

        match (dl, ul) {
            (Some(dl), Some(ul)) => {
                self.state.cake_read_failures = 0;
                let dl_deltas = self
                    .cake_reader
                    .observe(&self.cfg.primary_download_queue, dl);
                let ul_deltas = self.cake_reader.observe(&self.cfg.primary_upload_queue, ul);
                QueueDeltas {
                    bytes_delta: dl_deltas.bytes_delta + ul_deltas.bytes_delta,
                    packets_delta: dl_deltas.packets_delta + ul_deltas.packets_delta,
                    dropped_delta: dl_deltas.dropped_delta + ul_deltas.dropped_delta,
                    queued_packets: dl_deltas.queued_packets + ul_deltas.queued_packets,
                }
            }
            _ => {
                self.metrics.inc_cake_read_failure();
                self.state.cake_read_failures += 1;
                if self.state.cake_read_failures == self.cfg.cake_read_failure_threshold {
                    warn!(
                        primary = %self.cfg.primary_wan,
                        failures = self.state.cake_read_failures,
                        "sustained CAKE read failures, degraded to RTT-only assessment"
                    );
                }
                QueueDeltas::default()
            }
        }
    }

    fn evaluate_transition(&mut self) -> bool {
        match self.state.current_state {
            SteeringState::Good if self.state.red_count >= self.cfg.red_samples_required => {
                match router::toggle_rule(&*self.router, &self.cfg.mangle_comment, true) {
                    Ok(()) => {
                        self.record_transition(SteeringState::Good, SteeringState::Degraded, "red_count threshold reached");
                        self.state.current_state = SteeringState::Degraded;
                        true
                    }
                    Err(err) => {
                        warn!(error = %err, "enable_rule failed, retaining counters without transition");
                        false
                    }
                }
            }
            SteeringState::Degraded if self.state.good_count >= self.cfg.green_samples_required => {
                match router::toggle_rule(&*self.router, &self.cfg.mangle_comment, false) {
                    Ok(()) => {
                        self.record_transition(SteeringState::Degraded, SteeringState::Good, "good_count threshold reached");
                        self.state.current_state = SteeringState::Good;
                        true
                    }
                    Err(err) => {
                        warn!(error = %err, "disable_rule failed, retaining counters without transition");
                        false
                    }
                }
            }
            _ => true,
        }
    }

    fn record_transition(&mut self, from: SteeringState, to: SteeringState, reason: &str) {
        info!(?from, ?to, reason, "steering transition");
        self.metrics.inc_steering_transition();
        self.state.transitions.push_back(Transition {
            from,
            to,
            timestamp: now_iso8601(),
            reason: reason.to_string(),
        });
        while self.state.transitions.len() > self.cfg.transition_history_len {
            self.state.transitions.pop_front();
        }
    }

    fn persist(&mut self) {
        self.state.timestamp = now_iso8601();
        self.metrics
            .steering_state
            .store(steering_state_code(self.state.current_state), Ordering::Relaxed);
        if let Err(err) = state_store::save(&self.state_path, &self.state) {
            warn!(error = %err, "steering state persistence failed");
        }
    }
}

/// Numeric encoding for the `cakepilot_steering_state` gauge (0=GOOD,
/// 1=DEGRADED).
fn steering_state_code(state: SteeringState) -> u64 {
    match state {
        SteeringState::Good => 0,
        SteeringState::Degraded => 1,
    }
}

fn now_iso8601() -> String {
    crate::clock::format_unix_utc(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
    )
}
