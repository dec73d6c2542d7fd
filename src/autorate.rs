//! Per-WAN autorate controller (spec §4.7): measure -> EWMA -> queue
//! controllers -> change-detect -> rate limiter -> router write -> persist.

use crate::clock::Clock;
use crate::config::AutorateConfig;
use crate::fallback::{FallbackOutcome, FallbackState};
use crate::metrics::ControllerMetrics;
use crate::queue_controller::{self, QueueControllerState};
use crate::rate_limiter::RateLimiter;
use crate::router::RouterClient;
use crate::rtt::RttMeasurer;
use crate::state_store::{self, SCHEMA_VERSION};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// An absolute clamp on RTT/EWMA values (spec §9): protects against a
/// single corrupt ping result poisoning the baseline for hours.
const EWMA_ABSOLUTE_MAX_MS: f64 = 1000.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LastApplied {
    download_mbps: f64,
    upload_mbps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutorateState {
    pub schema_version: u32,
    pub wan_name: String,
    pub baseline_rtt_ms: f64,
    pub load_rtt_ms: f64,
    pub download: QueueControllerState,
    pub upload: QueueControllerState,
    last_applied: LastApplied,
    pub icmp_unavailable_cycles: u32,
    pub timestamp: String,
}

impl state_store::Versioned for AutorateState {
    fn schema_version(&self) -> u32 {
        self.schema_version
    }
}

impl AutorateState {
    pub fn initial(cfg: &AutorateConfig, initial_baseline_ms: f64) -> Self {
        AutorateState {
            schema_version: SCHEMA_VERSION,
            wan_name: cfg.wan_name.clone(),
            baseline_rtt_ms: initial_baseline_ms,
            load_rtt_ms: initial_baseline_ms,
            download: QueueControllerState::initial(cfg.download.ceiling),
            upload: QueueControllerState::initial(cfg.upload.ceiling),
            last_applied: LastApplied {
                download_mbps: cfg.download.ceiling,
                upload_mbps: cfg.upload.ceiling,
            },
            icmp_unavailable_cycles: 0,
            timestamp: String::new(),
        }
    }
}

pub struct CycleOutcome {
    pub success: bool,
}

pub struct AutorateController {
    cfg: AutorateConfig,
    clock: Arc<dyn Clock>,
    router: Arc<dyn RouterClient>,
    rtt_measurer: RttMeasurer,
    rate_limiter: RateLimiter,
    fallback: FallbackState,
    state: AutorateState,
    state_path: PathBuf,
    metrics: Arc<ControllerMetrics>,
}

impl AutorateController {
    pub fn new(
        cfg: AutorateConfig,
        clock: Arc<dyn Clock>,
        router: Arc<dyn RouterClient>,
        rtt_measurer: RttMeasurer,
        state_path: PathBuf,
        initial_baseline_ms: f64,
        metrics: Arc<ControllerMetrics>,
    ) -> Self {
        let rate_limiter = RateLimiter::new(
            Arc::clone(&clock),
            cfg.rate_limit_window,
            cfg.rate_limit_max_changes,
        );
        let fallback = FallbackState::new(cfg.fallback_policy, cfg.max_fallback_cycles);
        let state = state_store::load(&state_path)
            .unwrap_or_else(|| AutorateState::initial(&cfg, initial_baseline_ms));

        AutorateController {
            cfg,
            clock,
            router,
            rtt_measurer,
            rate_limiter,
            fallback,
            state,
            state_path,
            metrics,
        }
    }

    pub fn state(&self) -> &AutorateState {
        &self.state
    }

    /// Runs one autorate cycle end to end (spec §4.7 steps 1-6).
    pub fn run_cycle(&mut self) -> CycleOutcome {
        self.run_cycle_with_fallback_probe(|| (false, false))
    }

    /// Same as [`run_cycle`](Self::run_cycle) but lets the caller (or a
    /// test) inject the gateway/TCP reachability probes used by the
    /// fallback cascade instead of hitting the real network.
    pub fn run_cycle_with_fallback_probe(
        &mut self,
        probe: impl FnOnce() -> (bool, bool),
    ) -> CycleOutcome {
        // Step 1: measure, falling back on total failure.
        let rtt_ms = match self.rtt_measurer.measure() {
            Some(sample) => {
                self.fallback.record_valid_rtt(self.state.load_rtt_ms);
                self.state.icmp_unavailable_cycles = 0;
                Some(sample.rtt_ms)
            }
            None => {
                self.metrics.inc_ping_failure();
                let (gateway_ok, tcp_ok) = probe();
                let outcome = self.fallback.decide(gateway_ok, tcp_ok);
                self.state.icmp_unavailable_cycles = self.fallback.consecutive_unavailable_cycles();
                match self.apply_fallback(outcome) {
                    Some(rtt) => Some(rtt),
                    None => {
                        self.persist();
                        return CycleOutcome {
                            success: outcome.should_continue,
                        };
                    }
                }
            }
        };

        let Some(rtt_ms) = rtt_ms else {
            self.persist();
            return CycleOutcome { success: true };
        };

        if !rtt_ms.is_finite() || rtt_ms.abs() > EWMA_ABSOLUTE_MAX_MS * 10.0 {
            warn!(wan_name = %self.cfg.wan_name, rtt_ms, "numeric fault in RTT sample, treating as measurement failure");
            self.persist();
            return CycleOutcome { success: true };
        }

        // Step 2: EWMA updates, Invariant E baseline freeze.
        self.state.load_rtt_ms = clamp_ewma(
            (1.0 - self.cfg.alpha_load) * self.state.load_rtt_ms + self.cfg.alpha_load * rtt_ms,
        );
        let delta = self.state.load_rtt_ms - self.state.baseline_rtt_ms;
        if delta < self.cfg.baseline_update_threshold_ms {
            self.state.baseline_rtt_ms = clamp_ewma(
                (1.0 - self.cfg.alpha_baseline) * self.state.baseline_rtt_ms
                    + self.cfg.alpha_baseline * rtt_ms,
            );
        } else {
            debug!(wan_name = %self.cfg.wan_name, delta, "baseline frozen this cycle (Invariant E)");
        }

        // Step 3: queue controllers.
        self.state.download = queue_controller::step(
            self.state.download,
            delta,
            self.cfg.target_bloat_ms,
            self.cfg.warn_bloat_ms,
            self.cfg.hard_red_bloat_ms,
            green_samples_required(&self.cfg),
            &self.cfg.download,
        );
        self.state.upload = queue_controller::step(
            self.state.upload,
            delta,
            self.cfg.target_bloat_ms,
            self.cfg.warn_bloat_ms,
            self.cfg.hard_red_bloat_ms,
            green_samples_required(&self.cfg),
            &self.cfg.upload,
        );

        // Step 4: change-detect.
        let dl_rate = self.state.download.current_rate_mbps;
        let ul_rate = self.state.upload.current_rate_mbps;
        let changed = (dl_rate - self.state.last_applied.download_mbps).abs() > f64::EPSILON
            || (ul_rate - self.state.last_applied.upload_mbps).abs() > f64::EPSILON;

        if !changed {
            self.persist();
            return CycleOutcome { success: true };
        }

        if !self.rate_limiter.can_change() {
            warn!(wan_name = %self.cfg.wan_name, "rate-limit window exhausted, skipping router write");
            self.metrics.inc_rate_limit_throttled();
            self.persist();
            return CycleOutcome { success: true };
        }

        // Step 5: router write.
        match self.router.set_rate_limits(
            &queue_name(&self.cfg.wan_name, "download"),
            &queue_name(&self.cfg.wan_name, "upload"),
            dl_rate,
            ul_rate,
        ) {
            Ok(()) => {
                self.metrics.inc_router_write(true);
                self.rate_limiter.record_change();
                self.state.last_applied = LastApplied {
                    download_mbps: dl_rate,
                    upload_mbps: ul_rate,
                };
                info!(wan_name = %self.cfg.wan_name, dl_rate, ul_rate, "applied new rate limits");
                self.persist();
                CycleOutcome { success: true }
            }
            Err(err) => {
                self.metrics.inc_router_write(false);
                warn!(wan_name = %self.cfg.wan_name, error = %err, "router write failed");
                self.persist();
                CycleOutcome { success: false }
            }
        }
    }

    /// Applies a fallback outcome, returning `Some(rtt)` if the cycle
    /// should proceed with that RTT, or `None` if the cycle is done
    /// (frozen or total loss) without going through EWMA/queue steps.
    fn apply_fallback(&mut self, outcome: FallbackOutcome) -> Option<f64> {
        if !outcome.should_continue {
            info!(wan_name = %self.cfg.wan_name, "fallback: total loss or cycle budget exhausted, no rate change");
            return None;
        }
        match outcome.rtt_to_use {
            Some(rtt) => Some(rtt),
            None => None, // freeze: proceed no further this cycle
        }
    }

    fn persist(&mut self) {
        self.state.timestamp = now_iso8601(&*self.clock);
        self.metrics.download_rate_mbps.set(self.state.download.current_rate_mbps);
        self.metrics.upload_rate_mbps.set(self.state.upload.current_rate_mbps);
        self.metrics
            .queue_state_download
            .store(queue_controller::state_code(self.state.download.state), Ordering::Relaxed);
        self.metrics
            .queue_state_upload
            .store(queue_controller::state_code(self.state.upload.state), Ordering::Relaxed);
        if let Err(err) = state_store::save(&self.state_path, &self.state) {
            warn!(wan_name = %self.cfg.wan_name, error = %err, "state persistence failed");
        }
    }
}

fn green_samples_required(cfg: &AutorateConfig) -> u32 {
    // The spec names this constant only on the steering side explicitly;
    // for autorate recovery it is the same "N_green" streak concept,
    // derived from how many cycles at alpha_load it takes load_rtt to
    // settle back near baseline. A fixed, config-independent streak keeps
    // recovery conservative without adding another knob the spec doesn't
    // name.
    let _ = cfg;
    5
}

fn queue_name(wan_name: &str, direction: &str) -> String {
    format!("{wan_name}-{direction}")
}

fn clamp_ewma(value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    value.clamp(-EWMA_ABSOLUTE_MAX_MS, EWMA_ABSOLUTE_MAX_MS)
}

fn now_iso8601(clock: &dyn Clock) -> String {
    // The persisted timestamp is informational only — nothing in the core
    // parses it back out — so a wall-clock read here doesn't compromise the
    // monotonic-clock discipline the rate limiter and fallback cycle rely
    // on elsewhere.
    let _ = clock;
    crate::clock::format_unix_utc(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
    )
}
