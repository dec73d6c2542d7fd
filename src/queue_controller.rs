//! Queue controller: state machine + rate calculator for one direction of
//! one WAN (spec §4.6).
//!
//! The 4-state vs. 3-state distinction is a configuration fact, not a type
//! hierarchy (spec §9) — `QueueState` always has four variants, and
//! `DirectionConfig::is_four_state()` gates whether SOFT_RED is ever
//! entered. The calculator is a pure function of `(state, current_rate,
//! delta, config)`; streak counters are carried in `QueueControllerState`
//! so purity holds without history outside the input record.

use crate::config::DirectionConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueState {
    Green,
    Yellow,
    SoftRed,
    Red,
}

/// Persisted/mutable per-direction state (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QueueControllerState {
    pub state: QueueState,
    pub current_rate_mbps: f64,
    pub green_streak: u32,
    pub soft_red_streak: u32,
    pub red_streak: u32,
}

impl QueueControllerState {
    /// A freshly created controller: GREEN, at ceiling (spec §3).
    pub fn initial(ceiling_mbps: f64) -> Self {
        QueueControllerState {
            state: QueueState::Green,
            current_rate_mbps: ceiling_mbps,
            green_streak: 0,
            soft_red_streak: 0,
            red_streak: 0,
        }
    }

    fn reset_streaks(&mut self) {
        self.green_streak = 0;
        self.soft_red_streak = 0;
        self.red_streak = 0;
    }
}

fn floor_of(state: QueueState, cfg: &DirectionConfig) -> f64 {
    match state {
        QueueState::Green => cfg.floor_green,
        QueueState::Yellow => cfg.floor_yellow,
        QueueState::SoftRed => cfg.effective_floor_soft_red(),
        QueueState::Red => cfg.floor_red,
    }
}

/// Degradation target for `delta` against config thresholds, as if starting
/// from GREEN (spec §4.6 transition table, GREEN row). Used both for
/// GREEN's own transitions and as the "how bad is it" classification that
/// every other state's degradation path falls through to.
fn degraded_target(
    delta: f64,
    target_bloat_ms: f64,
    warn_bloat_ms: f64,
    hard_red_bloat_ms: f64,
    four_state: bool,
) -> QueueState {
    if delta <= target_bloat_ms {
        QueueState::Green
    } else if delta <= warn_bloat_ms {
        QueueState::Yellow
    } else if delta <= hard_red_bloat_ms {
        if four_state {
            QueueState::SoftRed
        } else {
            QueueState::Red
        }
    } else {
        QueueState::Red
    }
}

/// One sequential recovery step toward GREEN: RED -> SOFT_RED -> YELLOW ->
/// GREEN, never a direct jump (spec §4.6).
fn recovery_step(state: QueueState, four_state: bool) -> QueueState {
    match state {
        QueueState::Red => {
            if four_state {
                QueueState::SoftRed
            } else {
                QueueState::Yellow
            }
        }
        QueueState::SoftRed => QueueState::Yellow,
        QueueState::Yellow => QueueState::Green,
        QueueState::Green => QueueState::Green,
    }
}

/// Advances the queue controller by one cycle. Pure: output depends only
/// on `state` and `cfg`/`delta`, per spec §4.6.
pub fn step(
    mut state: QueueControllerState,
    delta: f64,
    target_bloat_ms: f64,
    warn_bloat_ms: f64,
    hard_red_bloat_ms: f64,
    green_samples_required: u32,
    cfg: &DirectionConfig,
) -> QueueControllerState {
    let four_state = cfg.is_four_state();
    let target = degraded_target(
        delta,
        target_bloat_ms,
        warn_bloat_ms,
        hard_red_bloat_ms,
        four_state,
    );
    let state_before = state.state;
    let is_degrading = rank(target) > rank(state_before);

    // Rate change only happens on two occasions: degradation, or a GREEN
    // streak hitting threshold (spec §4.6). Every other cycle leaves the
    // rate untouched except for the trailing clamp.
    let mut stepped_up = false;

    if is_degrading {
        // Degradation is immediate, no streak required.
        state.reset_streaks();
        state.state = target;
    } else if target == QueueState::Green {
        state.green_streak += 1;
        if state.green_streak >= green_samples_required {
            if state_before == QueueState::Green {
                stepped_up = true;
            } else {
                // Recovering: step sequentially toward GREEN, never a
                // direct jump.
                state.state = recovery_step(state_before, four_state);
            }
            state.green_streak = 0;
        }
    } else {
        // Still degraded but not worse (e.g. holding in YELLOW): no
        // streak progress, no state change.
        state.green_streak = 0;
    }

    state.current_rate_mbps = calculate_rate(
        state.state,
        state.current_rate_mbps,
        is_degrading,
        stepped_up,
        cfg,
    );

    state
}

/// Severity rank used to detect degradation (`target` worse than current).
fn rank(state: QueueState) -> u8 {
    match state {
        QueueState::Green => 0,
        QueueState::Yellow => 1,
        QueueState::SoftRed => 2,
        QueueState::Red => 3,
    }
}

/// Numeric encoding for the `cakepilot_queue_state` gauge. Shares the same
/// ordering as [`rank`] since both express the same severity scale.
pub fn state_code(state: QueueState) -> u64 {
    rank(state) as u64
}

fn calculate_rate(
    new_state: QueueState,
    current_rate: f64,
    degraded_this_cycle: bool,
    stepped_up_this_cycle: bool,
    cfg: &DirectionConfig,
) -> f64 {
    let mut rate = current_rate;
    if degraded_this_cycle {
        rate = (current_rate * cfg.factor_down).max(floor_of(new_state, cfg));
    } else if stepped_up_this_cycle {
        rate = (current_rate + cfg.step_up).min(cfg.ceiling);
    }
    // Clamp is the last operation, unconditionally, per spec §4.6.
    rate.max(floor_of(new_state, cfg)).min(cfg.ceiling)
}
