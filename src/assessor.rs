//! Congestion assessor: maps smoothed signals to GREEN/YELLOW/RED (spec
//! §4.8). Pure function — no state, no I/O. The "legacy vs CAKE-aware"
//! split the source kept in parallel methods collapses into this single
//! function, which falls back to RTT-only thresholds whenever drops/queue
//! data isn't available by passing `0` for those signals (per spec §9's
//! resolution of that open question).

use crate::config::AssessorThresholds;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assessment {
    Green,
    Yellow,
    Red,
}

/// Evaluated top to bottom: RED requires multi-signal agreement so an
/// ISP-only latency blip can't alone trigger steering (spec §4.8).
pub fn assess(
    rtt_delta_ewma: f64,
    drops_delta: u64,
    queued_ewma: f64,
    thresholds: &AssessorThresholds,
) -> Assessment {
    let queued = queued_ewma.max(0.0) as u64;

    if drops_delta >= thresholds.min_drops_red
        && rtt_delta_ewma >= thresholds.red_rtt_ms
        && queued >= thresholds.min_queue_red
    {
        Assessment::Red
    } else if rtt_delta_ewma >= thresholds.yellow_rtt_ms || queued >= thresholds.min_queue_yellow {
        Assessment::Yellow
    } else {
        Assessment::Green
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> AssessorThresholds {
        AssessorThresholds {
            green_rtt_ms: 10.0,
            yellow_rtt_ms: 30.0,
            red_rtt_ms: 60.0,
            min_drops_red: 5,
            min_queue_yellow: 20,
            min_queue_red: 50,
        }
    }

    #[test]
    fn calm_signals_are_green() {
        let t = thresholds();
        assert_eq!(assess(5.0, 0, 2.0, &t), Assessment::Green);
    }

    #[test]
    fn rtt_alone_past_yellow_is_yellow() {
        let t = thresholds();
        assert_eq!(assess(35.0, 0, 0.0, &t), Assessment::Yellow);
    }

    #[test]
    fn queue_alone_past_yellow_is_yellow() {
        let t = thresholds();
        assert_eq!(assess(0.0, 0, 25.0, &t), Assessment::Yellow);
    }

    #[test]
    fn all_three_signals_past_threshold_is_red() {
        let t = thresholds();
        assert_eq!(assess(95.0, 12, 72.0, &t), Assessment::Red);
    }

    /// Testable Property #7: without drops and with queue below the RED
    /// threshold, the assessor never returns RED, even with extreme RTT.
    #[test]
    fn no_drops_and_low_queue_never_reds_out() {
        let t = thresholds();
        assert_eq!(assess(10_000.0, 0, (t.min_queue_red - 1) as f64, &t), Assessment::Yellow);
    }

    #[test]
    fn rtt_blip_alone_insufficient_for_red() {
        let t = thresholds();
        // High RTT delta but zero drops and zero queue: ISP blip, not congestion.
        assert_eq!(assess(200.0, 0, 0.0, &t), Assessment::Yellow);
    }

    #[test]
    fn drops_without_rtt_or_queue_agreement_is_not_red() {
        let t = thresholds();
        assert_eq!(assess(5.0, 50, 0.0, &t), Assessment::Green);
    }

    #[test]
    fn boundary_at_red_thresholds_is_red() {
        let t = thresholds();
        assert_eq!(
            assess(t.red_rtt_ms, t.min_drops_red, t.min_queue_red as f64, &t),
            Assessment::Red
        );
    }
}
