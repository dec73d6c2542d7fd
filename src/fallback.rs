//! Connectivity fallback cascade (spec §4.10), invoked whenever the
//! primary RTT measurement returns `None`.

use crate::config::FallbackPolicy;
use crate::rtt::Pinger;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

const TCP_PROBE_TIMEOUT: Duration = Duration::from_millis(500);
const TCP_PROBE_TARGETS: [(&str, u16); 3] =
    [("1.1.1.1", 443), ("8.8.8.8", 443), ("9.9.9.9", 443)];

/// Outcome of a fallback decision for the current cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FallbackOutcome {
    pub should_continue: bool,
    pub rtt_to_use: Option<f64>,
}

impl FallbackOutcome {
    /// The required response for confirmed total connectivity loss (spec
    /// §4.10 safety rule): no rate change, no stale-data recovery.
    pub fn total_loss() -> Self {
        FallbackOutcome {
            should_continue: false,
            rtt_to_use: None,
        }
    }
}

/// Attempts a TCP connect to any of the configured probe targets with a
/// short timeout. Any success means the WAN is reachable even if ICMP is
/// filtered (spec §4.10 step 2).
pub fn tcp_probe_reachable() -> bool {
    TCP_PROBE_TARGETS.iter().any(|&(host, port)| {
        (host, port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .and_then(|addr| TcpStream::connect_timeout(&addr, TCP_PROBE_TIMEOUT).ok())
            .is_some()
    })
}

/// Decides how to handle a cycle whose RTT measurement failed. `gateway`
/// is pinged first (WAN-side vs local-side outage); on total loss the
/// safety rule in spec §4.10 applies unconditionally.
pub struct FallbackState {
    policy: FallbackPolicy,
    max_fallback_cycles: u32,
    consecutive_unavailable: u32,
    last_valid_load_rtt: Option<f64>,
}

impl FallbackState {
    pub fn new(policy: FallbackPolicy, max_fallback_cycles: u32) -> Self {
        FallbackState {
            policy,
            max_fallback_cycles,
            consecutive_unavailable: 0,
            last_valid_load_rtt: None,
        }
    }

    pub fn record_valid_rtt(&mut self, load_rtt_ms: f64) {
        self.last_valid_load_rtt = Some(load_rtt_ms);
        self.consecutive_unavailable = 0;
    }

    pub fn consecutive_unavailable_cycles(&self) -> u32 {
        self.consecutive_unavailable
    }

    /// Runs the gateway/TCP probe cascade and applies the configured
    /// policy. `gateway_reachable` and `tcp_reachable` are injected so
    /// tests don't touch the network; production callers pass real probe
    /// results.
    pub fn decide(&mut self, gateway_reachable: bool, tcp_reachable: bool) -> FallbackOutcome {
        self.consecutive_unavailable += 1;

        let wan_reachable = gateway_reachable || tcp_reachable;
        if !wan_reachable {
            // Total connectivity loss: safety rule overrides policy.
            return FallbackOutcome::total_loss();
        }

        match self.policy {
            FallbackPolicy::Freeze => FallbackOutcome {
                should_continue: true,
                rtt_to_use: None,
            },
            FallbackPolicy::UseLastRtt => FallbackOutcome {
                should_continue: true,
                rtt_to_use: self.last_valid_load_rtt,
            },
            FallbackPolicy::GracefulDegradation => {
                if self.consecutive_unavailable == 1 {
                    FallbackOutcome {
                        should_continue: true,
                        rtt_to_use: self.last_valid_load_rtt,
                    }
                } else if self.consecutive_unavailable < self.max_fallback_cycles {
                    FallbackOutcome {
                        should_continue: true,
                        rtt_to_use: None,
                    }
                } else {
                    FallbackOutcome {
                        should_continue: false,
                        rtt_to_use: None,
                    }
                }
            }
        }
    }
}

/// Pings `gateway_addr` once as the first step of the cascade (spec §4.10
/// step 1). A thin wrapper around `Pinger` so the runner can reuse the
/// same collaborator used for reflector RTT.
pub fn gateway_reachable(pinger: &dyn Pinger, gateway_addr: &str, timeout: Duration) -> bool {
    pinger.ping(gateway_addr, timeout).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtt::fakes::FakePinger;

    #[test]
    fn total_loss_returns_required_safe_default() {
        let mut fb = FallbackState::new(FallbackPolicy::GracefulDegradation, 4);
        fb.record_valid_rtt(25.0);
        let outcome = fb.decide(false, false);
        assert_eq!(outcome, FallbackOutcome::total_loss());
    }

    #[test]
    fn freeze_policy_never_returns_rtt() {
        let mut fb = FallbackState::new(FallbackPolicy::Freeze, 4);
        fb.record_valid_rtt(25.0);
        let outcome = fb.decide(true, false);
        assert!(outcome.should_continue);
        assert_eq!(outcome.rtt_to_use, None);
    }

    #[test]
    fn use_last_rtt_policy_reuses_last_known_good() {
        let mut fb = FallbackState::new(FallbackPolicy::UseLastRtt, 4);
        fb.record_valid_rtt(31.5);
        let outcome = fb.decide(true, false);
        assert!(outcome.should_continue);
        assert_eq!(outcome.rtt_to_use, Some(31.5));
    }

    /// Scenario C: graceful_degradation over 4 consecutive ICMP-unavailable
    /// cycles with TCP reachable.
    #[test]
    fn graceful_degradation_scenario_c() {
        let mut fb = FallbackState::new(FallbackPolicy::GracefulDegradation, 4);
        fb.record_valid_rtt(25.0);

        let c1 = fb.decide(false, true);
        assert!(c1.should_continue);
        assert_eq!(c1.rtt_to_use, Some(25.0));

        let c2 = fb.decide(false, true);
        assert!(c2.should_continue);
        assert_eq!(c2.rtt_to_use, None);

        let c3 = fb.decide(false, true);
        assert!(c3.should_continue);
        assert_eq!(c3.rtt_to_use, None);

        let c4 = fb.decide(false, true);
        assert!(!c4.should_continue);
        assert_eq!(fb.consecutive_unavailable_cycles(), 4);
    }

    #[test]
    fn recovering_resets_consecutive_counter() {
        let mut fb = FallbackState::new(FallbackPolicy::GracefulDegradation, 4);
        fb.record_valid_rtt(25.0);
        fb.decide(false, true);
        fb.decide(false, true);
        assert_eq!(fb.consecutive_unavailable_cycles(), 2);
        fb.record_valid_rtt(26.0);
        assert_eq!(fb.consecutive_unavailable_cycles(), 0);
    }

    #[test]
    fn gateway_reachable_delegates_to_pinger() {
        let pinger = FakePinger::new();
        pinger.set("192.168.1.1", Some(1.0));
        assert!(gateway_reachable(&pinger, "192.168.1.1", Duration::from_millis(200)));
        pinger.set("192.168.1.1", None);
        assert!(!gateway_reachable(&pinger, "192.168.1.1", Duration::from_millis(200)));
    }
}
