//! # Controller Metrics
//!
//! Tagged counters/gauges for the autorate and steering controllers,
//! rendered in Prometheus text exposition format — a pure function over a
//! snapshot struct, no global registry, following the teacher's
//! `render_prometheus` pattern. Also provides a minimal hand-rolled
//! `/metrics` HTTP server, grounded in the teacher's
//! `bin/strata_receiver.rs::run_metrics_server` (no web framework).

use std::fmt::Write as FmtWrite;
use std::io::{Read, Write as IoWrite};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

/// Process-wide counters/gauges a single controller process updates over
/// its lifetime (spec §7: "all error kinds are observable via tagged
/// metrics").
#[derive(Default)]
pub struct ControllerMetrics {
    pub ping_failure_total: AtomicU64,
    pub router_write_total: AtomicU64,
    pub router_write_failure_total: AtomicU64,
    pub rate_limit_throttled_total: AtomicU64,
    pub cake_read_failure_total: AtomicU64,
    pub baseline_reject_total: AtomicU64,
    pub steering_transition_total: AtomicU64,

    pub download_rate_mbps: AtomicU64Bits,
    pub upload_rate_mbps: AtomicU64Bits,
    pub queue_state_download: AtomicU64,
    pub queue_state_upload: AtomicU64,
    pub steering_state: AtomicU64,
}

/// An `AtomicU64` used to store an `f64` bit pattern, since `std` has no
/// `AtomicF64`. Only ever read back through `f64::from_bits`.
#[derive(Default)]
pub struct AtomicU64Bits(AtomicU64);

impl AtomicU64Bits {
    pub fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

impl ControllerMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inc_ping_failure(&self) {
        self.ping_failure_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_router_write(&self, success: bool) {
        self.router_write_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.router_write_failure_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn inc_rate_limit_throttled(&self) {
        self.rate_limit_throttled_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cake_read_failure(&self) {
        self.cake_read_failure_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_baseline_reject(&self) {
        self.baseline_reject_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_steering_transition(&self) {
        self.steering_transition_total.fetch_add(1, Ordering::Relaxed);
    }
}

fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

/// Renders the full metric set in Prometheus text exposition format for
/// one WAN identified by `wan_name`.
pub fn render_prometheus(wan_name: &str, m: &ControllerMetrics) -> String {
    let mut out = String::with_capacity(2048);

    writeln!(out, "# HELP cakepilot_ping_failure_total Reflector ping failures.").unwrap();
    writeln!(out, "# TYPE cakepilot_ping_failure_total counter").unwrap();
    writeln!(
        out,
        "cakepilot_ping_failure_total{{wan_name=\"{wan_name}\"}} {}",
        load(&m.ping_failure_total)
    )
    .unwrap();

    writeln!(out, "# HELP cakepilot_router_write_total Router write attempts.").unwrap();
    writeln!(out, "# TYPE cakepilot_router_write_total counter").unwrap();
    writeln!(
        out,
        "cakepilot_router_write_total{{wan_name=\"{wan_name}\"}} {}",
        load(&m.router_write_total)
    )
    .unwrap();

    writeln!(out, "# HELP cakepilot_router_write_failure_total Failed router writes.").unwrap();
    writeln!(out, "# TYPE cakepilot_router_write_failure_total counter").unwrap();
    writeln!(
        out,
        "cakepilot_router_write_failure_total{{wan_name=\"{wan_name}\"}} {}",
        load(&m.router_write_failure_total)
    )
    .unwrap();

    writeln!(out, "# HELP cakepilot_rate_limit_throttled_total Writes skipped by the rate limiter.").unwrap();
    writeln!(out, "# TYPE cakepilot_rate_limit_throttled_total counter").unwrap();
    writeln!(
        out,
        "cakepilot_rate_limit_throttled_total{{wan_name=\"{wan_name}\"}} {}",
        load(&m.rate_limit_throttled_total)
    )
    .unwrap();

    writeln!(out, "# HELP cakepilot_cake_read_failure_total CAKE queue-stat read failures.").unwrap();
    writeln!(out, "# TYPE cakepilot_cake_read_failure_total counter").unwrap();
    writeln!(
        out,
        "cakepilot_cake_read_failure_total{{wan_name=\"{wan_name}\"}} {}",
        load(&m.cake_read_failure_total)
    )
    .unwrap();

    writeln!(out, "# HELP cakepilot_baseline_reject_total Baseline values rejected by bounds checking.").unwrap();
    writeln!(out, "# TYPE cakepilot_baseline_reject_total counter").unwrap();
    writeln!(
        out,
        "cakepilot_baseline_reject_total{{wan_name=\"{wan_name}\"}} {}",
        load(&m.baseline_reject_total)
    )
    .unwrap();

    writeln!(out, "# HELP cakepilot_steering_transition_total Steering state transitions.").unwrap();
    writeln!(out, "# TYPE cakepilot_steering_transition_total counter").unwrap();
    writeln!(
        out,
        "cakepilot_steering_transition_total{{wan_name=\"{wan_name}\"}} {}",
        load(&m.steering_transition_total)
    )
    .unwrap();

    writeln!(out, "# HELP cakepilot_download_rate_mbps Current download rate limit.").unwrap();
    writeln!(out, "# TYPE cakepilot_download_rate_mbps gauge").unwrap();
    writeln!(
        out,
        "cakepilot_download_rate_mbps{{wan_name=\"{wan_name}\"}} {:.3}",
        m.download_rate_mbps.get()
    )
    .unwrap();

    writeln!(out, "# HELP cakepilot_upload_rate_mbps Current upload rate limit.").unwrap();
    writeln!(out, "# TYPE cakepilot_upload_rate_mbps gauge").unwrap();
    writeln!(
        out,
        "cakepilot_upload_rate_mbps{{wan_name=\"{wan_name}\"}} {:.3}",
        m.upload_rate_mbps.get()
    )
    .unwrap();

    writeln!(out, "# HELP cakepilot_queue_state Queue controller state (0=GREEN,1=YELLOW,2=SOFT_RED,3=RED).").unwrap();
    writeln!(out, "# TYPE cakepilot_queue_state gauge").unwrap();
    writeln!(
        out,
        "cakepilot_queue_state{{wan_name=\"{wan_name}\",direction=\"download\"}} {}",
        load(&m.queue_state_download)
    )
    .unwrap();
    writeln!(
        out,
        "cakepilot_queue_state{{wan_name=\"{wan_name}\",direction=\"upload\"}} {}",
        load(&m.queue_state_upload)
    )
    .unwrap();

    writeln!(out, "# HELP cakepilot_steering_state Steering meta-state (0=GOOD,1=DEGRADED).").unwrap();
    writeln!(out, "# TYPE cakepilot_steering_state gauge").unwrap();
    writeln!(out, "cakepilot_steering_state{{wan_name=\"{wan_name}\"}} {}", load(&m.steering_state)).unwrap();

    out
}

fn handle_connection(mut stream: TcpStream, body: &str) {
    let mut request_line = [0u8; 1024];
    let _ = stream.read(&mut request_line);

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes());
}

/// Runs a single-threaded `/metrics` HTTP server on `addr` until the
/// listener is dropped. `render` is called fresh on every request so
/// scrapes always see current counters.
pub fn run_metrics_server(addr: SocketAddr, render: impl Fn() -> String + Send + 'static) {
    let listener = match TcpListener::bind(addr) {
        Ok(l) => l,
        Err(err) => {
            tracing::error!(%addr, error = %err, "failed to bind metrics listener");
            return;
        }
    };

    thread::spawn(move || {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => handle_connection(stream, &render()),
                Err(err) => tracing::warn!(error = %err, "metrics connection error"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_contains_help_and_type_pairs() {
        let m = ControllerMetrics::new();
        m.inc_ping_failure();
        m.inc_router_write(true);
        m.inc_router_write(false);
        m.download_rate_mbps.set(123.5);

        let rendered = render_prometheus("wan0", &m);
        assert!(rendered.contains("# HELP cakepilot_ping_failure_total"));
        assert!(rendered.contains("# TYPE cakepilot_ping_failure_total counter"));
        assert!(rendered.contains("cakepilot_ping_failure_total{wan_name=\"wan0\"} 1"));
        assert!(rendered.contains("cakepilot_router_write_total{wan_name=\"wan0\"} 2"));
        assert!(rendered.contains("cakepilot_router_write_failure_total{wan_name=\"wan0\"} 1"));
        assert!(rendered.contains("cakepilot_download_rate_mbps{wan_name=\"wan0\"} 123.500"));
    }

    #[test]
    fn atomic_f64_bits_round_trip() {
        let bits = AtomicU64Bits::default();
        bits.set(42.125);
        assert_eq!(bits.get(), 42.125);
    }
}
