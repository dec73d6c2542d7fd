//! `cakepilot-autorate` — one process per WAN, driving the autorate
//! controller loop. Argument parsing, env-var fallbacks, and the metrics
//! server are hand-rolled glue, following the teacher's
//! `bin/strata_receiver.rs::main` structure rather than pulling in `clap`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use cakepilot::clock::SystemClock;
use cakepilot::config;
use cakepilot::metrics::{run_metrics_server, ControllerMetrics};
use cakepilot::router::{validate_router_identifier, RouterClient};
use cakepilot::rtt::{Pinger, RttMeasurer};
use cakepilot::{run_autorate, Paths};

struct Args {
    config_path: PathBuf,
    state_path: PathBuf,
    lock_path: PathBuf,
    metrics_addr: Option<SocketAddr>,
    reset: bool,
    one_shot: bool,
}

fn print_help() {
    eprintln!(
        "cakepilot-autorate --config <path> --state <path> --lock <path> [--metrics <addr>] [--reset] [--one-shot]\n\
         \n\
         Env var fallbacks: CAKEPILOT_CONFIG, CAKEPILOT_STATE, CAKEPILOT_LOCK, CAKEPILOT_METRICS_ADDR"
    );
}

fn parse_args() -> anyhow::Result<Args> {
    let mut config_path = std::env::var("CAKEPILOT_CONFIG").ok().map(PathBuf::from);
    let mut state_path = std::env::var("CAKEPILOT_STATE").ok().map(PathBuf::from);
    let mut lock_path = std::env::var("CAKEPILOT_LOCK").ok().map(PathBuf::from);
    let mut metrics_addr = std::env::var("CAKEPILOT_METRICS_ADDR")
        .ok()
        .and_then(|s| s.parse().ok());
    let mut reset = false;
    let mut one_shot = false;

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => config_path = Some(PathBuf::from(iter.next().ok_or_else(|| anyhow::anyhow!("--config requires a value"))?)),
            "--state" => state_path = Some(PathBuf::from(iter.next().ok_or_else(|| anyhow::anyhow!("--state requires a value"))?)),
            "--lock" => lock_path = Some(PathBuf::from(iter.next().ok_or_else(|| anyhow::anyhow!("--lock requires a value"))?)),
            "--metrics" => {
                let val = iter.next().ok_or_else(|| anyhow::anyhow!("--metrics requires a value"))?;
                metrics_addr = Some(val.parse().map_err(|_| anyhow::anyhow!("invalid --metrics address"))?);
            }
            "--reset" => reset = true,
            "--one-shot" => one_shot = true,
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            other => anyhow::bail!("unrecognized argument: {other}"),
        }
    }

    Ok(Args {
        config_path: config_path.ok_or_else(|| anyhow::anyhow!("--config (or CAKEPILOT_CONFIG) is required"))?,
        state_path: state_path.ok_or_else(|| anyhow::anyhow!("--state (or CAKEPILOT_STATE) is required"))?,
        lock_path: lock_path.ok_or_else(|| anyhow::anyhow!("--lock (or CAKEPILOT_LOCK) is required"))?,
        metrics_addr,
        reset,
        one_shot,
    })
}

/// Shells out to the system `ping` binary: ICMP execution is an external
/// collaborator per spec §1, so this is glue, not core logic.
struct ProcessPinger;

impl Pinger for ProcessPinger {
    fn ping(&self, reflector: &str, timeout: Duration) -> Option<f64> {
        let timeout_secs = timeout.as_secs().max(1).to_string();
        let output = Command::new("ping")
            .args(["-c", "1", "-W", &timeout_secs, reflector])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_ping_rtt(&stdout)
    }
}

fn parse_ping_rtt(stdout: &str) -> Option<f64> {
    let marker = "time=";
    let start = stdout.find(marker)? + marker.len();
    let rest = &stdout[start..];
    let end = rest.find(|c: char| !(c.is_ascii_digit() || c == '.'))?;
    rest[..end].parse().ok()
}

/// Minimal REST router client over raw TCP, matching the core's
/// `RouterClient` trait. A real deployment may instead point at an
/// SSH-command transport; the core does not care which (spec §4.12).
struct RestRouterClient {
    base_url: String,
}

impl RestRouterClient {
    fn new(base_url: String) -> Self {
        RestRouterClient { base_url }
    }

    fn post(&self, path: &str, body: &str) -> Result<String, cakepilot::error::RouterError> {
        ureq_like_post(&format!("{}{}", self.base_url, path), body)
            .map_err(|e| cakepilot::error::RouterError::Transport(e.to_string()))
    }
}

/// Tiny blocking HTTP POST over a raw `TcpStream`, in the spirit of the
/// teacher's hand-rolled metrics HTTP parsing rather than a pulled-in HTTP
/// client crate (this is binary-level glue, not core logic).
fn ureq_like_post(url: &str, body: &str) -> std::io::Result<String> {
    use std::io::{Read, Write};
    use std::net::TcpStream;

    let without_scheme = url.strip_prefix("http://").unwrap_or(url);
    let (host_port, path) = without_scheme.split_once('/').unwrap_or((without_scheme, ""));
    let mut stream = TcpStream::connect(host_port)?;
    let request = format!(
        "POST /{path} HTTP/1.1\r\nHost: {host_port}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes())?;
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    Ok(response)
}

impl RouterClient for RestRouterClient {
    fn set_rate_limits(
        &self,
        download_queue: &str,
        upload_queue: &str,
        dl_mbps: f64,
        ul_mbps: f64,
    ) -> Result<(), cakepilot::error::RouterError> {
        validate_router_identifier(download_queue)?;
        validate_router_identifier(upload_queue)?;
        self.post(
            "/queues/rate-limits",
            &format!(
                "{{\"download_queue\":\"{download_queue}\",\"upload_queue\":\"{upload_queue}\",\"dl_mbps\":{dl_mbps},\"ul_mbps\":{ul_mbps}}}"
            ),
        )?;
        Ok(())
    }

    fn get_queue_stats(&self, queue_name: &str) -> Option<cakepilot::cake_stats::QueueStats> {
        let body = self.post("/queues/stats", &format!("{{\"queue\":\"{queue_name}\"}}")).ok()?;
        parse_queue_stats(&body)
    }

    fn enable_rule_raw(&self, comment: &str) -> Result<(), cakepilot::error::RouterError> {
        self.post("/rules/enable", &format!("{{\"comment\":\"{comment}\"}}"))?;
        Ok(())
    }

    fn disable_rule_raw(&self, comment: &str) -> Result<(), cakepilot::error::RouterError> {
        self.post("/rules/disable", &format!("{{\"comment\":\"{comment}\"}}"))?;
        Ok(())
    }

    fn is_rule_enabled(&self, comment: &str) -> Option<bool> {
        let body = self.post("/rules/status", &format!("{{\"comment\":\"{comment}\"}}")).ok()?;
        body.contains("\"enabled\":true").then_some(true).or(Some(false))
    }
}

fn parse_queue_stats(body: &str) -> Option<cakepilot::cake_stats::QueueStats> {
    let extract = |key: &str| -> Option<u64> {
        let marker = format!("\"{key}\":");
        let start = body.find(&marker)? + marker.len();
        let rest = &body[start..];
        let end = rest.find(|c: char| !c.is_ascii_digit())?;
        rest[..end].parse().ok()
    };
    Some(cakepilot::cake_stats::QueueStats {
        bytes: extract("bytes")?,
        packets: extract("packets")?,
        dropped: extract("dropped")?,
        queued_packets: extract("queued_packets")?,
    })
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = parse_args()?;

    if args.reset {
        let _ = std::fs::remove_file(&args.state_path);
        tracing::info!(path = %args.state_path.display(), "state file reset");
    }

    let yaml = std::fs::read_to_string(&args.config_path)?;
    let cfg = config::load_autorate_yaml(&yaml)?;

    let pinger: Arc<dyn Pinger> = Arc::new(ProcessPinger);
    let measurer = RttMeasurer::new(
        pinger,
        cfg.reflectors.clone(),
        cfg.median_of_three,
        cfg.cycle_interval,
    );

    let router: Arc<dyn RouterClient> = Arc::new(RestRouterClient::new(
        std::env::var("CAKEPILOT_ROUTER_URL").unwrap_or_else(|_| "http://127.0.0.1:8728".to_string()),
    ));

    let metrics = ControllerMetrics::new();
    if let Some(addr) = args.metrics_addr {
        let server_metrics = Arc::clone(&metrics);
        let wan_name = cfg.wan_name.clone();
        run_metrics_server(addr, move || cakepilot::metrics::render_prometheus(&wan_name, &server_metrics));
    }

    let paths = Paths {
        state_path: args.state_path,
        lock_path: args.lock_path,
    };

    if args.one_shot {
        // --one-shot runs a single cycle without acquiring the long-lived
        // lock loop machinery, useful for cron-driven or debug invocation.
        let clock = Arc::new(SystemClock);
        let mut controller = cakepilot::autorate::AutorateController::new(
            cfg,
            clock,
            router,
            measurer,
            paths.state_path,
            25.0,
            metrics,
        );
        let outcome = controller.run_cycle();
        std::process::exit(if outcome.success { 0 } else { 1 });
    }

    run_autorate(cfg, Arc::new(SystemClock), router, measurer, paths, 25.0, Duration::from_secs(300), metrics)
}
