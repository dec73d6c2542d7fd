//! `cakepilot-steering` — single process for the edge, driving the
//! cross-WAN steering controller loop. Mirrors the CLI structure of
//! `cakepilot-autorate`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cakepilot::config;
use cakepilot::metrics::{run_metrics_server, ControllerMetrics};
use cakepilot::router::RouterClient;
use cakepilot::rtt::{Pinger, RttMeasurer};
use cakepilot::{run_steering, Paths};

struct Args {
    config_path: PathBuf,
    state_path: PathBuf,
    lock_path: PathBuf,
    primary_autorate_state_path: PathBuf,
    metrics_addr: Option<SocketAddr>,
    reset: bool,
    one_shot: bool,
}

fn print_help() {
    eprintln!(
        "cakepilot-steering --config <path> --state <path> --lock <path> --primary-state <path> [--metrics <addr>] [--reset] [--one-shot]\n\
         \n\
         Env var fallbacks: CAKEPILOT_CONFIG, CAKEPILOT_STATE, CAKEPILOT_LOCK, CAKEPILOT_PRIMARY_STATE, CAKEPILOT_METRICS_ADDR"
    );
}

fn parse_args() -> anyhow::Result<Args> {
    let mut config_path = std::env::var("CAKEPILOT_CONFIG").ok().map(PathBuf::from);
    let mut state_path = std::env::var("CAKEPILOT_STATE").ok().map(PathBuf::from);
    let mut lock_path = std::env::var("CAKEPILOT_LOCK").ok().map(PathBuf::from);
    let mut primary_autorate_state_path = std::env::var("CAKEPILOT_PRIMARY_STATE").ok().map(PathBuf::from);
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
            "--primary-state" => primary_autorate_state_path = Some(PathBuf::from(iter.next().ok_or_else(|| anyhow::anyhow!("--primary-state requires a value"))?)),
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
        primary_autorate_state_path: primary_autorate_state_path
            .ok_or_else(|| anyhow::anyhow!("--primary-state (or CAKEPILOT_PRIMARY_STATE) is required"))?,
        metrics_addr,
        reset,
        one_shot,
    })
}

struct ProcessPinger;

impl Pinger for ProcessPinger {
    fn ping(&self, reflector: &str, timeout: Duration) -> Option<f64> {
        let timeout_secs = timeout.as_secs().max(1).to_string();
        let output = std::process::Command::new("ping")
            .args(["-c", "1", "-W", &timeout_secs, reflector])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let marker = "time=";
        let start = stdout.find(marker)? + marker.len();
        let rest = &stdout[start..];
        let end = rest.find(|c: char| !(c.is_ascii_digit() || c == '.'))?;
        rest[..end].parse().ok()
    }
}

struct RestRouterClient {
    base_url: String,
}

impl RestRouterClient {
    fn new(base_url: String) -> Self {
        RestRouterClient { base_url }
    }

    fn post(&self, path: &str, body: &str) -> Result<String, cakepilot::error::RouterError> {
        use std::io::{Read, Write};
        use std::net::TcpStream;

        let url = format!("{}{}", self.base_url, path);
        let without_scheme = url.strip_prefix("http://").unwrap_or(&url);
        let (host_port, req_path) = without_scheme.split_once('/').unwrap_or((without_scheme, ""));
        let mut stream = TcpStream::connect(host_port)
            .map_err(|e| cakepilot::error::RouterError::Transport(e.to_string()))?;
        let request = format!(
            "POST /{req_path} HTTP/1.1\r\nHost: {host_port}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream
            .write_all(request.as_bytes())
            .map_err(|e| cakepilot::error::RouterError::Transport(e.to_string()))?;
        let mut response = String::new();
        stream
            .read_to_string(&mut response)
            .map_err(|e| cakepilot::error::RouterError::Transport(e.to_string()))?;
        Ok(response)
    }
}

impl RouterClient for RestRouterClient {
    fn set_rate_limits(
        &self,
        _download_queue: &str,
        _upload_queue: &str,
        _dl_mbps: f64,
        _ul_mbps: f64,
    ) -> Result<(), cakepilot::error::RouterError> {
        // The steering process never writes queue rate limits (spec §5:
        // disjoint write ownership between autorate and steering).
        unreachable!("steering controller never calls set_rate_limits")
    }

    fn get_queue_stats(&self, queue_name: &str) -> Option<cakepilot::cake_stats::QueueStats> {
        let body = self.post("/queues/stats", &format!("{{\"queue\":\"{queue_name}\"}}")).ok()?;
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
        Some(body.contains("\"enabled\":true"))
    }
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
    let cfg = config::load_steering_yaml(&yaml)?;

    let pinger: Arc<dyn Pinger> = Arc::new(ProcessPinger);
    let measurer = RttMeasurer::new(
        pinger,
        vec!["1.1.1.1".to_string()],
        false,
        cfg.cycle_interval,
    );

    let router: Arc<dyn RouterClient> = Arc::new(RestRouterClient::new(
        std::env::var("CAKEPILOT_ROUTER_URL").unwrap_or_else(|_| "http://127.0.0.1:8728".to_string()),
    ));

    let metrics = ControllerMetrics::new();
    if let Some(addr) = args.metrics_addr {
        let server_metrics = Arc::clone(&metrics);
        let wan_name = cfg.primary_wan.clone();
        run_metrics_server(addr, move || cakepilot::metrics::render_prometheus(&wan_name, &server_metrics));
    }

    let paths = Paths {
        state_path: args.state_path,
        lock_path: args.lock_path,
    };

    if args.one_shot {
        let mut controller = cakepilot::steering::SteeringController::new(
            cfg,
            router,
            measurer,
            paths.state_path,
            args.primary_autorate_state_path,
            metrics,
        );
        let outcome = controller.run_cycle();
        std::process::exit(if outcome.success { 0 } else { 1 });
    }

    run_steering(cfg, router, measurer, paths, args.primary_autorate_state_path, Duration::from_secs(300), metrics)
}
