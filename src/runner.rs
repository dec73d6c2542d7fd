//! Control loop runner (spec §4.11): per-WAN file lock, signal-driven
//! cooperative shutdown, cycle timing, consecutive-failure tracking.
//!
//! The signal handling here is lifted directly from the teacher's own
//! `bin/strata_receiver.rs`, which hand-rolls a `sigwait`-based handler
//! instead of pulling in the `ctrlc` crate its own `Cargo.toml` lists —
//! see `DESIGN.md` for why this crate follows the code, not the manifest.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant as StdInstant};
use tracing::{error, info, warn};

use crate::error::LockError;

/// Number of consecutive cycle failures after which the runner stops
/// sending watchdog notifications so the supervisor restarts the process
/// (spec §4.11).
const CONSECUTIVE_FAILURE_THRESHOLD: u32 = 3;

/// Thread-safe cooperative cancellation flag, set from the signal-handling
/// thread and polled by the runner loop between cycles and at the
/// cancellable sleep (spec §4.11, §9 — never a raw boolean).
#[derive(Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        CancellationFlag(Arc::new(AtomicBool::new(false)))
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Registers SIGINT/SIGTERM handlers that set `flag`, using the same raw
/// `sigwait`-on-a-dedicated-thread approach the teacher's binaries use
/// rather than an external signal crate.
pub fn install_signal_handler(flag: CancellationFlag) {
    thread::Builder::new()
        .name("signal-wait".to_string())
        .spawn(move || unsafe {
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, libc::SIGINT);
            libc::sigaddset(&mut set, libc::SIGTERM);
            libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());

            loop {
                let mut sig: i32 = 0;
                let rc = libc::sigwait(&set, &mut sig);
                if rc == 0 {
                    info!(signal = sig, "received shutdown signal");
                    flag.cancel();
                    return;
                }
            }
        })
        .expect("failed to spawn signal-wait thread");
}

/// Sleeps for `duration` but wakes early if `flag` is cancelled, polling in
/// short slices so cancellation latency stays bounded (spec §4.11's
/// "cancellable sleep is the only cancellable wait").
pub fn cancellable_sleep(duration: Duration, flag: &CancellationFlag) {
    const SLICE: Duration = Duration::from_millis(20);
    let mut remaining = duration;
    while remaining > Duration::ZERO {
        if flag.is_cancelled() {
            return;
        }
        let slice = remaining.min(SLICE);
        thread::sleep(slice);
        remaining -= slice;
    }
}

/// A held file lock at a well-known per-WAN path, released on `Drop`.
#[derive(Debug)]
pub struct ProcessLock {
    path: PathBuf,
    _file: File,
}

impl ProcessLock {
    /// Acquires an exclusive lock at `path`, forcibly taking over a stale
    /// lock (dead PID, or age beyond `lock_timeout`) to recover from
    /// crashes (spec §5).
    pub fn acquire(path: &Path, lock_timeout: Duration) -> Result<Self, LockError> {
        if let Some(existing) = read_lock_contents(path) {
            if pid_is_live(existing.pid) && existing.age() < lock_timeout {
                return Err(LockError::HeldByLivePid {
                    path: path.display().to_string(),
                    pid: existing.pid,
                });
            }
            warn!(path = %path.display(), pid = existing.pid, "taking over stale lock");
        }

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(path)
            .map_err(|source| LockError::Io {
                path: path.display().to_string(),
                source,
            })?;

        let fd = std::os::unix::io::AsRawFd::as_raw_fd(&file);
        let rc = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(LockError::Io {
                path: path.display().to_string(),
                source: std::io::Error::last_os_error(),
            });
        }

        let pid = std::process::id();
        let contents = format!("{pid}\n{}\n", now_unix_secs());
        file.write_all(contents.as_bytes())
            .map_err(|source| LockError::Io {
                path: path.display().to_string(),
                source,
            })?;

        Ok(ProcessLock {
            path: path.to_path_buf(),
            _file: file,
        })
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

struct LockContents {
    pid: i32,
    started_unix_secs: u64,
}

impl LockContents {
    fn age(&self) -> Duration {
        let now = now_unix_secs();
        Duration::from_secs(now.saturating_sub(self.started_unix_secs))
    }
}

fn read_lock_contents(path: &Path) -> Option<LockContents> {
    let mut buf = String::new();
    File::open(path).ok()?.read_to_string(&mut buf).ok()?;
    let mut lines = buf.lines();
    let pid: i32 = lines.next()?.parse().ok()?;
    let started: u64 = lines.next()?.parse().ok()?;
    Some(LockContents {
        pid,
        started_unix_secs: started,
    })
}

fn pid_is_live(pid: i32) -> bool {
    // Signal 0 performs no actual signalling, only an existence/permission
    // check (standard POSIX idiom for "is this PID alive").
    unsafe { libc::kill(pid, 0) == 0 }
}

fn now_unix_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Drives a cycle function to completion, tracking consecutive failures and
/// cancellable sleep, until `flag` is cancelled (spec §4.11).
pub struct CycleRunner {
    cycle_interval: Duration,
    flag: CancellationFlag,
    consecutive_failures: AtomicU32,
}

impl CycleRunner {
    pub fn new(cycle_interval: Duration, flag: CancellationFlag) -> Self {
        CycleRunner {
            cycle_interval,
            flag,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn watchdog_should_notify(&self) -> bool {
        self.consecutive_failures() < CONSECUTIVE_FAILURE_THRESHOLD
    }

    /// Runs `cycle` repeatedly until cancellation. The cycle itself is
    /// never retried internally — a failure is tallied and the next tick
    /// runs the (idempotent) cycle again.
    pub fn run_until_cancelled(&self, mut cycle: impl FnMut() -> bool) {
        loop {
            if self.flag.is_cancelled() {
                info!("shutdown requested, exiting control loop");
                return;
            }

            let started = StdInstant::now();
            let success = cycle();
            let elapsed = started.elapsed();

            if success {
                self.consecutive_failures.store(0, Ordering::SeqCst);
            } else {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures == CONSECUTIVE_FAILURE_THRESHOLD {
                    error!(failures, "consecutive cycle failures reached threshold, suppressing watchdog notifications");
                }
            }

            if elapsed > self.cycle_interval {
                warn!(elapsed_ms = elapsed.as_millis() as u64, budget_ms = self.cycle_interval.as_millis() as u64, "cycle overran budget");
            }

            if self.flag.is_cancelled() {
                return;
            }

            let sleep_for = self.cycle_interval.saturating_sub(elapsed);
            cancellable_sleep(sleep_for, &self.flag);
        }
    }
}
