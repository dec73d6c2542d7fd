//! Error domains for the controller core.
//!
//! One enum per failure domain named in spec §7. The control-loop runner
//! (`runner.rs`) is the only place these cross into `anyhow::Error` — the
//! core itself never raises across the runner boundary, it returns
//! `Result`/`bool` that the runner tallies.

use thiserror::Error;

/// Config validation failure (Invariant F/T, identifier rules).
#[derive(Debug, Error, PartialEq, Clone)]
pub enum ConfigError {
    #[error("floor ordering invariant violated: floor_red({floor_red}) <= floor_soft_red({floor_soft_red}) <= floor_yellow({floor_yellow}) <= floor_green({floor_green}) <= ceiling({ceiling}) does not hold")]
    FloorOrdering {
        floor_red: u32,
        floor_soft_red: u32,
        floor_yellow: u32,
        floor_green: u32,
        ceiling: u32,
    },
    #[error("threshold ordering invariant violated: 0 < target({target}) < warn({warn}) < hard_red({hard_red}) does not hold")]
    ThresholdOrdering { target: f64, warn: f64, hard_red: f64 },
    #[error("alpha {name} out of (0,1]: {value}")]
    AlphaOutOfRange { name: &'static str, value: f64 },
    #[error("alpha_baseline ({alpha_baseline}) must be < alpha_load ({alpha_load})")]
    AlphaOrdering { alpha_baseline: f64, alpha_load: f64 },
    #[error("invalid identifier '{value}' for {field}: must match ^[A-Za-z0-9_.-]+$ and be <= 64 chars")]
    InvalidIdentifier { field: &'static str, value: String },
    #[error("reflector list must contain at least one host")]
    EmptyReflectorList,
    #[error("hysteresis sample counts must be positive: red_samples_required={red}, green_samples_required={green}")]
    NonPositiveHysteresis { red: u32, green: u32 },
    #[error("baseline bounds invalid: min_ms({min}) must be < max_ms({max})")]
    BaselineBoundsInverted { min: f64, max: f64 },
}

/// State-store load/save failure domain (spec §4.5, §7).
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("failed to write temp file {path}: {source}")]
    WriteTemp {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to rename temp file into place at {path}: {source}")]
    Rename {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize state: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Router client failure domain (spec §4.12, §7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouterError {
    #[error("identifier '{0}' rejected by validation (injection guard)")]
    InvalidIdentifier(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("post-toggle verification failed after {attempts} attempts")]
    VerificationFailed { attempts: u32 },
}

/// Lock acquisition failure (spec §4.11, §5) — fatal at startup.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock file {path} held by live process {pid}")]
    HeldByLivePid { path: String, pid: i32 },
    #[error("io error acquiring lock {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
