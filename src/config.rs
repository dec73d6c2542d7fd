//! Typed, validated configuration records (spec §3, §6).
//!
//! YAML parsing and outer schema validation are a collaborator's job per
//! spec §1 — these structs only need to deserialize cleanly and expose a
//! [`validate`](AutorateConfig::validate) method enforcing the semantic
//! invariants the core must never violate (Invariant F, Invariant T, the
//! identifier whitelist). `serde` + `serde_yaml` here serve the binaries'
//! convenience; the core's safety guarantees live in `validate()`, not in
//! the parser.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Compile-time absolute ceiling for an accepted baseline RTT (spec §9:
/// "a hard security control" — config may narrow this, never widen it).
pub const ABSOLUTE_MAX_BASELINE_MS: f64 = 500.0;

static IDENTIFIER_MAX_LEN: usize = 64;

/// Validates the shared identifier rule from spec §6: `^[A-Za-z0-9_.-]+$`,
/// length <= 64. Used for `wan_name`, queue names, and the mangle comment.
pub fn validate_identifier(field: &'static str, value: &str) -> Result<(), ConfigError> {
    let ok = !value.is_empty()
        && value.len() <= IDENTIFIER_MAX_LEN
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'));
    if ok {
        Ok(())
    } else {
        Err(ConfigError::InvalidIdentifier {
            field,
            value: value.to_string(),
        })
    }
}

/// Fallback policy on total/ICMP-side connectivity loss (spec §4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    Freeze,
    UseLastRtt,
    GracefulDegradation,
}

/// Per-direction floor/ceiling/step configuration (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DirectionConfig {
    pub floor_green: f64,
    pub floor_yellow: f64,
    /// Download-only in 4-state mode; set equal to `floor_yellow` (or
    /// omitted, defaulting there) for 3-state directions per spec §3.
    #[serde(default)]
    pub floor_soft_red: Option<f64>,
    pub floor_red: f64,
    pub ceiling: f64,
    pub step_up: f64,
    pub factor_down: f64,
}

impl DirectionConfig {
    /// `floor_soft_red`, defaulting to `floor_yellow` for 3-state configs.
    pub fn effective_floor_soft_red(&self) -> f64 {
        self.floor_soft_red.unwrap_or(self.floor_yellow)
    }

    /// Whether this direction distinguishes SOFT_RED from YELLOW (4-state).
    pub fn is_four_state(&self) -> bool {
        self.floor_soft_red
            .is_some_and(|f| (f - self.floor_yellow).abs() > f64::EPSILON)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let soft_red = self.effective_floor_soft_red();
        if !(self.floor_red <= soft_red
            && soft_red <= self.floor_yellow
            && self.floor_yellow <= self.floor_green
            && self.floor_green <= self.ceiling)
        {
            return Err(ConfigError::FloorOrdering {
                floor_red: self.floor_red as u32,
                floor_soft_red: soft_red as u32,
                floor_yellow: self.floor_yellow as u32,
                floor_green: self.floor_green as u32,
                ceiling: self.ceiling as u32,
            });
        }
        Ok(())
    }
}

/// Per-WAN autorate configuration (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutorateConfig {
    pub wan_name: String,
    pub reflectors: Vec<String>,
    #[serde(default)]
    pub median_of_three: bool,
    pub download: DirectionConfig,
    pub upload: DirectionConfig,
    pub target_bloat_ms: f64,
    pub warn_bloat_ms: f64,
    pub hard_red_bloat_ms: f64,
    pub alpha_baseline: f64,
    pub alpha_load: f64,
    pub baseline_update_threshold_ms: f64,
    #[serde(with = "duration_ms")]
    pub cycle_interval: Duration,
    pub rate_limit_max_changes: u32,
    #[serde(with = "duration_ms", rename = "rate_limit_window_ms")]
    pub rate_limit_window: Duration,
    pub fallback_policy: FallbackPolicy,
    pub max_fallback_cycles: u32,
}

impl AutorateConfig {
    /// Enforces Invariant F (per direction), Invariant T, alpha bounds and
    /// ordering, identifier rules, and reflector-list non-emptiness.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_identifier("wan_name", &self.wan_name)?;
        if self.reflectors.is_empty() {
            return Err(ConfigError::EmptyReflectorList);
        }

        self.download.validate()?;
        self.upload.validate()?;

        if !(0.0 < self.target_bloat_ms
            && self.target_bloat_ms < self.warn_bloat_ms
            && self.warn_bloat_ms < self.hard_red_bloat_ms)
        {
            return Err(ConfigError::ThresholdOrdering {
                target: self.target_bloat_ms,
                warn: self.warn_bloat_ms,
                hard_red: self.hard_red_bloat_ms,
            });
        }

        for (name, value) in [
            ("alpha_baseline", self.alpha_baseline),
            ("alpha_load", self.alpha_load),
        ] {
            if !(value > 0.0 && value <= 1.0 && value.is_finite()) {
                return Err(ConfigError::AlphaOutOfRange { name, value });
            }
        }
        if !(self.alpha_baseline < self.alpha_load) {
            return Err(ConfigError::AlphaOrdering {
                alpha_baseline: self.alpha_baseline,
                alpha_load: self.alpha_load,
            });
        }

        Ok(())
    }
}

/// Congestion-assessor thresholds (spec §4.8).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AssessorThresholds {
    pub green_rtt_ms: f64,
    pub yellow_rtt_ms: f64,
    pub red_rtt_ms: f64,
    pub min_drops_red: u64,
    pub min_queue_yellow: u64,
    pub min_queue_red: u64,
}

/// Steering controller configuration (spec §3, §4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SteeringConfig {
    pub primary_wan: String,
    pub alternate_wan: String,
    pub mangle_comment: String,
    pub primary_download_queue: String,
    pub primary_upload_queue: String,
    pub thresholds: AssessorThresholds,
    pub red_samples_required: u32,
    pub green_samples_required: u32,
    pub baseline_min_ms: f64,
    pub baseline_max_ms: f64,
    pub alpha_rtt_delta: f64,
    pub alpha_queue: f64,
    #[serde(with = "duration_ms")]
    pub cycle_interval: Duration,
    #[serde(default = "default_cake_failure_threshold")]
    pub cake_read_failure_threshold: u32,
    #[serde(default = "default_transition_history_len")]
    pub transition_history_len: usize,
}

fn default_cake_failure_threshold() -> u32 {
    5
}

fn default_transition_history_len() -> usize {
    64
}

impl SteeringConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_identifier("primary_wan", &self.primary_wan)?;
        validate_identifier("alternate_wan", &self.alternate_wan)?;
        validate_identifier("mangle_comment", &self.mangle_comment)?;
        validate_identifier("primary_download_queue", &self.primary_download_queue)?;
        validate_identifier("primary_upload_queue", &self.primary_upload_queue)?;

        if self.red_samples_required == 0 || self.green_samples_required == 0 {
            return Err(ConfigError::NonPositiveHysteresis {
                red: self.red_samples_required,
                green: self.green_samples_required,
            });
        }

        if !(self.baseline_min_ms < self.baseline_max_ms) {
            return Err(ConfigError::BaselineBoundsInverted {
                min: self.baseline_min_ms,
                max: self.baseline_max_ms,
            });
        }
        if self.baseline_max_ms > ABSOLUTE_MAX_BASELINE_MS {
            // Config may narrow the ceiling, never widen it past the
            // compile-time absolute (spec §9). Reject rather than clamp
            // silently so a misconfiguration is visible at startup.
            return Err(ConfigError::BaselineBoundsInverted {
                min: self.baseline_min_ms,
                max: self.baseline_max_ms,
            });
        }

        for (name, value) in [
            ("alpha_rtt_delta", self.alpha_rtt_delta),
            ("alpha_queue", self.alpha_queue),
        ] {
            if !(value > 0.0 && value <= 1.0 && value.is_finite()) {
                return Err(ConfigError::AlphaOutOfRange { name, value });
            }
        }

        Ok(())
    }
}

/// Serde helper: represent a `Duration` as whole milliseconds in YAML/JSON.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Parses and validates an [`AutorateConfig`] from a YAML document.
pub fn load_autorate_yaml(yaml: &str) -> anyhow::Result<AutorateConfig> {
    let cfg: AutorateConfig = serde_yaml::from_str(yaml)?;
    cfg.validate()?;
    Ok(cfg)
}

/// Parses and validates a [`SteeringConfig`] from a YAML document.
pub fn load_steering_yaml(yaml: &str) -> anyhow::Result<SteeringConfig> {
    let cfg: SteeringConfig = serde_yaml::from_str(yaml)?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    pub fn direction_4state() -> DirectionConfig {
        DirectionConfig {
            floor_green: 550.0,
            floor_yellow: 550.0,
            floor_soft_red: Some(300.0),
            floor_red: 150.0,
            ceiling: 940.0,
            step_up: 10.0,
            factor_down: 0.85,
        }
    }

    pub fn direction_3state() -> DirectionConfig {
        DirectionConfig {
            floor_green: 550.0,
            floor_yellow: 550.0,
            floor_soft_red: None,
            floor_red: 150.0,
            ceiling: 940.0,
            step_up: 10.0,
            factor_down: 0.85,
        }
    }

    pub fn autorate_config() -> AutorateConfig {
        AutorateConfig {
            wan_name: "wan0".to_string(),
            reflectors: vec!["1.1.1.1".to_string()],
            median_of_three: false,
            download: direction_4state(),
            upload: direction_3state(),
            target_bloat_ms: 15.0,
            warn_bloat_ms: 45.0,
            hard_red_bloat_ms: 90.0,
            alpha_baseline: 0.02,
            alpha_load: 0.2,
            baseline_update_threshold_ms: 3.0,
            cycle_interval: Duration::from_millis(250),
            rate_limit_max_changes: 10,
            rate_limit_window: Duration::from_secs(60),
            fallback_policy: FallbackPolicy::GracefulDegradation,
            max_fallback_cycles: 4,
        }
    }

    pub fn steering_config() -> SteeringConfig {
        SteeringConfig {
            primary_wan: "wan0".to_string(),
            alternate_wan: "wan1".to_string(),
            mangle_comment: "steer-latency-sensitive".to_string(),
            primary_download_queue: "wan0-download".to_string(),
            primary_upload_queue: "wan0-upload".to_string(),
            thresholds: AssessorThresholds {
                green_rtt_ms: 10.0,
                yellow_rtt_ms: 30.0,
                red_rtt_ms: 60.0,
                min_drops_red: 5,
                min_queue_yellow: 20,
                min_queue_red: 50,
            },
            red_samples_required: 2,
            green_samples_required: 15,
            baseline_min_ms: 10.0,
            baseline_max_ms: 60.0,
            alpha_rtt_delta: 0.3,
            alpha_queue: 0.3,
            cycle_interval: Duration::from_millis(250),
            cake_read_failure_threshold: 5,
            transition_history_len: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn valid_config_passes() {
        assert!(autorate_config().validate().is_ok());
        assert!(steering_config().validate().is_ok());
    }

    #[test]
    fn floor_ordering_violation_rejected() {
        let mut cfg = autorate_config();
        cfg.download.floor_green = 1000.0; // > ceiling
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::FloorOrdering { .. })
        ));
    }

    #[test]
    fn threshold_ordering_violation_rejected() {
        let mut cfg = autorate_config();
        cfg.warn_bloat_ms = 5.0; // < target
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ThresholdOrdering { .. })
        ));
    }

    #[test]
    fn alpha_ordering_enforced() {
        let mut cfg = autorate_config();
        cfg.alpha_baseline = 0.5;
        cfg.alpha_load = 0.2;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::AlphaOrdering { .. })
        ));
    }

    #[test]
    fn alpha_out_of_range_rejected() {
        let mut cfg = autorate_config();
        cfg.alpha_load = 1.5;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::AlphaOutOfRange { .. })
        ));
    }

    #[test]
    fn empty_reflector_list_rejected() {
        let mut cfg = autorate_config();
        cfg.reflectors.clear();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::EmptyReflectorList)
        ));
    }

    #[test]
    fn identifier_rejects_shell_metacharacters() {
        assert!(validate_identifier("wan_name", "wan0; rm -rf /").is_err());
        assert!(validate_identifier("wan_name", "wan0`whoami`").is_err());
        assert!(validate_identifier("wan_name", "wan-0.eth_0").is_ok());
    }

    #[test]
    fn identifier_rejects_over_length() {
        let long = "a".repeat(65);
        assert!(validate_identifier("field", &long).is_err());
        let ok = "a".repeat(64);
        assert!(validate_identifier("field", &ok).is_ok());
    }

    #[test]
    fn steering_baseline_bounds_capped_at_absolute_max() {
        let mut cfg = steering_config();
        cfg.baseline_max_ms = 1000.0; // beyond ABSOLUTE_MAX_BASELINE_MS
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn steering_hysteresis_must_be_positive() {
        let mut cfg = steering_config();
        cfg.red_samples_required = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::NonPositiveHysteresis { .. })
        ));
    }

    #[test]
    fn three_state_direction_collapses_soft_red_onto_yellow() {
        let d = direction_3state();
        assert!(!d.is_four_state());
        assert_eq!(d.effective_floor_soft_red(), d.floor_yellow);
    }

    #[test]
    fn four_state_direction_detects_distinct_soft_red() {
        let d = direction_4state();
        assert!(d.is_four_state());
    }

    #[test]
    fn yaml_round_trips() {
        let cfg = autorate_config();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let parsed = load_autorate_yaml(&yaml).unwrap();
        assert_eq!(parsed.wan_name, cfg.wan_name);
        assert_eq!(parsed.cycle_interval, cfg.cycle_interval);
    }
}
