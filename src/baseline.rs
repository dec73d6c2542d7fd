//! Baseline RTT loader (spec §4.4).
//!
//! Security-relevant: this is the only thing standing between a corrupted
//! or compromised autorate state file and a steering controller that
//! trusts a bogus baseline forever. The absolute ceiling in
//! [`config::ABSOLUTE_MAX_BASELINE_MS`](crate::config::ABSOLUTE_MAX_BASELINE_MS)
//! applies even if the configured bounds would allow a wider range (spec §9).

use crate::config::ABSOLUTE_MAX_BASELINE_MS;
use crate::metrics::ControllerMetrics;
use crate::state_store;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct PersistedBaselineRecord {
    schema_version: u32,
    baseline_rtt_ms: f64,
    #[allow(dead_code)]
    load_rtt_ms: f64,
}

impl crate::state_store::Versioned for PersistedBaselineRecord {
    fn schema_version(&self) -> u32 {
        self.schema_version
    }
}

/// Reads the primary autorate's persisted record at `primary_state_path`
/// and returns its `baseline_rtt_ms` iff it parses and falls within
/// `(min_ms, max_ms)` and the compile-time absolute ceiling. A record that
/// parses but fails bounds checking counts against `baseline_reject_total`;
/// a missing or malformed file does not, since that's cold-start, not a
/// rejected value.
pub fn load(
    primary_state_path: &Path,
    min_ms: f64,
    max_ms: f64,
    metrics: &ControllerMetrics,
) -> Option<f64> {
    let record: PersistedBaselineRecord = state_store::load(primary_state_path)?;
    let hard_max = max_ms.min(ABSOLUTE_MAX_BASELINE_MS);

    if !record.baseline_rtt_ms.is_finite() {
        metrics.inc_baseline_reject();
        return None;
    }
    if record.baseline_rtt_ms < min_ms || record.baseline_rtt_ms > hard_max {
        metrics.inc_baseline_reject();
        return None;
    }
    Some(record.baseline_rtt_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write_record(path: &Path, baseline_rtt_ms: f64) {
        let json = serde_json::json!({
            "schema_version": 1,
            "baseline_rtt_ms": baseline_rtt_ms,
            "load_rtt_ms": baseline_rtt_ms,
        });
        fs::write(path, serde_json::to_vec(&json).unwrap()).unwrap();
    }

    #[test]
    fn in_bounds_baseline_accepted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("autorate-state.json");
        write_record(&path, 25.0);
        let metrics = ControllerMetrics::new();
        assert_eq!(load(&path, 10.0, 60.0, &metrics), Some(25.0));
        assert_eq!(metrics.baseline_reject_total.load(std::sync::atomic::Ordering::Relaxed), 0);
    }

    #[test]
    fn below_configured_min_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("autorate-state.json");
        write_record(&path, 2.0);
        let metrics = ControllerMetrics::new();
        assert_eq!(load(&path, 10.0, 60.0, &metrics), None);
        assert_eq!(metrics.baseline_reject_total.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn above_configured_max_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("autorate-state.json");
        write_record(&path, 200.0);
        let metrics = ControllerMetrics::new();
        assert_eq!(load(&path, 10.0, 60.0, &metrics), None);
    }

    #[test]
    fn absolute_ceiling_enforced_even_with_wide_configured_bounds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("autorate-state.json");
        // A compromised or buggy autorate persisting a 10-second baseline.
        write_record(&path, 10_000.0);
        let metrics = ControllerMetrics::new();
        assert_eq!(load(&path, 0.0, 100_000.0, &metrics), None);
    }

    #[test]
    fn non_finite_baseline_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("autorate-state.json");
        let json = serde_json::json!({
            "schema_version": 1,
            "baseline_rtt_ms": "NaN",
            "load_rtt_ms": 25.0,
        });
        fs::write(&path, serde_json::to_vec(&json).unwrap()).unwrap();
        let metrics = ControllerMetrics::new();
        assert_eq!(load(&path, 10.0, 60.0, &metrics), None);
    }

    #[test]
    fn missing_file_returns_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let metrics = ControllerMetrics::new();
        assert_eq!(load(&path, 10.0, 60.0, &metrics), None);
        assert_eq!(metrics.baseline_reject_total.load(std::sync::atomic::Ordering::Relaxed), 0);
    }

    #[test]
    fn malformed_json_returns_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("autorate-state.json");
        fs::write(&path, b"not json").unwrap();
        let metrics = ControllerMetrics::new();
        assert_eq!(load(&path, 10.0, 60.0, &metrics), None);
    }
}
