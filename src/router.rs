//! Abstract RouterOS transport boundary (spec §4.12).
//!
//! Mirrors the teacher's `LinkSender` trait in shape: a narrow trait that
//! hides transport choice (REST vs SSH) behind operations the core actually
//! needs, with an in-memory fake for tests — "implemented by ... and by
//! mock links in tests", as the teacher's own trait doc comment puts it.

use crate::cake_stats::QueueStats;
use crate::error::RouterError;
use std::collections::HashMap;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

const VERIFY_ATTEMPTS: u32 = 3;
const VERIFY_BACKOFF_MS: [u64; 3] = [100, 200, 400];

/// Validates a router-bound identifier (queue name, mangle comment) against
/// the whitelist regex `^[A-Za-z0-9_.-]+$`, length <= 64. This is the
/// injection guard called out in spec §9 — treat it like SQL parameter
/// binding, not cosmetic input cleanup.
pub fn validate_router_identifier(value: &str) -> Result<(), RouterError> {
    let ok = !value.is_empty()
        && value.len() <= 64
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'));
    if ok {
        Ok(())
    } else {
        Err(RouterError::InvalidIdentifier(value.to_string()))
    }
}

/// Abstract RouterOS client. Transport (REST vs SSH) is an implementation
/// detail the core never inspects.
pub trait RouterClient: Send + Sync {
    fn set_rate_limits(
        &self,
        download_queue: &str,
        upload_queue: &str,
        dl_mbps: f64,
        ul_mbps: f64,
    ) -> Result<(), RouterError>;

    fn get_queue_stats(&self, queue_name: &str) -> Option<QueueStats>;

    fn enable_rule_raw(&self, comment: &str) -> Result<(), RouterError>;
    fn disable_rule_raw(&self, comment: &str) -> Result<(), RouterError>;
    fn is_rule_enabled(&self, comment: &str) -> Option<bool>;
}

/// Toggles `comment`'s rule to `target` with identifier validation and
/// bounded verification retries (spec §4.9, §4.12).
pub fn toggle_rule(
    client: &dyn RouterClient,
    comment: &str,
    target_enabled: bool,
) -> Result<(), RouterError> {
    validate_router_identifier(comment)?;

    if target_enabled {
        client.enable_rule_raw(comment)?;
    } else {
        client.disable_rule_raw(comment)?;
    }

    for (attempt, backoff_ms) in VERIFY_BACKOFF_MS.iter().enumerate() {
        if client.is_rule_enabled(comment) == Some(target_enabled) {
            return Ok(());
        }
        if attempt as u32 + 1 < VERIFY_ATTEMPTS {
            thread::sleep(Duration::from_millis(*backoff_ms));
        }
    }

    Err(RouterError::VerificationFailed {
        attempts: VERIFY_ATTEMPTS,
    })
}

/// In-memory router double for tests. Records every call for assertions and
/// can be programmed to fail writes or misreport post-toggle state to
/// exercise the verification-retry path.
#[derive(Default)]
pub struct FakeRouter {
    inner: Mutex<FakeRouterState>,
}

#[derive(Default)]
struct FakeRouterState {
    rule_enabled: HashMap<String, bool>,
    queue_stats: HashMap<String, QueueStats>,
    set_rate_limits_calls: Vec<(String, String, f64, f64)>,
    fail_set_rate_limits: bool,
    fail_enable: bool,
    fail_disable: bool,
    /// Number of `is_rule_enabled` calls to misreport before telling the
    /// truth, simulating router processing delay.
    verify_delay_calls: u32,
}

impl FakeRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_queue_stats(&self, queue: &str, stats: QueueStats) {
        self.inner
            .lock()
            .unwrap()
            .queue_stats
            .insert(queue.to_string(), stats);
    }

    pub fn fail_next_set_rate_limits(&self) {
        self.inner.lock().unwrap().fail_set_rate_limits = true;
    }

    pub fn fail_next_enable(&self) {
        self.inner.lock().unwrap().fail_enable = true;
    }

    pub fn fail_next_disable(&self) {
        self.inner.lock().unwrap().fail_disable = true;
    }

    pub fn set_verify_delay(&self, calls: u32) {
        self.inner.lock().unwrap().verify_delay_calls = calls;
    }

    pub fn set_rate_limits_call_count(&self) -> usize {
        self.inner.lock().unwrap().set_rate_limits_calls.len()
    }

    pub fn last_set_rate_limits_call(&self) -> Option<(String, String, f64, f64)> {
        self.inner
            .lock()
            .unwrap()
            .set_rate_limits_calls
            .last()
            .cloned()
    }
}

impl RouterClient for FakeRouter {
    fn set_rate_limits(
        &self,
        download_queue: &str,
        upload_queue: &str,
        dl_mbps: f64,
        ul_mbps: f64,
    ) -> Result<(), RouterError> {
        validate_router_identifier(download_queue)?;
        validate_router_identifier(upload_queue)?;
        let mut state = self.inner.lock().unwrap();
        if state.fail_set_rate_limits {
            state.fail_set_rate_limits = false;
            return Err(RouterError::Transport("simulated failure".to_string()));
        }
        state.set_rate_limits_calls.push((
            download_queue.to_string(),
            upload_queue.to_string(),
            dl_mbps,
            ul_mbps,
        ));
        Ok(())
    }

    fn get_queue_stats(&self, queue_name: &str) -> Option<QueueStats> {
        self.inner.lock().unwrap().queue_stats.get(queue_name).copied()
    }

    fn enable_rule_raw(&self, comment: &str) -> Result<(), RouterError> {
        let mut state = self.inner.lock().unwrap();
        if state.fail_enable {
            state.fail_enable = false;
            return Err(RouterError::Transport("simulated failure".to_string()));
        }
        state.rule_enabled.insert(comment.to_string(), true);
        Ok(())
    }

    fn disable_rule_raw(&self, comment: &str) -> Result<(), RouterError> {
        let mut state = self.inner.lock().unwrap();
        if state.fail_disable {
            state.fail_disable = false;
            return Err(RouterError::Transport("simulated failure".to_string()));
        }
        state.rule_enabled.insert(comment.to_string(), false);
        Ok(())
    }

    fn is_rule_enabled(&self, comment: &str) -> Option<bool> {
        let mut state = self.inner.lock().unwrap();
        if state.verify_delay_calls > 0 {
            state.verify_delay_calls -= 1;
            return state.rule_enabled.get(comment).map(|v| !v);
        }
        state.rule_enabled.get(comment).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cake_stats::QueueStats;

    #[test]
    fn identifier_validation_rejects_shell_metacharacters() {
        assert!(validate_router_identifier("wan0-download").is_ok());
        assert!(validate_router_identifier("wan0; rm -rf /").is_err());
        assert!(validate_router_identifier("$(whoami)").is_err());
    }

    #[test]
    fn toggle_rule_succeeds_on_first_verification() {
        let router = FakeRouter::new();
        assert!(toggle_rule(&router, "steer-latency", true).is_ok());
        assert_eq!(router.is_rule_enabled("steer-latency"), Some(true));
    }

    #[test]
    fn toggle_rule_retries_verification_before_succeeding() {
        let router = FakeRouter::new();
        router.set_verify_delay(2);
        assert!(toggle_rule(&router, "steer-latency", true).is_ok());
    }

    #[test]
    fn toggle_rule_fails_closed_on_invalid_comment() {
        let router = FakeRouter::new();
        let err = toggle_rule(&router, "bad;comment", true).unwrap_err();
        assert!(matches!(err, RouterError::InvalidIdentifier(_)));
        assert_eq!(router.is_rule_enabled("bad;comment"), None);
    }

    #[test]
    fn toggle_rule_propagates_raw_enable_failure() {
        let router = FakeRouter::new();
        router.fail_next_enable();
        assert!(toggle_rule(&router, "steer-latency", true).is_err());
    }

    #[test]
    fn set_rate_limits_rejects_invalid_queue_name() {
        let router = FakeRouter::new();
        let err = router
            .set_rate_limits("wan0`id`", "wan0-upload", 500.0, 100.0)
            .unwrap_err();
        assert!(matches!(err, RouterError::InvalidIdentifier(_)));
        assert_eq!(router.set_rate_limits_call_count(), 0);
    }

    #[test]
    fn fake_router_get_queue_stats_roundtrips() {
        let router = FakeRouter::new();
        let stats = QueueStats {
            bytes: 100,
            packets: 10,
            dropped: 1,
            queued_packets: 3,
        };
        router.set_queue_stats("wan0-download", stats);
        assert_eq!(router.get_queue_stats("wan0-download"), Some(stats));
        assert_eq!(router.get_queue_stats("missing"), None);
    }
}
