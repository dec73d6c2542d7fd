//! RTT measurer: concurrent reflector fanout with median-of-three
//! aggregation (spec §4.2).
//!
//! ICMP ping execution itself is an external collaborator (spec §1); this
//! module only owns aggregation policy. `Pinger` is the seam, mirroring the
//! teacher's `LinkSender` trait pattern of hiding the real transport behind
//! a narrow interface with an in-memory fake for tests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Abstract single-reflector ping. Implementations MUST treat non-zero
/// exit, timeout, and parse failure as `None`, never as a panic or error
/// that aborts the cycle (spec §4.2).
pub trait Pinger: Send + Sync {
    fn ping(&self, reflector: &str, timeout: Duration) -> Option<f64>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub rtt_ms: f64,
    pub samples_used: u32,
    pub per_reflector: BTreeMap<String, Option<f64>>,
}

pub struct RttMeasurer {
    pinger: Arc<dyn Pinger>,
    reflectors: Vec<String>,
    median_of_three: bool,
    ping_timeout: Duration,
}

impl RttMeasurer {
    pub fn new(
        pinger: Arc<dyn Pinger>,
        reflectors: Vec<String>,
        median_of_three: bool,
        ping_timeout: Duration,
    ) -> Self {
        RttMeasurer {
            pinger,
            reflectors,
            median_of_three,
            ping_timeout,
        }
    }

    /// Pings the configured reflectors and aggregates the result per spec
    /// §4.2. Returns `None` only when every attempted reflector failed.
    pub fn measure(&self) -> Option<Sample> {
        if self.median_of_three && self.reflectors.len() >= 3 {
            self.measure_median_of_three()
        } else {
            self.measure_single()
        }
    }

    fn measure_single(&self) -> Option<Sample> {
        let reflector = self.reflectors.first()?;
        let rtt = self.pinger.ping(reflector, self.ping_timeout);
        let mut per_reflector = BTreeMap::new();
        per_reflector.insert(reflector.clone(), rtt);
        rtt.map(|rtt_ms| Sample {
            rtt_ms,
            samples_used: 1,
            per_reflector,
        })
    }

    fn measure_median_of_three(&self) -> Option<Sample> {
        let targets: Vec<String> = self.reflectors.iter().take(3).cloned().collect();
        let timeout = self.ping_timeout;

        let handles: Vec<_> = targets
            .iter()
            .cloned()
            .map(|reflector| {
                let pinger = Arc::clone(&self.pinger);
                thread::spawn(move || {
                    let rtt = pinger.ping(&reflector, timeout);
                    (reflector, rtt)
                })
            })
            .collect();

        let mut per_reflector: BTreeMap<String, Option<f64>> = BTreeMap::new();
        for handle in handles {
            let (reflector, rtt) = handle.join().expect("ping worker thread panicked");
            per_reflector.insert(reflector, rtt);
        }

        // Deterministic tie-break: iterate in lexicographic reflector
        // order, which BTreeMap already guarantees.
        let successes: Vec<f64> = per_reflector
            .iter()
            .filter_map(|(_, v)| *v)
            .collect();

        let rtt_ms = match successes.len() {
            0 => return None,
            1 => successes[0],
            _ => median(&successes),
        };

        Some(Sample {
            rtt_ms,
            samples_used: successes.len() as u32,
            per_reflector,
        })
    }
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("RTT values must be finite"));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}


#[cfg(test)]
mod tests {
    use super::fakes::FakePinger;
    use super::*;

    #[test]
    fn single_reflector_mode_uses_first_reflector_only() {
        let pinger = Arc::new(FakePinger::new());
        pinger.set("1.1.1.1", Some(12.5));
        pinger.set("8.8.8.8", Some(99.0));
        let measurer = RttMeasurer::new(
            pinger,
            vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()],
            false,
            Duration::from_millis(200),
        );
        let sample = measurer.measure().unwrap();
        assert_eq!(sample.rtt_ms, 12.5);
        assert_eq!(sample.samples_used, 1);
    }

    #[test]
    fn single_reflector_failure_returns_none() {
        let pinger = Arc::new(FakePinger::new());
        pinger.set("1.1.1.1", None);
        let measurer = RttMeasurer::new(
            pinger,
            vec!["1.1.1.1".to_string()],
            false,
            Duration::from_millis(200),
        );
        assert!(measurer.measure().is_none());
    }

    #[test]
    fn median_of_three_all_succeed() {
        let pinger = Arc::new(FakePinger::new());
        pinger.set("a", Some(10.0));
        pinger.set("b", Some(20.0));
        pinger.set("c", Some(30.0));
        let measurer = RttMeasurer::new(
            pinger,
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
            true,
            Duration::from_millis(200),
        );
        let sample = measurer.measure().unwrap();
        assert_eq!(sample.rtt_ms, 20.0);
        assert_eq!(sample.samples_used, 3);
    }

    #[test]
    fn median_of_three_one_failure_uses_remaining_median() {
        let pinger = Arc::new(FakePinger::new());
        pinger.set("a", Some(10.0));
        pinger.set("b", None);
        pinger.set("c", Some(30.0));
        let measurer = RttMeasurer::new(
            pinger,
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
            true,
            Duration::from_millis(200),
        );
        let sample = measurer.measure().unwrap();
        assert_eq!(sample.rtt_ms, 20.0); // median of {10, 30}
        assert_eq!(sample.samples_used, 2);
    }

    #[test]
    fn median_of_three_single_success_used_directly() {
        let pinger = Arc::new(FakePinger::new());
        pinger.set("a", None);
        pinger.set("b", Some(42.0));
        pinger.set("c", None);
        let measurer = RttMeasurer::new(
            pinger,
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
            true,
            Duration::from_millis(200),
        );
        let sample = measurer.measure().unwrap();
        assert_eq!(sample.rtt_ms, 42.0);
        assert_eq!(sample.samples_used, 1);
    }

    #[test]
    fn median_of_three_all_fail_returns_none() {
        let pinger = Arc::new(FakePinger::new());
        pinger.set("a", None);
        pinger.set("b", None);
        pinger.set("c", None);
        let measurer = RttMeasurer::new(
            pinger,
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
            true,
            Duration::from_millis(200),
        );
        assert!(measurer.measure().is_none());
    }

    #[test]
    fn fewer_than_three_reflectors_falls_back_to_single() {
        let pinger = Arc::new(FakePinger::new());
        pinger.set("a", Some(7.0));
        let measurer = RttMeasurer::new(
            pinger,
            vec!["a".to_string(), "b".to_string()],
            true,
            Duration::from_millis(200),
        );
        let sample = measurer.measure().unwrap();
        assert_eq!(sample.rtt_ms, 7.0);
        assert_eq!(sample.samples_used, 1);
    }
}
