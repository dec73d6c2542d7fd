//! CAKE per-queue statistics reader and cycle-over-cycle delta computation
//! (spec §4.3).

use std::collections::HashMap;

/// A raw snapshot of one queue's counters, as read from the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub bytes: u64,
    pub packets: u64,
    pub dropped: u64,
    pub queued_packets: u64,
}

/// Cumulative-field deltas plus the raw instantaneous queue depth, computed
/// relative to the previous successful read of the same queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueDeltas {
    pub bytes_delta: u64,
    pub packets_delta: u64,
    pub dropped_delta: u64,
    pub queued_packets: u64,
}

fn saturating_delta(current: u64, previous: u64) -> u64 {
    // Counters that roll or reset produce a cycle of zero-delta rather
    // than a negative one (spec §4.3 policy).
    current.saturating_sub(previous)
}

/// Tracks per-queue previous readings and turns raw reads from a
/// `RouterClient` into deltas. A read failure never corrupts the cached
/// previous value for that queue.
pub struct CakeStatsReader {
    previous: HashMap<String, QueueStats>,
}

impl CakeStatsReader {
    pub fn new() -> Self {
        CakeStatsReader {
            previous: HashMap::new(),
        }
    }

    /// Folds a raw `QueueStats` read into deltas against the cached
    /// previous value for `queue_name`. The first successful read for a
    /// queue establishes the baseline and returns zero deltas.
    pub fn observe(&mut self, queue_name: &str, current: QueueStats) -> QueueDeltas {
        let deltas = match self.previous.get(queue_name) {
            None => QueueDeltas {
                bytes_delta: 0,
                packets_delta: 0,
                dropped_delta: 0,
                queued_packets: current.queued_packets,
            },
            Some(prev) => QueueDeltas {
                bytes_delta: saturating_delta(current.bytes, prev.bytes),
                packets_delta: saturating_delta(current.packets, prev.packets),
                dropped_delta: saturating_delta(current.dropped, prev.dropped),
                queued_packets: current.queued_packets,
            },
        };
        self.previous.insert(queue_name.to_string(), current);
        deltas
    }
}

impl Default for CakeStatsReader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(bytes: u64, packets: u64, dropped: u64, queued: u64) -> QueueStats {
        QueueStats {
            bytes,
            packets,
            dropped,
            queued_packets: queued,
        }
    }

    #[test]
    fn first_read_establishes_baseline_with_zero_deltas() {
        let mut reader = CakeStatsReader::new();
        let deltas = reader.observe("wan0-download", stats(1000, 10, 1, 5));
        assert_eq!(deltas.bytes_delta, 0);
        assert_eq!(deltas.packets_delta, 0);
        assert_eq!(deltas.dropped_delta, 0);
        assert_eq!(deltas.queued_packets, 5);
    }

    #[test]
    fn subsequent_read_computes_deltas() {
        let mut reader = CakeStatsReader::new();
        reader.observe("wan0-download", stats(1000, 10, 1, 5));
        let deltas = reader.observe("wan0-download", stats(1500, 15, 3, 8));
        assert_eq!(deltas.bytes_delta, 500);
        assert_eq!(deltas.packets_delta, 5);
        assert_eq!(deltas.dropped_delta, 2);
        assert_eq!(deltas.queued_packets, 8);
    }

    #[test]
    fn counter_reset_clamps_to_zero_delta_for_one_cycle() {
        let mut reader = CakeStatsReader::new();
        reader.observe("wan0-download", stats(100_000, 1000, 10, 5));
        // Router rebooted; counters reset to near zero.
        let deltas = reader.observe("wan0-download", stats(100, 1, 0, 2));
        assert_eq!(deltas.bytes_delta, 0);
        assert_eq!(deltas.packets_delta, 0);
        assert_eq!(deltas.dropped_delta, 0);
        assert_eq!(deltas.queued_packets, 2);

        // Next cycle resumes normal delta computation from the new baseline.
        let deltas2 = reader.observe("wan0-download", stats(300, 4, 1, 3));
        assert_eq!(deltas2.bytes_delta, 200);
        assert_eq!(deltas2.packets_delta, 3);
        assert_eq!(deltas2.dropped_delta, 1);
    }

    #[test]
    fn separate_queues_tracked_independently() {
        let mut reader = CakeStatsReader::new();
        reader.observe("wan0-download", stats(1000, 10, 0, 1));
        reader.observe("wan0-upload", stats(500, 5, 0, 1));
        let dl = reader.observe("wan0-download", stats(1200, 12, 0, 2));
        let ul = reader.observe("wan0-upload", stats(520, 6, 0, 0));
        assert_eq!(dl.bytes_delta, 200);
        assert_eq!(ul.bytes_delta, 20);
    }
}
