//! Session traffic counters and the latency distribution

use crate::snapshot::{LatencySnapshot, TrafficSnapshot};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Bucket upper bounds for latency samples, in microseconds.
///
/// Spans loopback (sub-millisecond) through degraded WAN links; samples
/// beyond the last bound land in an overflow bucket.
pub const LATENCY_BUCKETS_US: [u64; 8] = [
    250, 500, 1_000, 2_500, 5_000, 10_000, 50_000, 250_000,
];

/// Distribution of one-way latency samples, in microseconds.
///
/// Fed with the session's smoothed estimate each time a latency header is
/// matched, so the distribution describes how the estimate moved over the
/// session's lifetime.
pub struct LatencyStat {
    samples: AtomicU64,
    sum_us: AtomicU64,
    max_us: AtomicU64,
    buckets: [AtomicU64; LATENCY_BUCKETS_US.len() + 1],
}

impl LatencyStat {
    fn new() -> Self {
        Self {
            samples: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
            max_us: AtomicU64::new(0),
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Record one latency sample in microseconds
    pub fn observe_us(&self, value: u64) {
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(value, Ordering::Relaxed);
        self.max_us.fetch_max(value, Ordering::Relaxed);
        let bucket = LATENCY_BUCKETS_US
            .iter()
            .position(|bound| value <= *bound)
            .unwrap_or(LATENCY_BUCKETS_US.len());
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
    }

    /// Number of samples recorded
    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    /// Mean latency in microseconds, zero before the first sample
    pub fn mean_us(&self) -> f64 {
        let samples = self.samples.load(Ordering::Relaxed);
        if samples == 0 {
            return 0.0;
        }
        self.sum_us.load(Ordering::Relaxed) as f64 / samples as f64
    }

    /// Worst latency seen, in microseconds
    pub fn max_us(&self) -> u64 {
        self.max_us.load(Ordering::Relaxed)
    }

    /// Per-bucket sample counts; the final entry is the overflow bucket
    pub fn bucket_counts(&self) -> [u64; LATENCY_BUCKETS_US.len() + 1] {
        std::array::from_fn(|index| self.buckets[index].load(Ordering::Relaxed))
    }
}

/// Traffic totals for one endpoint and its sessions.
pub struct TrafficMetrics {
    packets_in: AtomicU64,
    packets_out: AtomicU64,
    messages_in: AtomicU64,
    live_sessions: AtomicI64,
    latency: LatencyStat,
}

impl TrafficMetrics {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            packets_in: AtomicU64::new(0),
            packets_out: AtomicU64::new(0),
            messages_in: AtomicU64::new(0),
            live_sessions: AtomicI64::new(0),
            latency: LatencyStat::new(),
        }
    }

    /// Count one received packet envelope
    pub fn record_packet_in(&self) {
        self.packets_in.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one sent packet envelope
    pub fn record_packet_out(&self) {
        self.packets_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one message dispatched out of a `Messages` packet
    pub fn record_message_in(&self) {
        self.messages_in.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the current smoothed one-way latency, in seconds
    pub fn observe_latency(&self, seconds: f64) {
        if seconds.is_finite() && seconds >= 0.0 {
            self.latency.observe_us((seconds * 1e6) as u64);
        }
    }

    /// Track the number of live sessions on the endpoint
    pub fn set_live_sessions(&self, count: usize) {
        self.live_sessions.store(count as i64, Ordering::Relaxed);
    }

    /// Total received packets
    pub fn packets_in(&self) -> u64 {
        self.packets_in.load(Ordering::Relaxed)
    }

    /// Total sent packets
    pub fn packets_out(&self) -> u64 {
        self.packets_out.load(Ordering::Relaxed)
    }

    /// Total received messages
    pub fn messages_in(&self) -> u64 {
        self.messages_in.load(Ordering::Relaxed)
    }

    /// Current live session count
    pub fn live_sessions(&self) -> i64 {
        self.live_sessions.load(Ordering::Relaxed)
    }

    /// The latency distribution
    pub fn latency(&self) -> &LatencyStat {
        &self.latency
    }

    /// Snapshot the totals for export
    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            packets_in: self.packets_in(),
            packets_out: self.packets_out(),
            messages_in: self.messages_in(),
            live_sessions: self.live_sessions(),
            latency: LatencySnapshot {
                mean_us: self.latency.mean_us(),
                max_us: self.latency.max_us(),
                samples: self.latency.samples(),
            },
        }
    }
}

impl Default for TrafficMetrics {
    fn default() -> Self {
        Self::new()
    }
}
