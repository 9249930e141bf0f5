//! Traffic snapshot export

use serde::{Deserialize, Serialize};

/// Latency summary at a point in time, in microseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencySnapshot {
    /// Mean of the recorded estimates
    pub mean_us: f64,
    /// Worst recorded estimate
    pub max_us: u64,
    /// Number of samples behind the summary
    pub samples: u64,
}

/// Session traffic totals at a point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficSnapshot {
    /// Received packet envelopes
    pub packets_in: u64,
    /// Sent packet envelopes
    pub packets_out: u64,
    /// Messages dispatched out of `Messages` packets
    pub messages_in: u64,
    /// Sessions currently registered on the endpoint
    pub live_sessions: i64,
    /// Latency summary
    pub latency: LatencySnapshot,
}

impl TrafficSnapshot {
    /// Export as JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
