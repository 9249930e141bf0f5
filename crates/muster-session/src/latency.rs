//! Round-trip latency tracking
//!
//! Every outgoing packet carries a fresh 16-bit id and echoes the last
//! received one plus the time the echo sat idle (hundreds of microseconds,
//! clamped). Matching an echo against the send time of the referenced packet
//! yields the round trip; latency is half of it, exponentially smoothed.

use std::time::{Duration, Instant};

/// The three latency fields of a packet envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyHeader {
    /// Rolling id of this packet
    pub generated_id: u16,
    /// Last id received from the peer
    pub received_id: u16,
    /// Time since the last received packet, in hundreds of microseconds
    pub idle_time: u16,
}

/// Tracks the smoothed one-way latency of a session.
pub struct LatencyTracker {
    generated: Vec<(u16, Instant)>,
    last_generated_id: u16,
    last_received_id: u16,
    last_received_time: Instant,
    latency: f64,
}

impl LatencyTracker {
    /// Create a tracker with zero latency
    pub fn new() -> Self {
        Self {
            generated: Vec::new(),
            last_generated_id: 0,
            last_received_id: 0,
            last_received_time: Instant::now(),
            latency: 0.0,
        }
    }

    /// The smoothed one-way latency in seconds
    pub fn latency(&self) -> f64 {
        self.latency
    }

    /// Stamp an outgoing packet
    pub fn generate_header(&mut self) -> LatencyHeader {
        self.last_generated_id = self.last_generated_id.wrapping_add(1);
        let now = Instant::now();
        self.generated.push((self.last_generated_id, now));
        LatencyHeader {
            generated_id: self.last_generated_id,
            received_id: self.last_received_id,
            idle_time: duration_to_idle_time(now - self.last_received_time),
        }
    }

    /// Fold an incoming packet's header into the estimate
    pub fn receive_header(&mut self, header: LatencyHeader) {
        let matched = self
            .generated
            .iter()
            .position(|(id, _)| *id == header.received_id);
        self.last_received_id = header.generated_id;
        self.last_received_time = Instant::now();
        if let Some(index) = matched {
            let sent_at = self.generated[index].1;
            let rtt = self
                .last_received_time
                .saturating_duration_since(sent_at)
                .saturating_sub(idle_time_to_duration(header.idle_time));
            // latency is half the round-trip time
            let sample = rtt.as_secs_f64() * 0.5;
            self.latency = 0.7 * self.latency + 0.3 * sample;
            self.generated.drain(..=index);
        }
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn duration_to_idle_time(value: Duration) -> u16 {
    let hundreds_of_micros = value.as_micros() / 100;
    hundreds_of_micros.min(u16::MAX as u128) as u16
}

fn idle_time_to_duration(value: u16) -> Duration {
    Duration::from_micros(value as u64 * 100)
}
