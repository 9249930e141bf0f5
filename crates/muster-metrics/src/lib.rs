//! # muster-metrics
//!
//! Traffic metrics for the Muster session layer: packet and message
//! counters, the live session count, and the distribution of the smoothed
//! one-way latency estimate. One [`TrafficMetrics`] store exists per
//! endpoint, shared by its sessions, and exports as a JSON
//! [`TrafficSnapshot`].

#![warn(missing_docs)]
#![warn(clippy::all)]

mod snapshot;
mod traffic;

pub use snapshot::{LatencySnapshot, TrafficSnapshot};
pub use traffic::{LatencyStat, TrafficMetrics, LATENCY_BUCKETS_US};
