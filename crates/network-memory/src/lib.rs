//! Deterministic in-memory network transport for simulation.
//!
//! Provides [`SimulatedNetwork`] with configurable latency, packet loss,
//! per-sender bandwidth and network partitions, all driven by a seeded RNG
//! for reproducibility.
//!
//! [`TrafficStats`] tracks per-message-type and per-node volume.

mod network;
mod traffic;

pub use network::{NetworkConfig, SimulatedNetwork};
pub use traffic::{MessageTypeStats, NodeTrafficStats, TrafficStats};
