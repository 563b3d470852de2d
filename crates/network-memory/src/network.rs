//! Simulated network with deterministic latency, packet loss, bandwidth and
//! partitions.

use oapbft_types::NodeId;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use std::time::Duration;
use tracing::trace;

/// Configuration for simulated network.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Number of nodes attached to the network.
    pub num_nodes: usize,
    /// Base one-way latency.
    pub latency: Duration,
    /// Jitter as a fraction of base latency (0.0 - 1.0).
    pub jitter_fraction: f64,
    /// Packet loss rate (0.0 - 1.0). Messages are dropped with this probability.
    pub packet_loss_rate: f64,
    /// Per-sender uplink capacity. `None` means unlimited: every message
    /// leaves the sender immediately.
    pub bandwidth_bytes_per_sec: Option<u64>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            num_nodes: 4,
            latency: Duration::from_millis(50),
            jitter_fraction: 0.1,
            packet_loss_rate: 0.0,
            bandwidth_bytes_per_sec: None,
        }
    }
}

/// Simulated network for deterministic message delivery.
///
/// Supports:
/// - Configurable latency with jitter
/// - Packet loss (probabilistic message drops)
/// - Network partitions (blocking communication between node pairs)
/// - Per-sender uplink queueing when bandwidth is limited
pub struct SimulatedNetwork {
    config: NetworkConfig,
    /// Partitioned node pairs. If (a, b) is in this set, messages from a to b are dropped.
    /// Partitions are directional - add both (a, b) and (b, a) for bidirectional partition.
    partitions: HashSet<(NodeId, NodeId)>,
    /// Time at which each sender's uplink becomes idle, indexed by `NodeId::index`.
    uplink_free_at: Vec<Duration>,
}

impl std::fmt::Debug for SimulatedNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedNetwork")
            .field("config", &self.config)
            .field("partitions", &self.partitions.len())
            .finish()
    }
}

impl SimulatedNetwork {
    pub fn new(config: NetworkConfig) -> Self {
        let uplink_free_at = vec![Duration::ZERO; config.num_nodes];
        Self {
            config,
            partitions: HashSet::new(),
            uplink_free_at,
        }
    }

    // ─── Partition Management ───

    /// Check if two nodes are partitioned (message from `from` to `to` would be dropped).
    pub fn is_partitioned(&self, from: NodeId, to: NodeId) -> bool {
        self.partitions.contains(&(from, to))
    }

    /// Create a unidirectional partition: messages from `from` to `to` are dropped.
    pub fn partition_unidirectional(&mut self, from: NodeId, to: NodeId) {
        self.partitions.insert((from, to));
    }

    pub fn partition_bidirectional(&mut self, a: NodeId, b: NodeId) {
        self.partitions.insert((a, b));
        self.partitions.insert((b, a));
    }

    /// All messages between group_a and group_b are dropped (both directions).
    pub fn partition_groups(&mut self, group_a: &[NodeId], group_b: &[NodeId]) {
        for &a in group_a {
            for &b in group_b {
                self.partition_bidirectional(a, b);
            }
        }
    }

    /// Isolate a node from all other nodes in the network.
    pub fn isolate_node(&mut self, node: NodeId) {
        for other in self.all_nodes() {
            if other != node {
                self.partition_bidirectional(node, other);
            }
        }
    }

    pub fn heal_unidirectional(&mut self, from: NodeId, to: NodeId) {
        self.partitions.remove(&(from, to));
    }

    pub fn heal_bidirectional(&mut self, a: NodeId, b: NodeId) {
        self.partitions.remove(&(a, b));
        self.partitions.remove(&(b, a));
    }

    /// Heal all partitions - restore full network connectivity.
    pub fn heal_all(&mut self) {
        self.partitions.clear();
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    // ─── Packet Loss ───

    /// Returns true if the packet should be dropped.
    pub fn should_drop_packet(&self, rng: &mut ChaCha8Rng) -> bool {
        self.config.packet_loss_rate > 0.0 && rng.gen::<f64>() < self.config.packet_loss_rate
    }

    /// Set the packet loss rate (0.0 - 1.0).
    pub fn set_packet_loss_rate(&mut self, rate: f64) {
        self.config.packet_loss_rate = rate.clamp(0.0, 1.0);
    }

    pub fn packet_loss_rate(&self) -> f64 {
        self.config.packet_loss_rate
    }

    // ─── Latency & Bandwidth ───

    /// Sample one-way propagation latency.
    pub fn sample_latency(&self, rng: &mut ChaCha8Rng) -> Duration {
        let base = self.config.latency;
        let jitter_range = base.as_secs_f64() * self.config.jitter_fraction;
        let jitter = if jitter_range > 0.0 {
            rng.gen_range(-jitter_range..jitter_range)
        } else {
            0.0
        };
        let latency_secs = (base.as_secs_f64() + jitter).max(0.001);
        Duration::from_secs_f64(latency_secs)
    }

    /// Queue `size` bytes on the sender's uplink at `now`, returning the delay
    /// until the last byte has left the sender.
    pub fn transmit(&mut self, from: NodeId, size: u64, now: Duration) -> Duration {
        let Some(bandwidth) = self.config.bandwidth_bytes_per_sec.filter(|&b| b > 0) else {
            return Duration::ZERO;
        };
        let Some(free_at) = self.uplink_free_at.get_mut(from.index()) else {
            return Duration::ZERO;
        };
        let start = (*free_at).max(now);
        let done = start + Duration::from_secs_f64(size as f64 / bandwidth as f64);
        *free_at = done;
        done - now
    }

    // ─── Message Delivery Decision ───

    /// Determine if a message of `size` bytes sent at `now` reaches `to`.
    /// Returns `None` if the message should be dropped (partition or packet loss),
    /// otherwise the total delay until delivery.
    pub fn should_deliver(
        &mut self,
        from: NodeId,
        to: NodeId,
        size: u64,
        now: Duration,
        rng: &mut ChaCha8Rng,
    ) -> Option<Duration> {
        if self.is_partitioned(from, to) {
            trace!(%from, %to, "Message dropped: partition");
            return None;
        }

        // Lost packets still occupied the sender's uplink.
        let queued = self.transmit(from, size, now);
        if self.should_drop_packet(rng) {
            trace!(%from, %to, "Message dropped: packet loss");
            return None;
        }

        Some(queued + self.sample_latency(rng))
    }

    pub fn all_nodes(&self) -> Vec<NodeId> {
        NodeId::all(self.config.num_nodes).collect()
    }

    /// Every node except `from`: the broadcast fan-out.
    pub fn peers_of(&self, from: NodeId) -> Vec<NodeId> {
        NodeId::all(self.config.num_nodes)
            .filter(|&node| node != from)
            .collect()
    }

    pub fn total_nodes(&self) -> usize {
        self.config.num_nodes
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn network(config: NetworkConfig) -> SimulatedNetwork {
        SimulatedNetwork::new(config)
    }

    #[test]
    fn test_latency_is_deterministic() {
        let network = network(NetworkConfig::default());
        let mut rng1 = ChaCha8Rng::seed_from_u64(42);
        let mut rng2 = ChaCha8Rng::seed_from_u64(42);

        assert_eq!(
            network.sample_latency(&mut rng1),
            network.sample_latency(&mut rng2),
            "Same seed should produce same latency"
        );
    }

    #[test]
    fn test_zero_jitter_is_exact() {
        let network = network(NetworkConfig {
            jitter_fraction: 0.0,
            ..Default::default()
        });
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert_eq!(network.sample_latency(&mut rng), Duration::from_millis(50));
    }

    // ─── Partition Tests ───

    #[test]
    fn test_partition_is_directional() {
        let mut network = network(NetworkConfig::default());
        network.partition_unidirectional(NodeId(1), NodeId(2));

        assert!(network.is_partitioned(NodeId(1), NodeId(2)));
        assert!(!network.is_partitioned(NodeId(2), NodeId(1)));

        network.heal_unidirectional(NodeId(1), NodeId(2));
        assert_eq!(network.partition_count(), 0);
    }

    #[test]
    fn test_isolate_and_heal() {
        let mut network = network(NetworkConfig::default());
        network.isolate_node(NodeId(3));

        for other in [NodeId(1), NodeId(2), NodeId(4)] {
            assert!(network.is_partitioned(NodeId(3), other));
            assert!(network.is_partitioned(other, NodeId(3)));
        }
        assert!(!network.is_partitioned(NodeId(1), NodeId(2)));

        network.heal_all();
        assert_eq!(network.partition_count(), 0);
    }

    #[test]
    fn test_partitioned_message_is_dropped() {
        let mut network = network(NetworkConfig::default());
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        network.partition_groups(&[NodeId(1)], &[NodeId(2), NodeId(3)]);

        assert!(network
            .should_deliver(NodeId(1), NodeId(2), 100, Duration::ZERO, &mut rng)
            .is_none());
        assert!(network
            .should_deliver(NodeId(1), NodeId(4), 100, Duration::ZERO, &mut rng)
            .is_some());
    }

    #[test]
    fn test_full_packet_loss_drops_everything() {
        let mut network = network(NetworkConfig::default());
        network.set_packet_loss_rate(1.5);
        let mut rng = ChaCha8Rng::seed_from_u64(7);

        assert_eq!(network.packet_loss_rate(), 1.0);
        for _ in 0..10 {
            assert!(network
                .should_deliver(NodeId(1), NodeId(2), 10, Duration::ZERO, &mut rng)
                .is_none());
        }
    }

    #[test]
    fn test_uplink_queues_back_to_back_sends() {
        let mut network = network(NetworkConfig {
            bandwidth_bytes_per_sec: Some(1_000),
            ..Default::default()
        });

        let first = network.transmit(NodeId(1), 500, Duration::ZERO);
        let second = network.transmit(NodeId(1), 500, Duration::ZERO);
        let other_sender = network.transmit(NodeId(2), 500, Duration::ZERO);

        assert_eq!(first, Duration::from_millis(500));
        assert_eq!(second, Duration::from_secs(1));
        assert_eq!(other_sender, Duration::from_millis(500));

        // Once the queue drains, a later send starts fresh.
        let later = network.transmit(NodeId(1), 500, Duration::from_secs(5));
        assert_eq!(later, Duration::from_millis(500));
    }

    #[test]
    fn test_unlimited_bandwidth_has_no_queueing() {
        let mut network = network(NetworkConfig::default());
        assert_eq!(
            network.transmit(NodeId(1), 1 << 20, Duration::ZERO),
            Duration::ZERO
        );
    }

    #[test]
    fn test_peers_exclude_sender() {
        let network = network(NetworkConfig::default());
        assert_eq!(
            network.peers_of(NodeId(2)),
            vec![NodeId(1), NodeId(3), NodeId(4)]
        );
    }
}
