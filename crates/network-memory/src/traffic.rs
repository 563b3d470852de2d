//! Network traffic accounting.
//!
//! Tracks every message handed to the network by type and by node so a run
//! can report where the bandwidth went.

use oapbft_types::NodeId;
use serde::Serialize;
use std::collections::BTreeMap;

/// Aggregate for one message type.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MessageTypeStats {
    pub count: u64,
    pub bytes: u64,
    pub min_size: u64,
    pub max_size: u64,
}

impl MessageTypeStats {
    fn record(&mut self, size: u64) {
        if self.count == 0 || size < self.min_size {
            self.min_size = size;
        }
        self.max_size = self.max_size.max(size);
        self.count += 1;
        self.bytes += size;
    }

    pub fn avg_size(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.bytes as f64 / self.count as f64
        }
    }
}

/// Upload/download volume for one node.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeTrafficStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Traffic recorder. Keyed by `BTreeMap` so reports iterate in a stable order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TrafficStats {
    by_message_type: BTreeMap<String, MessageTypeStats>,
    by_node: BTreeMap<NodeId, NodeTrafficStats>,
    total_messages: u64,
    total_bytes: u64,
}

impl TrafficStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one delivery attempt of `size` bytes.
    pub fn record_message(&mut self, msg_type: &str, size: u64, from: NodeId, to: NodeId) {
        self.total_messages += 1;
        self.total_bytes += size;

        self.by_message_type
            .entry(msg_type.to_string())
            .or_default()
            .record(size);

        let sender = self.by_node.entry(from).or_default();
        sender.messages_sent += 1;
        sender.bytes_sent += size;

        let receiver = self.by_node.entry(to).or_default();
        receiver.messages_received += 1;
        receiver.bytes_received += size;
    }

    pub fn total_messages(&self) -> u64 {
        self.total_messages
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn message_type(&self, msg_type: &str) -> Option<&MessageTypeStats> {
        self.by_message_type.get(msg_type)
    }

    pub fn node(&self, node: NodeId) -> Option<&NodeTrafficStats> {
        self.by_node.get(&node)
    }

    /// Message types sorted by bytes, heaviest first.
    pub fn by_bandwidth(&self) -> Vec<(&str, &MessageTypeStats)> {
        let mut types: Vec<(&str, &MessageTypeStats)> = self
            .by_message_type
            .iter()
            .map(|(name, stats)| (name.as_str(), stats))
            .collect();
        types.sort_by(|a, b| b.1.bytes.cmp(&a.1.bytes).then(a.0.cmp(b.0)));
        types
    }
}
