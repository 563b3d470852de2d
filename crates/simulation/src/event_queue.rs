//! Event queue with deterministic ordering.

use oapbft_core::{Event, EventPriority};
use oapbft_types::NodeId;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Duration;

/// Key for ordering events in the queue.
///
/// Events are ordered by:
/// 1. Time (earlier first)
/// 2. Priority (timer before network before client)
/// 3. Sequence number (FIFO for same time/priority)
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct EventKey {
    pub time: Duration,
    pub priority: EventPriority,
    pub sequence: u64,
}

impl Ord for EventKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .cmp(&other.time)
            .then(self.priority.cmp(&other.priority))
            .then(self.sequence.cmp(&other.sequence))
    }
}

impl PartialOrd for EventKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Global event queue. Each entry is addressed to one node.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: BTreeMap<EventKey, (NodeId, Event)>,
    sequence: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, node: NodeId, time: Duration, event: Event) -> EventKey {
        self.sequence += 1;
        let key = EventKey {
            time,
            priority: event.priority(),
            sequence: self.sequence,
        };
        self.events.insert(key, (node, event));
        key
    }

    /// Pop the next event if it is due at or before `end_time`.
    pub fn pop_due(&mut self, end_time: Duration) -> Option<(EventKey, NodeId, Event)> {
        let (&key, _) = self.events.first_key_value()?;
        if key.time > end_time {
            return None;
        }
        self.events
            .pop_first()
            .map(|(key, (node, event))| (key, node, event))
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
