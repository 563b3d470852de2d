//! Deterministic simulation runner.
//!
//! Every node is an independent [`NodeStateMachine`] with its own chain.
//! The runner pops events in [`EventKey`] order, hands each to its node,
//! and turns the returned actions into future events through the
//! [`SimulatedNetwork`].

use crate::config::SimulationConfig;
use crate::event_queue::{EventKey, EventQueue};
use oapbft_bft::{FaultBehavior, RandomPayload};
use oapbft_core::{Action, Event, EventPriority, StateMachine};
use oapbft_network_memory::{SimulatedNetwork, TrafficStats};
use oapbft_node::NodeStateMachine;
use oapbft_types::{ConfigError, Hash, Message, NodeId, Term};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, trace};

/// Statistics collected during simulation.
#[derive(Debug, Default, Clone, Serialize)]
pub struct SimulationStats {
    /// Total events processed.
    pub events_processed: u64,
    /// Events processed, indexed by [`EventPriority`].
    pub events_by_priority: [u64; EventPriority::COUNT],
    /// Total actions generated.
    pub actions_generated: u64,
    /// Messages sent (successfully scheduled for delivery).
    pub messages_sent: u64,
    /// Messages dropped due to network partition.
    pub messages_dropped_partition: u64,
    /// Messages dropped due to packet loss.
    pub messages_dropped_loss: u64,
    /// Estimated bytes of delivered messages.
    pub bytes_sent: u64,
    pub timers_set: u64,
    /// Conflicting blocks reported by any node.
    pub forks_detected: u64,
}

impl SimulationStats {
    /// Total messages dropped (partition + packet loss).
    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped_partition + self.messages_dropped_loss
    }

    /// Message delivery rate (sent / (sent + dropped)).
    pub fn delivery_rate(&self) -> f64 {
        let total = self.messages_sent + self.messages_dropped();
        if total == 0 {
            1.0
        } else {
            self.messages_sent as f64 / total as f64
        }
    }
}

/// Cross-node audit failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SafetyViolation {
    #[error("term {term}: {first} and {second} closed different blocks")]
    DivergentBlock {
        term: Term,
        first: NodeId,
        second: NodeId,
    },

    #[error("{count} conflicting block(s) reported by nodes")]
    ForkReported { count: u64 },
}

/// Deterministic simulation runner.
///
/// Processes events in deterministic order and executes actions.
/// Given the same seed, produces identical results every run.
pub struct SimulationRunner {
    /// All nodes, indexed by `NodeId::index`.
    nodes: Vec<NodeStateMachine>,
    queue: EventQueue,
    now: Duration,
    network: SimulatedNetwork,
    /// RNG for network conditions (seeded for determinism).
    rng: ChaCha8Rng,
    traffic: TrafficStats,
    stats: SimulationStats,
}

impl std::fmt::Debug for SimulationRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationRunner")
            .field("nodes", &self.nodes.len())
            .field("pending_events", &self.queue.len())
            .field("now", &self.now)
            .field("network", &self.network)
            .finish()
    }
}

impl SimulationRunner {
    /// Create a runner with one node per `config.params.num_nodes`.
    pub fn new(config: SimulationConfig, seed: u64) -> Result<Self, ConfigError> {
        config.params.validate()?;

        let network = SimulatedNetwork::new(config.network.clone());
        let nodes: Vec<NodeStateMachine> = NodeId::all(config.params.num_nodes)
            .map(|node| {
                let node_seed = seed.wrapping_add(node.0).wrapping_mul(0x517c_c1b7_2722_0a95);
                NodeStateMachine::new(
                    node,
                    config.params,
                    config.bft.clone(),
                    config.sync.clone(),
                    Box::new(RandomPayload::new(node_seed, config.payload_size)),
                    node_seed,
                )
            })
            .collect();

        info!(
            num_nodes = nodes.len(),
            committee_size = config.params.committee_size,
            num_byz = config.params.num_byz,
            sharing_threshold = config.params.sharing_threshold,
            seed,
            "Created simulation runner"
        );

        Ok(Self {
            nodes,
            queue: EventQueue::new(),
            now: Duration::ZERO,
            network,
            rng: ChaCha8Rng::seed_from_u64(seed),
            traffic: TrafficStats::new(),
            stats: SimulationStats::default(),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    pub fn traffic(&self) -> &TrafficStats {
        &self.traffic
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn node(&self, node: NodeId) -> Option<&NodeStateMachine> {
        self.nodes.get(node.index())
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeStateMachine> {
        self.nodes.iter()
    }

    pub fn network(&self) -> &SimulatedNetwork {
        &self.network
    }

    /// Mutable network access for partition/loss configuration.
    pub fn network_mut(&mut self) -> &mut SimulatedNetwork {
        &mut self.network
    }

    /// Highest closed term per node.
    pub fn heights(&self) -> Vec<Term> {
        self.nodes
            .iter()
            .map(|node| node.chain().highest_term())
            .collect()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Scenario setup
    // ═══════════════════════════════════════════════════════════════════════

    pub fn set_fault_behavior(&mut self, node: NodeId, fault: Box<dyn FaultBehavior>) {
        if let Some(sm) = self.nodes.get_mut(node.index()) {
            info!(%node, fault = fault.name(), "Assigning fault behaviour");
            sm.set_fault(fault);
        }
    }

    /// Start every node now.
    pub fn start_all(&mut self) {
        for node in NodeId::all(self.nodes.len()) {
            self.start_node(node, Duration::ZERO);
        }
    }

    /// Start `node` after `delay`.
    pub fn start_node(&mut self, node: NodeId, delay: Duration) {
        self.schedule_event(node, self.now + delay, Event::Start);
    }

    /// Put `node` to sleep at absolute time `at` for `duration`.
    pub fn sleep_node(&mut self, node: NodeId, at: Duration, duration: Duration) {
        self.schedule_event(node, at, Event::Sleep { duration });
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Main loop
    // ═══════════════════════════════════════════════════════════════════════

    /// Run until no events remain at or before `end_time`.
    pub fn run_until(&mut self, end_time: Duration) {
        trace!(
            end_time_secs = end_time.as_secs_f64(),
            "Running simulation step"
        );

        while let Some((key, node, event)) = self.queue.pop_due(end_time) {
            self.now = key.time;
            self.stats.events_processed += 1;
            self.stats.events_by_priority[key.priority as usize] += 1;

            let Some(sm) = self.nodes.get_mut(node.index()) else {
                debug!(%node, "Event for unknown node");
                continue;
            };
            sm.set_time(self.now);
            let actions = sm.handle(event);
            self.stats.actions_generated += actions.len() as u64;

            for action in actions {
                self.process_action(node, action);
            }
        }

        // Always advance time to end_time, even if we ran out of events.
        if self.now < end_time {
            self.now = end_time;
        }

        trace!(
            events_processed = self.stats.events_processed,
            remaining_events = self.queue.len(),
            final_time = ?self.now,
            "Simulation step complete"
        );
    }

    fn process_action(&mut self, from: NodeId, action: Action) {
        match action {
            Action::Unicast { to, message } => self.deliver(from, &[to], message),
            Action::Multicast { to, message } => self.deliver(from, &to, message),
            Action::Broadcast { message } | Action::Fastcast { message } => {
                let peers = self.network.peers_of(from);
                self.deliver(from, &peers, message);
            }
            Action::SetTimer {
                id,
                token,
                duration,
            } => {
                self.stats.timers_set += 1;
                self.schedule_event(from, self.now + duration, id.into_event(token));
            }
            Action::StartSync { observed_term } => {
                trace!(node = %from, observed_term, "Sync request left the node unhandled");
            }
            Action::ForkDetected {
                term,
                local,
                incoming,
            } => {
                self.stats.forks_detected += 1;
                error!(
                    node = %from,
                    term,
                    ?local,
                    ?incoming,
                    "Fork detected"
                );
            }
        }
    }

    fn schedule_event(&mut self, node: NodeId, time: Duration, event: Event) -> EventKey {
        self.queue.schedule(node, time, event)
    }

    /// Send one message to each of `targets`, accounting for partitions,
    /// packet loss and the sender's uplink.
    fn deliver(&mut self, from: NodeId, targets: &[NodeId], message: Message) {
        let size = bincode::serialized_size(&message).unwrap_or(0);
        let tag = message.tag().to_string();

        for &to in targets {
            match self
                .network
                .should_deliver(from, to, size, self.now, &mut self.rng)
            {
                None if self.network.is_partitioned(from, to) => {
                    self.stats.messages_dropped_partition += 1;
                }
                None => self.stats.messages_dropped_loss += 1,
                Some(delay) => {
                    self.stats.messages_sent += 1;
                    self.stats.bytes_sent += size;
                    self.traffic.record_message(&tag, size, from, to);
                    self.schedule_event(
                        to,
                        self.now + delay,
                        Event::MessageReceived {
                            from,
                            message: message.clone(),
                        },
                    );
                }
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Audit
    // ═══════════════════════════════════════════════════════════════════════

    /// Every term closed by more than one node must have closed to the same
    /// decrypted block everywhere, and no node may have reported a fork.
    pub fn verify_safety(&self) -> Result<(), SafetyViolation> {
        if self.stats.forks_detected > 0 {
            return Err(SafetyViolation::ForkReported {
                count: self.stats.forks_detected,
            });
        }

        let mut reference: BTreeMap<Term, (NodeId, Hash)> = BTreeMap::new();
        for sm in &self.nodes {
            for (&term, block) in sm.chain().closed_blocks() {
                match reference.entry(term) {
                    Entry::Vacant(slot) => {
                        slot.insert((sm.node(), block.decrypted.hash));
                    }
                    Entry::Occupied(slot) => {
                        let (first, hash) = *slot.get();
                        if hash != block.decrypted.hash {
                            return Err(SafetyViolation::DivergentBlock {
                                term,
                                first,
                                second: sm.node(),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oapbft_types::ConsensusParams;

    fn runner(seed: u64) -> SimulationRunner {
        let params = ConsensusParams::new(4, 4, 1, 2).unwrap();
        SimulationRunner::new(SimulationConfig::new(params), seed).unwrap()
    }

    #[test]
    fn test_invalid_params_are_rejected() {
        let mut params = ConsensusParams::new(4, 4, 1, 2).unwrap();
        params.committee_size = 9;
        assert!(SimulationRunner::new(SimulationConfig::new(params), 1).is_err());
    }

    #[test]
    fn test_nothing_happens_before_start() {
        let mut runner = runner(1);
        runner.run_until(Duration::from_secs(5));

        assert_eq!(runner.stats().events_processed, 0);
        assert_eq!(runner.now(), Duration::from_secs(5));
        assert_eq!(runner.heights(), vec![0; 4]);
    }

    #[test]
    fn test_isolated_network_makes_no_progress() {
        let mut runner = runner(3);
        for node in NodeId::all(4) {
            runner.network_mut().isolate_node(node);
        }
        runner.start_all();
        runner.run_until(Duration::from_secs(3));

        assert_eq!(runner.heights(), vec![0; 4]);
        assert!(runner.stats().messages_dropped_partition > 0);
        assert_eq!(runner.stats().messages_sent, 0);
        assert!(runner.verify_safety().is_ok());
    }

    #[test]
    fn test_traffic_is_recorded_by_tag() {
        let mut runner = runner(5);
        runner.start_all();
        runner.run_until(Duration::from_secs(2));

        let traffic = runner.traffic();
        assert!(traffic
            .message_type("ConsensusMessage/PrePrepare")
            .is_some_and(|stats| stats.count > 0));
        assert_eq!(traffic.total_messages(), runner.stats().messages_sent);
        assert_eq!(traffic.total_bytes(), runner.stats().bytes_sent);
    }
}
