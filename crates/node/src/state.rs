//! Node state machine.

use crate::syncer::{SyncConfig, SyncStatus, Syncer};
use oapbft_bft::{BftConfig, ConsensusEngine, FaultBehavior, PayloadSource};
use oapbft_core::{Action, Event, StateMachine, TimerId, TimerSet, TimerToken};
use oapbft_storage::ChainStore;
use oapbft_types::{ConsensusParams, CryptoMessage, Message, NodeId, SyncMessage};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, instrument, trace};

/// Combined node state machine.
///
/// Composes the consensus engine and the syncer into a single state machine
/// and owns the node's lifecycle: nothing is processed before `Start`, and
/// nothing but the matching `WakeUp` is processed while asleep.
pub struct NodeStateMachine {
    node: NodeId,
    engine: ConsensusEngine,
    syncer: Syncer,
    started: bool,
    asleep: bool,
    /// Wake timer only.
    timers: TimerSet,
    now: Duration,
}

impl std::fmt::Debug for NodeStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeStateMachine")
            .field("node", &self.node)
            .field("term", &self.engine.term())
            .field("view", &self.engine.view())
            .field("height", &self.engine.chain().highest_term())
            .field("started", &self.started)
            .field("asleep", &self.asleep)
            .field("now", &self.now)
            .finish()
    }
}

impl NodeStateMachine {
    /// Create a node. `seed` drives sync peer selection.
    pub fn new(
        node: NodeId,
        params: ConsensusParams,
        bft_config: BftConfig,
        sync_config: SyncConfig,
        payload: Box<dyn PayloadSource>,
        seed: u64,
    ) -> Self {
        let syncer = Syncer::new(node, &params, sync_config, seed);
        Self {
            node,
            engine: ConsensusEngine::new(node, params, bft_config, payload),
            syncer,
            started: false,
            asleep: false,
            timers: TimerSet::new(),
            now: Duration::ZERO,
        }
    }

    pub fn with_fault(mut self, fault: Box<dyn FaultBehavior>) -> Self {
        self.engine.set_fault(fault);
        self
    }

    pub fn set_fault(&mut self, fault: Box<dyn FaultBehavior>) {
        self.engine.set_fault(fault);
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn engine(&self) -> &ConsensusEngine {
        &self.engine
    }

    pub fn chain(&self) -> &ChainStore {
        self.engine.chain()
    }

    pub fn syncer(&self) -> &Syncer {
        &self.syncer
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.syncer.status(self.engine.chain().highest_term())
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_asleep(&self) -> bool {
        self.asleep
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    fn on_start(&mut self) -> Vec<Action> {
        if self.started {
            debug!(node = %self.node, "Already started");
            return vec![];
        }
        self.started = true;
        info!(node = %self.node, "Node started");
        self.engine.init_consensus()
    }

    fn on_sleep(&mut self, duration: Duration) -> Vec<Action> {
        self.asleep = true;
        self.engine.begin_sync();
        info!(node = %self.node, ?duration, "Going to sleep");
        vec![self.timers.arm(TimerId::Wake, duration)]
    }

    fn on_wake(&mut self, token: TimerToken) -> Vec<Action> {
        if !self.timers.fire(TimerId::Wake, token) {
            trace!(node = %self.node, ?token, "Stale wake timer");
            return vec![];
        }
        self.asleep = false;
        info!(
            node = %self.node,
            height = self.engine.chain().highest_term(),
            "Woke up, catching up"
        );
        // Retry timers were lost while asleep, so always issue a fresh request.
        self.engine.begin_sync();
        let actions = self
            .syncer
            .request_sync(self.engine.chain().highest_term());
        if !self.syncer.is_syncing() {
            // Single-node network: nobody to ask.
            return self.engine.resume_live();
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Routing
    // ═══════════════════════════════════════════════════════════════════════

    fn on_message(&mut self, from: NodeId, message: Message) -> Vec<Action> {
        trace!(node = %self.node, %from, tag = %message.tag(), "Routing message");
        match message {
            Message::Consensus(msg) => self.engine.handle_message(msg),
            Message::Crypto(CryptoMessage::BlockShare(share)) => {
                self.engine.handle_block_share(share)
            }
            Message::Sync(SyncMessage::RequestSync { sender, term }) => {
                self.syncer
                    .handle_request_sync(sender, term, self.engine.chain())
            }
            Message::Sync(SyncMessage::SyncPeer { sender, blocks }) => {
                self.syncer
                    .handle_sync_peer(sender, blocks, &mut self.engine)
            }
        }
    }

    /// Turn `StartSync` requests into sync traffic; everything else passes
    /// through to the runner.
    fn run_sync_requests(&mut self, actions: Vec<Action>) -> Vec<Action> {
        let mut pending: VecDeque<Action> = actions.into();
        let mut out = Vec::with_capacity(pending.len());

        while let Some(action) = pending.pop_front() {
            match action {
                Action::StartSync { observed_term } => {
                    if self.syncer.is_syncing() {
                        trace!(node = %self.node, observed_term, "Sync already in flight");
                        continue;
                    }
                    let local = self.engine.chain().highest_term();
                    debug!(node = %self.node, observed_term, local, "Starting sync");
                    pending.extend(self.syncer.request_sync(local));
                }
                other => out.push(other),
            }
        }
        out
    }
}

impl StateMachine for NodeStateMachine {
    #[instrument(skip(self, event), fields(
        node = %self.node,
        event = %event.type_name(),
        term = self.engine.term(),
        view = self.engine.view(),
    ))]
    fn handle(&mut self, event: Event) -> Vec<Action> {
        if !self.started {
            return match event {
                Event::Start => self.on_start(),
                _ => {
                    trace!("Not started, dropping event");
                    vec![]
                }
            };
        }

        if self.asleep {
            return match event {
                Event::WakeUp { token } => self.on_wake(token),
                _ => {
                    trace!("Asleep, dropping event");
                    vec![]
                }
            };
        }

        let actions = match event {
            Event::ProposalTimer { token } => self.engine.on_proposal_timer(token),
            Event::ProposalExpired { token } => self.engine.handle_proposal_expired(token),
            Event::SyncRetry { token } => self
                .syncer
                .on_retry_timer(token, self.engine.chain().highest_term()),
            Event::WakeUp { token } => {
                trace!(?token, "Wake timer while awake");
                vec![]
            }
            Event::MessageReceived { from, message } => self.on_message(from, message),
            Event::Start => self.on_start(),
            Event::Sleep { duration } => self.on_sleep(duration),
        };
        self.run_sync_requests(actions)
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    fn now(&self) -> Duration {
        self.now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oapbft_bft::{Progress, RandomPayload};
    use oapbft_test_helpers::fixtures;
    use oapbft_types::{Block, ConsensusMessage};

    fn params() -> ConsensusParams {
        ConsensusParams::new(4, 4, 1, 2).unwrap()
    }

    fn node(id: u64) -> NodeStateMachine {
        NodeStateMachine::new(
            NodeId(id),
            params(),
            BftConfig::default(),
            SyncConfig::default(),
            Box::new(RandomPayload::new(id, 16)),
            id,
        )
    }

    fn timer_token(actions: &[Action], wanted: TimerId) -> Option<TimerToken> {
        actions.iter().find_map(|action| match action {
            Action::SetTimer { id, token, .. } if *id == wanted => Some(*token),
            _ => None,
        })
    }

    fn far_future_prepare(term: u64) -> Event {
        Event::MessageReceived {
            from: NodeId(2),
            message: Message::Consensus(ConsensusMessage::Prepare(oapbft_types::Vote {
                term,
                view: 1,
                sender: NodeId(2),
                block_hash: oapbft_types::Hash::from_bytes(b"ahead"),
            })),
        }
    }

    #[test]
    fn test_events_before_start_are_dropped() {
        let mut sm = node(1);
        assert!(sm.handle(far_future_prepare(1)).is_empty());
        assert!(!sm.is_started());

        sm.handle(Event::Start);
        assert!(sm.is_started());
        assert_eq!(sm.engine().term(), 1);
        assert_eq!(sm.engine().progress(), Progress::Init);
    }

    #[test]
    fn test_start_twice_is_noop() {
        let mut sm = node(1);
        sm.handle(Event::Start);
        assert!(sm.handle(Event::Start).is_empty());
    }

    #[test]
    fn test_far_future_message_becomes_sync_request() {
        let mut sm = node(1);
        sm.handle(Event::Start);

        let actions = sm.handle(far_future_prepare(5));

        assert!(actions.iter().all(|a| !matches!(a, Action::StartSync { .. })));
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Unicast {
                message: Message::Sync(SyncMessage::RequestSync { term: 0, .. }),
                ..
            }
        )));
        assert!(timer_token(&actions, TimerId::SyncRetry).is_some());
        assert!(sm.syncer().is_syncing());
        assert!(sm.engine().is_syncing());
    }

    #[tracing_test::traced_test]
    #[test]
    fn test_sleep_drops_events_and_wake_syncs() {
        let mut sm = node(1);
        sm.handle(Event::Start);

        let actions = sm.handle(Event::Sleep {
            duration: Duration::from_secs(3),
        });
        let wake = timer_token(&actions, TimerId::Wake).unwrap();
        assert!(sm.is_asleep());
        assert!(sm.handle(far_future_prepare(5)).is_empty());

        let actions = sm.handle(Event::WakeUp { token: wake });

        assert!(!sm.is_asleep());
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Unicast {
                message: Message::Sync(SyncMessage::RequestSync { .. }),
                ..
            }
        )));
        assert!(logs_contain("Woke up, catching up"));
    }

    #[test]
    fn test_stale_wake_is_ignored() {
        let mut sm = node(1);
        sm.handle(Event::Start);
        let actions = sm.handle(Event::Sleep {
            duration: Duration::from_secs(1),
        });
        let wake = timer_token(&actions, TimerId::Wake).unwrap();

        assert!(sm
            .handle(Event::WakeUp {
                token: TimerToken(wake.0 + 1)
            })
            .is_empty());
        assert!(sm.is_asleep());
    }

    #[test]
    fn test_serves_sync_requests() {
        let mut sm = node(2);
        sm.handle(Event::Start);

        let actions = sm.handle(Event::MessageReceived {
            from: NodeId(1),
            message: Message::Sync(SyncMessage::RequestSync {
                sender: NodeId(1),
                term: 0,
            }),
        });

        assert!(matches!(
            actions.as_slice(),
            [Action::Unicast { to: NodeId(1), .. }]
        ));
    }

    #[test]
    fn test_full_catch_up_through_sync_reply() {
        let mut sm = node(1);
        sm.handle(Event::Start);
        sm.handle(far_future_prepare(5));
        let peer = sm.syncer().current_peer().unwrap();

        let blocks: Vec<Block> = fixtures::build_chain(&params(), 4);
        sm.handle(Event::MessageReceived {
            from: peer,
            message: Message::Sync(SyncMessage::SyncPeer {
                sender: peer,
                blocks,
            }),
        });

        assert_eq!(sm.chain().highest_term(), 4);
        assert_eq!(sm.engine().term(), 5);
        assert!(!sm.engine().is_syncing());
        assert_eq!(sm.sync_status().blocks_applied, 4);
    }
}
