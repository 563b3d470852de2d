//! Catch-up protocol for nodes that fell behind.
//!
//! A lagging node asks one of a fixed, randomly chosen set of `f + 1` peers
//! for every finalized block after its own tip. At least one of those peers
//! is honest, so rotating through them on timeout or on an invalid reply
//! always reaches a correct chain eventually.
//!
//! ```text
//! StartSync ──► RequestSync(term) ──► peer
//!                                      │
//!   handle_new_block(.., true) ◄── SyncPeer(blocks)
//!         │
//!         └──► resume_live()
//! ```

use oapbft_bft::ConsensusEngine;
use oapbft_core::{Action, TimerId, TimerSet, TimerToken};
use oapbft_storage::ChainStore;
use oapbft_types::{Block, ConsensusParams, Message, NodeId, SyncMessage, Term};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Configuration for the syncer.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How long to wait for a `SyncPeer` reply before asking the next peer.
    pub retry_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(1),
        }
    }
}

impl SyncConfig {
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }
}

/// Current sync state for external APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStateKind {
    /// Not syncing, consensus drives the node.
    Idle,
    /// Waiting for a peer's chain.
    Syncing,
}

impl SyncStateKind {
    /// Returns a string representation for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStateKind::Idle => "idle",
            SyncStateKind::Syncing => "syncing",
        }
    }
}

/// Sync status snapshot for external APIs.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub state: SyncStateKind,
    /// Highest locally closed term.
    pub current_term: Term,
    /// Peer the outstanding request went to.
    pub peer: Option<NodeId>,
    pub requests_sent: u64,
    pub blocks_applied: u64,
}

/// Peer-driven block sync.
pub struct Syncer {
    node: NodeId,
    config: SyncConfig,
    peers: Vec<NodeId>,
    next_peer: usize,
    syncing: bool,
    timers: TimerSet,
    requests_sent: u64,
    blocks_applied: u64,
}

impl std::fmt::Debug for Syncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Syncer")
            .field("node", &self.node)
            .field("peers", &self.peers)
            .field("syncing", &self.syncing)
            .field("requests_sent", &self.requests_sent)
            .finish()
    }
}

impl Syncer {
    /// Choose the sync peers once, from `seed`.
    pub fn new(node: NodeId, params: &ConsensusParams, config: SyncConfig, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let candidates: Vec<NodeId> = NodeId::all(params.num_nodes)
            .filter(|&peer| peer != node)
            .collect();
        let mut peers: Vec<NodeId> = candidates
            .choose_multiple(&mut rng, params.sync_peer_count())
            .copied()
            .collect();
        peers.sort();

        debug!(node = %node, ?peers, "Selected sync peers");

        Self {
            node,
            config,
            peers,
            next_peer: 0,
            syncing: false,
            timers: TimerSet::new(),
            requests_sent: 0,
            blocks_applied: 0,
        }
    }

    pub fn peers(&self) -> &[NodeId] {
        &self.peers
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing
    }

    /// The peer the next request goes to.
    pub fn current_peer(&self) -> Option<NodeId> {
        self.peers.get(self.next_peer).copied()
    }

    pub fn status(&self, current_term: Term) -> SyncStatus {
        SyncStatus {
            state: if self.syncing {
                SyncStateKind::Syncing
            } else {
                SyncStateKind::Idle
            },
            current_term,
            peer: self.syncing.then(|| self.current_peer()).flatten(),
            requests_sent: self.requests_sent,
            blocks_applied: self.blocks_applied,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Requesting side
    // ═══════════════════════════════════════════════════════════════════════

    /// Ask the current peer for every block after `local_term`.
    pub fn request_sync(&mut self, local_term: Term) -> Vec<Action> {
        let Some(peer) = self.current_peer() else {
            warn!(node = %self.node, "No sync peers configured");
            return vec![];
        };

        self.syncing = true;
        self.requests_sent += 1;
        info!(node = %self.node, %peer, term = local_term, "Requesting sync");

        vec![
            Action::Unicast {
                to: peer,
                message: Message::Sync(SyncMessage::RequestSync {
                    sender: self.node,
                    term: local_term,
                }),
            },
            self.timers
                .arm(TimerId::SyncRetry, self.config.retry_interval),
        ]
    }

    /// The outstanding request timed out: move to the next peer.
    pub fn on_retry_timer(&mut self, token: TimerToken, local_term: Term) -> Vec<Action> {
        if !self.timers.fire(TimerId::SyncRetry, token) || !self.syncing {
            trace!(node = %self.node, ?token, "Stale sync retry");
            return vec![];
        }
        debug!(
            node = %self.node,
            peer = ?self.current_peer(),
            "Sync peer did not answer, rotating"
        );
        self.rotate_peer();
        self.request_sync(local_term)
    }

    /// Install the blocks of a `SyncPeer` reply, then hand control back to
    /// consensus.
    pub fn handle_sync_peer(
        &mut self,
        sender: NodeId,
        mut blocks: Vec<Block>,
        engine: &mut ConsensusEngine,
    ) -> Vec<Action> {
        if !self.syncing {
            trace!(node = %self.node, %sender, "Unsolicited sync reply");
            return vec![];
        }

        blocks.sort_by_key(|block| block.term);
        let mut actions = Vec::new();

        for block in blocks {
            let term = block.term;
            if term <= engine.chain().highest_term() || engine.chain().contains(term) {
                trace!(node = %self.node, term, "Already have synced block");
                continue;
            }

            match engine.handle_new_block(block, true) {
                Ok(installed) => {
                    self.blocks_applied += 1;
                    actions.extend(installed);
                }
                Err(error) => {
                    warn!(
                        node = %self.node,
                        peer = %sender,
                        term,
                        %error,
                        "Invalid block in sync reply"
                    );
                    self.rotate_peer();
                    actions.extend(self.request_sync(engine.chain().highest_term()));
                    return actions;
                }
            }
        }

        self.syncing = false;
        self.timers.cancel(TimerId::SyncRetry);
        info!(
            node = %self.node,
            peer = %sender,
            height = engine.chain().highest_term(),
            "Sync complete"
        );
        actions.extend(engine.resume_live());
        actions
    }

    fn rotate_peer(&mut self) {
        if !self.peers.is_empty() {
            self.next_peer = (self.next_peer + 1) % self.peers.len();
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Serving side
    // ═══════════════════════════════════════════════════════════════════════

    /// Reply with every closed block after `term`. The reply may be empty.
    pub fn handle_request_sync(
        &self,
        requester: NodeId,
        term: Term,
        chain: &ChainStore,
    ) -> Vec<Action> {
        let blocks = chain.blocks_after(term);
        debug!(
            node = %self.node,
            %requester,
            from_term = term,
            count = blocks.len(),
            "Serving sync request"
        );
        vec![Action::Unicast {
            to: requester,
            message: Message::Sync(SyncMessage::SyncPeer {
                sender: self.node,
                blocks,
            }),
        }]
    }
}
