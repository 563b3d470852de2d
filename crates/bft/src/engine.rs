//! PBFT consensus engine.
//!
//! One engine per node, driven synchronously: every entry point takes an
//! input and returns the [`Action`]s to execute. Messages this node sends to
//! itself (the leader's PrePrepare, our own votes, our own Committed) are
//! handled in the same call through the regular handlers, never through
//! the network.
//!
//! # Term Flow
//!
//! 1. **Term entry** → sortition over the last decrypted block picks the
//!    committee; the view-1 leader arms its propose timer, members arm the
//!    proposal expiry
//! 2. **PrePrepare** → candidate set; the leader's PrePrepare counts as its
//!    Prepare; every other member multicasts a Prepare
//! 3. **Prepare quorum** → candidate locked; Commit multicast
//! 4. **Commit quorum** → Committed (block + proof) broadcast
//! 5. **Committed** → relayed once via fastcast, handed to decryption
//! 6. **Decrypted** → block appended, next term entered
//!
//! Proposal expiry runs the view change in [`crate::view_change`].

use crate::config::BftConfig;
use crate::fault::{Conduct, FaultBehavior, Honest};
use crate::payload::PayloadSource;
use crate::state::{PbftState, Progress};
use crate::validation::{self, ValidationError};
use oapbft_core::{Action, TimerId, TimerSet, TimerToken};
use oapbft_decryption::{Decrypted, DecryptionCoordinator, DecryptionOutput};
use oapbft_storage::{ChainError, ChainStore};
use oapbft_types::{
    sortition, Block, BlockProof, BlockShare, CommitteeMap, Committed, ConsensusMessage,
    ConsensusParams, DecryptedBlock, EncryptedBlock, Hash, Message, NodeId, PrePrepare, Proposal,
    Term, View, Vote,
};
use std::collections::BTreeSet;
use tracing::{debug, error, info, trace, warn};

/// Engine counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct EngineStats {
    /// Blocks this node proposed (fresh PrePrepare or takeover).
    pub proposals: u64,
    /// Local view advances.
    pub view_changes: u64,
    /// Terms closed through live consensus.
    pub terms_closed: u64,
    /// Blocks installed through sync.
    pub blocks_synced: u64,
    /// Messages that failed validation.
    pub rejected_messages: u64,
    /// Conflicting blocks produced for a closed term.
    pub forks_detected: u64,
}

/// Consensus engine for one node.
pub struct ConsensusEngine {
    // ═══════════════════════════════════════════════════════════════════════
    // Identity & Configuration
    // ═══════════════════════════════════════════════════════════════════════
    pub(crate) node: NodeId,
    pub(crate) params: ConsensusParams,
    pub(crate) config: BftConfig,

    // ═══════════════════════════════════════════════════════════════════════
    // Chain State
    // ═══════════════════════════════════════════════════════════════════════
    pub(crate) chain: ChainStore,

    /// Sortition result for the current term.
    pub(crate) committee: CommitteeMap,

    // ═══════════════════════════════════════════════════════════════════════
    // Term State
    // ═══════════════════════════════════════════════════════════════════════
    pub(crate) state: PbftState,
    pub(crate) decryptor: DecryptionCoordinator,
    pub(crate) timers: TimerSet,

    /// Passive while the syncer installs blocks: no timers, no proposals.
    pub(crate) syncing: bool,

    /// Set while re-dispatching buffered messages.
    draining: bool,

    /// State key at the last buffer scan.
    drained_at: (Term, View, Progress),

    /// Conflicting blocks already reported, by term.
    forks_seen: BTreeSet<(Term, Hash)>,

    // ═══════════════════════════════════════════════════════════════════════
    // Policies
    // ═══════════════════════════════════════════════════════════════════════
    pub(crate) fault: Box<dyn FaultBehavior>,
    pub(crate) payload: Box<dyn PayloadSource>,

    pub(crate) stats: EngineStats,
}

impl std::fmt::Debug for ConsensusEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusEngine")
            .field("node", &self.node)
            .field("term", &self.state.term)
            .field("view", &self.state.view)
            .field("progress", &self.state.progress)
            .field("chain_height", &self.chain.highest_term())
            .field("syncing", &self.syncing)
            .field("fault", &self.fault.name())
            .finish()
    }
}

impl ConsensusEngine {
    /// Create an engine holding only genesis. Call [`init_consensus`](Self::init_consensus)
    /// to enter term 1.
    pub fn new(
        node: NodeId,
        params: ConsensusParams,
        config: BftConfig,
        payload: Box<dyn PayloadSource>,
    ) -> Self {
        let chain = ChainStore::new(params.num_nodes);
        let committee = sortition(&chain.last_block().decrypted, params.num_nodes);
        let state = PbftState::new(0, Vec::new());
        let drained_at = state.key();

        Self {
            node,
            params,
            config,
            chain,
            committee,
            state,
            decryptor: DecryptionCoordinator::new(node, params.sharing_threshold),
            timers: TimerSet::new(),
            syncing: false,
            draining: false,
            drained_at,
            forks_seen: BTreeSet::new(),
            fault: Box::new(Honest),
            payload,
            stats: EngineStats::default(),
        }
    }

    pub fn with_fault(mut self, fault: Box<dyn FaultBehavior>) -> Self {
        self.fault = fault;
        self
    }

    pub fn set_fault(&mut self, fault: Box<dyn FaultBehavior>) {
        self.fault = fault;
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn term(&self) -> Term {
        self.state.term
    }

    pub fn view(&self) -> View {
        self.state.view
    }

    pub fn progress(&self) -> Progress {
        self.state.progress
    }

    pub fn committee(&self) -> &CommitteeMap {
        &self.committee
    }

    pub fn chain(&self) -> &ChainStore {
        &self.chain
    }

    pub fn candidate(&self) -> Option<&EncryptedBlock> {
        self.state.candidate.as_ref()
    }

    pub fn state(&self) -> &PbftState {
        &self.state
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing
    }

    pub fn is_member(&self) -> bool {
        self.committee.is_member(self.node, self.params.committee_size)
    }

    pub fn fault_name(&self) -> &'static str {
        self.fault.name()
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub(crate) fn leader(&self, view: View) -> Option<NodeId> {
        self.committee.leader(view, self.params.committee_size)
    }

    /// Committee members other than this node.
    pub(crate) fn committee_peers(&self) -> Vec<NodeId> {
        self.committee
            .committee(self.params.committee_size)
            .iter()
            .copied()
            .filter(|&n| n != self.node)
            .collect()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Enter the term after the chain tip.
    pub fn init_consensus(&mut self) -> Vec<Action> {
        let last = self.chain.last_block().decrypted.clone();
        info!(
            node = %self.node,
            num_nodes = self.params.num_nodes,
            committee_size = self.params.committee_size,
            num_byz = self.params.num_byz,
            "Initializing consensus"
        );
        let syncing = self.syncing;
        self.enter_new_term(&last, syncing)
    }

    /// Reset per-term state for the term after `last`.
    pub fn enter_new_term(&mut self, last: &DecryptedBlock, in_sync_mode: bool) -> Vec<Action> {
        let term = last.term + 1;
        let carried = self.state.take_buffered();
        self.committee = sortition(last, self.params.num_nodes);
        self.state = PbftState::new(term, carried);
        self.timers.cancel_all();

        info!(
            node = %self.node,
            term,
            leader = ?self.leader(1),
            member = self.is_member(),
            syncing = in_sync_mode,
            "Entering new term"
        );

        if in_sync_mode {
            return vec![];
        }

        let actions = self.arm_term_timers();
        self.settle(actions)
    }

    /// Stop driving consensus while the syncer catches up.
    pub fn begin_sync(&mut self) {
        if !self.syncing {
            debug!(node = %self.node, term = self.state.term, "Entering sync mode");
        }
        self.syncing = true;
        self.timers.cancel_all();
    }

    /// Sync finished: re-arm timers for the current term and replay buffers.
    pub fn resume_live(&mut self) -> Vec<Action> {
        self.syncing = false;
        info!(
            node = %self.node,
            term = self.state.term,
            height = self.chain.highest_term(),
            "Resuming live consensus"
        );
        let actions = self.arm_term_timers();
        self.drained_at = (0, 0, Progress::Init);
        self.settle(actions)
    }

    /// Timers for a member that has not yet committed in this term.
    fn arm_term_timers(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if !self.is_member() || self.state.progress == Progress::Committed {
            return actions;
        }

        actions.push(self.timers.arm(
            TimerId::ProposalExpiry,
            self.config.proposal_timeout_for(self.state.view),
        ));

        if self.state.view == 1
            && self.state.progress == Progress::Init
            && !self.state.proposed
            && self.leader(1) == Some(self.node)
        {
            actions.push(
                self.timers
                    .arm(TimerId::Proposal, self.config.block_interval),
            );
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Inputs
    // ═══════════════════════════════════════════════════════════════════════

    /// Handle a consensus message from the network.
    pub fn handle_message(&mut self, message: ConsensusMessage) -> Vec<Action> {
        let actions = self.dispatch(message);
        self.settle(actions)
    }

    /// Handle a decryption share from the network.
    pub fn handle_block_share(&mut self, share: BlockShare) -> Vec<Action> {
        let output = self.decryptor.handle_block_share(share);
        let actions = self.absorb_decryption(output);
        self.settle(actions)
    }

    /// The view-1 leader's propose tick.
    pub fn on_proposal_timer(&mut self, token: TimerToken) -> Vec<Action> {
        if !self.timers.fire(TimerId::Proposal, token) {
            trace!(node = %self.node, ?token, "Stale proposal timer");
            return vec![];
        }
        let actions = self.propose();
        self.settle(actions)
    }

    /// Install a finalized block received through sync.
    pub fn handle_new_block(
        &mut self,
        block: Block,
        in_sync_mode: bool,
    ) -> Result<Vec<Action>, ValidationError> {
        validation::check_new_block(&block, self.chain.last_block(), &self.params)?;

        let decrypted = block.decrypted.clone();
        self.chain.add_block(block)?;
        self.decryptor.reset(decrypted.term);
        self.stats.blocks_synced += 1;

        debug!(
            node = %self.node,
            term = decrypted.term,
            hash = ?decrypted.hash,
            "Installed synced block"
        );

        Ok(self.enter_new_term(&decrypted, in_sync_mode))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Dispatch & Buffering
    // ═══════════════════════════════════════════════════════════════════════

    pub(crate) fn dispatch(&mut self, message: ConsensusMessage) -> Vec<Action> {
        match message {
            ConsensusMessage::PrePrepare(msg) => self.handle_pre_prepare(msg),
            ConsensusMessage::Prepare(vote) => self.handle_prepare(vote),
            ConsensusMessage::Commit(vote) => self.handle_commit(vote),
            ConsensusMessage::Committed(msg) => self.handle_committed(msg),
            ConsensusMessage::ViewChange(msg) => self.handle_view_change(msg),
            ConsensusMessage::NewView(msg) => self.handle_new_view(*msg),
        }
    }

    /// Drop or buffer a message that failed a timing check.
    pub(crate) fn defer_or_drop(
        &mut self,
        message: ConsensusMessage,
        reason: ValidationError,
    ) -> Vec<Action> {
        if reason.is_future() {
            return self.buffer(message);
        }
        trace!(
            node = %self.node,
            msg = message.type_name(),
            %reason,
            "Dropping stale message"
        );
        vec![]
    }

    /// Log and count a rejected message.
    pub(crate) fn reject(&mut self, message: &'static str, reason: ValidationError) -> Vec<Action> {
        self.stats.rejected_messages += 1;
        warn!(
            node = %self.node,
            term = self.state.term,
            view = self.state.view,
            msg = message,
            %reason,
            "Rejected invalid message"
        );
        vec![]
    }

    fn buffer(&mut self, message: ConsensusMessage) -> Vec<Action> {
        let mut actions = Vec::new();
        let observed = message.term();

        if observed > self.state.term + 1 && !self.syncing {
            info!(
                node = %self.node,
                local = self.state.term,
                observed,
                "Behind the network, requesting sync"
            );
            self.begin_sync();
            actions.push(Action::StartSync {
                observed_term: observed,
            });
        }

        trace!(
            node = %self.node,
            msg = message.type_name(),
            term = observed,
            view = message.view(),
            "Buffering out-of-sync message"
        );
        if !self.state.buffer(message) {
            debug!(node = %self.node, "Buffer full, evicted oldest message");
        }
        actions
    }

    /// Re-dispatch buffered messages if state advanced since the last scan.
    pub(crate) fn settle(&mut self, mut actions: Vec<Action>) -> Vec<Action> {
        if self.draining || self.state.key() == self.drained_at {
            return actions;
        }

        self.draining = true;
        loop {
            let before = self.state.key();
            self.drained_at = before;
            let pending = self.state.take_buffered();
            if pending.is_empty() {
                break;
            }
            let count = pending.len();
            for message in pending {
                actions.extend(self.dispatch(message));
            }
            if self.state.key() == before && self.state.buffered.len() >= count {
                break;
            }
        }
        self.drained_at = self.state.key();
        self.draining = false;
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Normal Case
    // ═══════════════════════════════════════════════════════════════════════

    fn propose(&mut self) -> Vec<Action> {
        let term = self.state.term;
        let view = self.state.view;

        if self.leader(view) != Some(self.node) {
            error!(
                node = %self.node,
                term,
                view,
                leader = ?self.leader(view),
                "Asked to propose while not leader"
            );
            return vec![];
        }
        if self.syncing || self.state.proposed || self.state.progress != Progress::Init {
            debug!(node = %self.node, term, view, "Skipping proposal");
            return vec![];
        }

        self.state.proposed = true;
        if self.fault.on_propose(term, view) == Conduct::Withhold {
            info!(node = %self.node, term, view, fault = self.fault.name(), "Withholding proposal");
            return vec![];
        }

        let content = self.payload.next_payload(term, view);
        let block = EncryptedBlock::new(
            term,
            view,
            content,
            self.chain.last_block(),
            self.node,
            self.committee.clone(),
        );
        self.stats.proposals += 1;

        info!(node = %self.node, term, view, hash = ?block.hash, "Proposing block");

        let pre_prepare = PrePrepare {
            term,
            view,
            sender: self.node,
            block,
        };
        let mut actions = vec![Action::Multicast {
            to: self.committee_peers(),
            message: Message::Consensus(ConsensusMessage::PrePrepare(pre_prepare.clone())),
        }];
        actions.extend(self.handle_pre_prepare(pre_prepare));
        actions
    }

    pub(crate) fn handle_pre_prepare(&mut self, msg: PrePrepare) -> Vec<Action> {
        if let Err(e) =
            validation::check_in_sync(msg.term, msg.view, self.state.term, self.state.view)
        {
            return self.defer_or_drop(ConsensusMessage::PrePrepare(msg), e);
        }

        if self.state.progress != Progress::Init {
            if self.state.candidate.as_ref().map(|c| c.hash) != Some(msg.block.hash) {
                warn!(
                    node = %self.node,
                    term = msg.term,
                    view = msg.view,
                    sender = %msg.sender,
                    "Conflicting PrePrepare for a view that already has a candidate"
                );
            }
            return vec![];
        }

        if let Err(e) = self.validate_pre_prepare(&msg) {
            return self.reject("PrePrepare", e);
        }

        let term = msg.term;
        let view = msg.view;
        let hash = msg.block.hash;
        self.state.candidate = Some(msg.block);
        self.state.proof = Some(BlockProof::new(term, hash, self.params.num_nodes));
        self.state.progress = Progress::PrePrepared;

        debug!(node = %self.node, term, view, ?hash, leader = %msg.sender, "PrePrepared");

        // The leader's PrePrepare stands in for its Prepare.
        self.state.prepares.insert(Vote {
            term,
            view,
            sender: msg.sender,
            block_hash: hash,
        });

        if msg.sender == self.node {
            return self.try_enter_prepared();
        }

        let own = Vote {
            term,
            view,
            sender: self.node,
            block_hash: hash,
        };
        let mut actions = Vec::new();
        if self.fault.on_enter_pre_prepared(term, view) == Conduct::Proceed {
            actions.push(Action::Multicast {
                to: self.committee_peers(),
                message: Message::Consensus(ConsensusMessage::Prepare(own.clone())),
            });
        }
        actions.extend(self.handle_prepare(own));
        actions
    }

    fn validate_pre_prepare(&self, msg: &PrePrepare) -> Result<(), ValidationError> {
        validation::check_membership(&self.committee, &self.params, self.node, msg.term)?;
        validation::check_membership(&self.committee, &self.params, msg.sender, msg.term)?;
        validation::check_leader(&self.committee, &self.params, msg.sender, msg.view)?;
        if msg.view > 1 {
            let justified = self
                .state
                .new_views
                .get(&msg.view)
                .is_some_and(|nv| nv.pre_prepare.block.hash == msg.block.hash);
            if !justified {
                return Err(ValidationError::MissingNewView { view: msg.view });
            }
        }
        validation::check_encrypted_block(
            &msg.block,
            msg.term,
            msg.view,
            self.chain.last_block(),
            &self.committee,
            &self.params,
        )
    }

    /// Common screening for Prepare and Commit votes.
    fn admit_vote(&mut self, vote: &Vote) -> Result<(), ValidationError> {
        validation::check_membership(&self.committee, &self.params, self.node, vote.term)?;
        validation::check_membership(&self.committee, &self.params, vote.sender, vote.term)?;
        if let Some(candidate) = &self.state.candidate {
            if candidate.hash != vote.block_hash {
                return Err(ValidationError::ConflictingVote {
                    expected: candidate.hash,
                    got: vote.block_hash,
                });
            }
        }
        Ok(())
    }

    pub(crate) fn handle_prepare(&mut self, vote: Vote) -> Vec<Action> {
        if let Err(e) =
            validation::check_in_sync(vote.term, vote.view, self.state.term, self.state.view)
        {
            return self.defer_or_drop(ConsensusMessage::Prepare(vote), e);
        }
        if let Err(e) = self.admit_vote(&vote) {
            return self.reject("Prepare", e);
        }
        if !self.state.prepares.insert(vote) {
            trace!(node = %self.node, "Duplicate prepare");
            return vec![];
        }
        self.try_enter_prepared()
    }

    pub(crate) fn handle_commit(&mut self, vote: Vote) -> Vec<Action> {
        if let Err(e) =
            validation::check_in_sync(vote.term, vote.view, self.state.term, self.state.view)
        {
            return self.defer_or_drop(ConsensusMessage::Commit(vote), e);
        }
        if let Err(e) = self.admit_vote(&vote) {
            return self.reject("Commit", e);
        }
        if !self.state.commits.insert(vote) {
            trace!(node = %self.node, "Duplicate commit");
            return vec![];
        }
        self.try_enter_committed()
    }

    fn try_enter_prepared(&mut self) -> Vec<Action> {
        if self.state.progress != Progress::PrePrepared {
            return vec![];
        }
        let Some(candidate) = self.state.candidate.clone() else {
            return vec![];
        };
        let members = self.committee.committee(self.params.committee_size).to_vec();
        let count = self.state.prepares.count_for(&candidate.hash, &members);
        if !self.params.is_byz_maj(count) {
            return vec![];
        }

        let term = self.state.term;
        let view = self.state.view;
        let prepares = self.state.prepares.votes_for(&candidate.hash, &members);
        self.state.locked = Some(Proposal {
            view,
            block: candidate.clone(),
            prepares,
        });

        info!(node = %self.node, term, view, prepares = count, "Prepared");
        self.send_commit(candidate.hash)
    }

    /// Enter Prepared and vote to commit `hash`.
    pub(crate) fn send_commit(&mut self, hash: Hash) -> Vec<Action> {
        let term = self.state.term;
        let view = self.state.view;
        self.state.progress = Progress::Prepared;

        let commit = Vote {
            term,
            view,
            sender: self.node,
            block_hash: hash,
        };
        let mut actions = Vec::new();
        if self.fault.on_enter_prepared(term, view) == Conduct::Proceed {
            actions.push(Action::Multicast {
                to: self.committee_peers(),
                message: Message::Consensus(ConsensusMessage::Commit(commit.clone())),
            });
        }
        actions.extend(self.handle_commit(commit));
        actions
    }

    fn try_enter_committed(&mut self) -> Vec<Action> {
        if self.state.progress != Progress::Prepared {
            return vec![];
        }
        let Some(candidate) = self.state.candidate.clone() else {
            return vec![];
        };
        let members = self.committee.committee(self.params.committee_size).to_vec();
        let count = self.state.commits.count_for(&candidate.hash, &members);
        if !self.params.is_byz_maj(count) {
            return vec![];
        }

        let term = self.state.term;
        let view = self.state.view;
        let mut proof = self
            .state
            .proof
            .clone()
            .unwrap_or_else(|| BlockProof::new(term, candidate.hash, self.params.num_nodes));
        if proof.committed {
            return vec![];
        }
        self.state
            .prepares
            .fill_bitset(&candidate.hash, &members, &mut proof.prepares);
        self.state
            .commits
            .fill_bitset(&candidate.hash, &members, &mut proof.commits);
        proof.committed = true;
        self.state.proof = Some(proof.clone());
        self.state.progress = Progress::Committed;
        self.timers.cancel(TimerId::ProposalExpiry);

        info!(node = %self.node, term, view, hash = ?candidate.hash, commits = count, "Committed");

        let committed = Committed {
            term,
            view,
            sender: self.node,
            block: candidate,
            proof,
        };
        let mut actions = Vec::new();
        if self.fault.on_enter_committed(term, view) == Conduct::Proceed {
            actions.push(Action::Broadcast {
                message: Message::Consensus(ConsensusMessage::Committed(committed.clone())),
            });
        }
        actions.extend(self.handle_committed(committed));
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Finality
    // ═══════════════════════════════════════════════════════════════════════

    pub(crate) fn handle_committed(&mut self, msg: Committed) -> Vec<Action> {
        if msg.term <= self.chain.highest_term() {
            return self.check_closed_term(msg);
        }
        if let Err(e) = validation::check_term(msg.term, self.state.term) {
            return self.defer_or_drop(ConsensusMessage::Committed(msg), e);
        }
        if self.decryptor.is_registered(&msg.block.hash) {
            trace!(node = %self.node, term = msg.term, "Committed block already registered");
            return vec![];
        }
        if let Err(e) = self.validate_committed(&msg) {
            return self.reject("Committed", e);
        }
        // Relay guard: set before decryption, which is a no-op while
        // another block is in flight.
        self.decryptor.register(msg.term, msg.block.hash);

        let mut actions = Vec::new();
        if msg.sender != self.node {
            actions.push(Action::Fastcast {
                message: Message::Consensus(ConsensusMessage::Committed(msg.clone())),
            });
        }
        // Decided elsewhere: no view change for this term.
        self.timers.cancel(TimerId::ProposalExpiry);

        debug!(
            node = %self.node,
            term = msg.term,
            hash = ?msg.block.hash,
            from = %msg.sender,
            "Entering decrypt stage"
        );
        let output = self.decryptor.enter_decrypt_stage(msg.block, msg.proof);
        actions.extend(self.absorb_decryption(output));
        actions
    }

    /// A certificate for a term already on the chain. Copies of the stored
    /// block are ignored; a valid certificate for any other block is a fork.
    fn check_closed_term(&mut self, msg: Committed) -> Vec<Action> {
        let Some(stored) = self.chain.get(msg.term) else {
            return vec![];
        };
        if stored.encrypted.hash == msg.block.hash {
            trace!(node = %self.node, term = msg.term, "Committed for a closed term");
            return vec![];
        }
        let local = stored.decrypted.hash;
        let committee = stored.encrypted.committee_map.clone();

        if msg.block.term != msg.term {
            return self.reject(
                "Committed",
                ValidationError::TermMismatch {
                    expected: msg.term,
                    block: msg.block.term,
                },
            );
        }
        if msg.block.committee_map != committee {
            return self.reject("Committed", ValidationError::CommitteeMismatch);
        }
        if let Err(e) = validation::check_certificate(&msg.block, &msg.proof, &self.params) {
            return self.reject("Committed", e);
        }

        let incoming = DecryptedBlock::from_encrypted(&msg.block).hash;
        self.report_fork(msg.term, local, incoming)
    }

    /// Emit `ForkDetected` once per conflicting block.
    fn report_fork(&mut self, term: Term, local: Hash, incoming: Hash) -> Vec<Action> {
        if !self.forks_seen.insert((term, incoming)) {
            trace!(node = %self.node, term, ?incoming, "Fork already reported");
            return vec![];
        }
        self.stats.forks_detected += 1;
        error!(
            node = %self.node,
            term,
            ?local,
            ?incoming,
            "Fork detected: conflicting block for a closed term"
        );
        vec![Action::ForkDetected {
            term,
            local,
            incoming,
        }]
    }

    fn validate_committed(&self, msg: &Committed) -> Result<(), ValidationError> {
        if msg.block.term != msg.term {
            return Err(ValidationError::TermMismatch {
                expected: msg.term,
                block: msg.block.term,
            });
        }
        validation::check_certificate(&msg.block, &msg.proof, &self.params)?;
        if !msg.block.extends(self.chain.last_block()) {
            return Err(ValidationError::BrokenLink { term: msg.term });
        }
        if msg.block.committee_map != self.committee {
            return Err(ValidationError::CommitteeMismatch);
        }
        Ok(())
    }

    fn absorb_decryption(&mut self, output: DecryptionOutput) -> Vec<Action> {
        let mut actions = output.actions;
        if let Some(decrypted) = output.decrypted {
            actions.extend(self.handle_block_decrypted(decrypted));
        }
        actions
    }

    /// Append a decrypted block and move to the next term.
    pub fn handle_block_decrypted(&mut self, decrypted: Decrypted) -> Vec<Action> {
        let term = decrypted.decrypted.term;
        let block = Block {
            term,
            encrypted: decrypted.encrypted,
            decrypted: decrypted.decrypted.clone(),
            proof: decrypted.proof,
            shares: decrypted.shares,
        };

        match self.chain.add_block(block) {
            Ok(()) => {
                self.stats.terms_closed += 1;
                info!(
                    node = %self.node,
                    term,
                    hash = ?decrypted.decrypted.hash,
                    "Term closed"
                );
            }
            Err(ChainError::Duplicate { .. }) => {
                debug!(node = %self.node, term, "Decrypted block already stored");
            }
            Err(ChainError::Conflict {
                term,
                stored,
                incoming,
            }) => {
                return self.report_fork(term, stored, incoming);
            }
            Err(e) => {
                warn!(node = %self.node, term, error = %e, "Cannot append decrypted block");
                return vec![];
            }
        }

        if self.state.term <= term {
            let syncing = self.syncing;
            self.enter_new_term(&decrypted.decrypted, syncing)
        } else {
            vec![]
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fault::SilentLeader;
    use crate::payload::RandomPayload;
    use oapbft_test_helpers::{byzantine, fixtures};
    use oapbft_types::CryptoMessage;
    use std::collections::{BTreeMap, VecDeque};

    /// Engines wired together with instant, lossless delivery.
    pub(crate) struct Cluster {
        pub engines: Vec<ConsensusEngine>,
        queue: VecDeque<(NodeId, Message)>,
        /// Live timers per node.
        pub timers: BTreeMap<NodeId, BTreeMap<TimerId, TimerToken>>,
        pub forks: usize,
        pub sync_requests: usize,
    }

    impl Cluster {
        pub fn new(params: ConsensusParams) -> Self {
            let engines = NodeId::all(params.num_nodes)
                .map(|node| {
                    ConsensusEngine::new(
                        node,
                        params,
                        BftConfig::default(),
                        Box::new(RandomPayload::new(node.0, 8)),
                    )
                })
                .collect();
            Self {
                engines,
                queue: VecDeque::new(),
                timers: BTreeMap::new(),
                forks: 0,
                sync_requests: 0,
            }
        }

        pub fn engine(&self, node: NodeId) -> &ConsensusEngine {
            &self.engines[node.index()]
        }

        pub fn engine_mut(&mut self, node: NodeId) -> &mut ConsensusEngine {
            &mut self.engines[node.index()]
        }

        pub fn start(&mut self) {
            for i in 0..self.engines.len() {
                let node = NodeId::from_index(i);
                let actions = self.engines[i].init_consensus();
                self.apply(node, actions);
            }
            self.pump();
        }

        pub fn apply(&mut self, from: NodeId, actions: Vec<Action>) {
            let all: Vec<NodeId> = NodeId::all(self.engines.len()).collect();
            for action in actions {
                match action {
                    Action::Unicast { to, message } => self.queue.push_back((to, message)),
                    Action::Multicast { to, message } => {
                        for node in to {
                            self.queue.push_back((node, message.clone()));
                        }
                    }
                    Action::Broadcast { message } | Action::Fastcast { message } => {
                        for &node in all.iter().filter(|&&n| n != from) {
                            self.queue.push_back((node, message.clone()));
                        }
                    }
                    Action::SetTimer { id, token, .. } => {
                        self.timers.entry(from).or_default().insert(id, token);
                    }
                    Action::StartSync { .. } => self.sync_requests += 1,
                    Action::ForkDetected { .. } => self.forks += 1,
                }
            }
        }

        pub fn pump(&mut self) {
            while let Some((to, message)) = self.queue.pop_front() {
                let engine = &mut self.engines[to.index()];
                let actions = match message {
                    Message::Consensus(msg) => engine.handle_message(msg),
                    Message::Crypto(CryptoMessage::BlockShare(share)) => {
                        engine.handle_block_share(share)
                    }
                    Message::Sync(_) => vec![],
                };
                self.apply(to, actions);
            }
        }

        /// Fire the current arming of `id` on every node, snapshotting the
        /// tokens first so that re-armed timers are not fired twice.
        pub fn fire_all(&mut self, id: TimerId) {
            let tokens: Vec<(NodeId, TimerToken)> = self
                .timers
                .iter()
                .filter_map(|(node, timers)| timers.get(&id).map(|t| (*node, *t)))
                .collect();
            for (node, token) in tokens {
                self.deliver_timer(node, id, token);
            }
        }

        /// Fire the most recent arming of `id` on `node`.
        pub fn fire(&mut self, node: NodeId, id: TimerId) {
            let Some(token) = self.timers.get(&node).and_then(|t| t.get(&id)).copied() else {
                return;
            };
            self.deliver_timer(node, id, token);
        }

        fn deliver_timer(&mut self, node: NodeId, id: TimerId, token: TimerToken) {
            let engine = &mut self.engines[node.index()];
            let actions = match id {
                TimerId::Proposal => engine.on_proposal_timer(token),
                TimerId::ProposalExpiry => engine.handle_proposal_expired(token),
                _ => vec![],
            };
            self.apply(node, actions);
            self.pump();
        }

        pub fn leader(&self, view: View) -> NodeId {
            let engine = &self.engines[0];
            engine.committee().leader(view, engine.params().committee_size).unwrap()
        }

        pub fn heights(&self) -> Vec<Term> {
            self.engines.iter().map(|e| e.chain().highest_term()).collect()
        }
    }

    fn params() -> ConsensusParams {
        ConsensusParams::new(4, 4, 1, 2).unwrap()
    }

    #[test]
    fn test_leader_arms_proposal_timer() {
        let mut cluster = Cluster::new(params());
        cluster.start();
        let leader = cluster.leader(1);

        for engine in &cluster.engines {
            let armed = &cluster.timers[&engine.node()];
            assert!(armed.contains_key(&TimerId::ProposalExpiry));
            assert_eq!(armed.contains_key(&TimerId::Proposal), engine.node() == leader);
            assert_eq!(engine.term(), 1);
        }
    }

    #[test]
    fn test_happy_path_closes_term() {
        let mut cluster = Cluster::new(params());
        cluster.start();
        let leader = cluster.leader(1);

        cluster.fire(leader, TimerId::Proposal);

        assert_eq!(cluster.heights(), vec![1, 1, 1, 1]);
        let first = cluster.engines[0].chain().get(1).unwrap().decrypted.clone();
        for engine in &cluster.engines {
            assert_eq!(engine.chain().get(1).unwrap().decrypted, first);
            assert_eq!(engine.term(), 2);
            assert_eq!(engine.view(), 1);
        }
        assert_eq!(cluster.forks, 0);
    }

    #[test]
    fn test_consecutive_terms() {
        let mut cluster = Cluster::new(params());
        cluster.start();
        for _ in 0..3 {
            let leader = cluster.leader(1);
            cluster.fire(leader, TimerId::Proposal);
        }
        assert_eq!(cluster.heights(), vec![3, 3, 3, 3]);
    }

    #[test]
    fn test_non_leader_proposal_timer_aborts() {
        let mut cluster = Cluster::new(params());
        cluster.start();
        let leader = cluster.leader(1);
        let other = NodeId::all(4).find(|&n| n != leader).unwrap();

        let engine = cluster.engine_mut(other);
        let token = match engine.timers.arm(TimerId::Proposal, std::time::Duration::ZERO) {
            Action::SetTimer { token, .. } => token,
            _ => unreachable!(),
        };
        assert!(engine.on_proposal_timer(token).is_empty());
        assert_eq!(engine.progress(), Progress::Init);
    }

    #[test]
    fn test_silent_leader_triggers_view_change() {
        let mut cluster = Cluster::new(params());
        cluster.start();
        let silent = cluster.leader(1);
        let takeover = cluster.leader(2);
        cluster
            .engine_mut(silent)
            .set_fault(Box::new(SilentLeader::always()));

        cluster.fire(silent, TimerId::Proposal);
        assert_eq!(cluster.heights(), vec![0, 0, 0, 0]);

        cluster.fire_all(TimerId::ProposalExpiry);

        assert_eq!(cluster.heights(), vec![1, 1, 1, 1]);
        let block = cluster.engines[0].chain().get(1).unwrap();
        assert_eq!(block.encrypted.view, 2);
        assert_eq!(block.encrypted.creator, takeover);
        assert!(cluster.engine(takeover).stats().proposals >= 1);
    }

    #[test]
    fn test_far_future_message_requests_sync() {
        let mut cluster = Cluster::new(params());
        cluster.start();
        let node = NodeId(1);

        let vote = Vote {
            term: 5,
            view: 1,
            sender: NodeId(2),
            block_hash: Hash::ZERO,
        };
        let actions = cluster
            .engine_mut(node)
            .handle_message(ConsensusMessage::Prepare(vote.clone()));
        assert!(matches!(
            actions.as_slice(),
            [Action::StartSync { observed_term: 5 }]
        ));
        assert!(cluster.engine(node).is_syncing());

        // Already syncing: buffered without another request.
        let again = cluster
            .engine_mut(node)
            .handle_message(ConsensusMessage::Prepare(vote));
        assert!(again.is_empty());
        assert_eq!(cluster.engine(node).state().buffered.len(), 2);
    }

    #[test]
    fn test_prepare_for_other_block_rejected() {
        let mut cluster = Cluster::new(params());
        cluster.start();
        let leader = cluster.leader(1);
        let token = cluster.timers[&leader][&TimerId::Proposal];
        let actions = cluster.engine_mut(leader).on_proposal_timer(token);
        let pre_prepare = actions
            .iter()
            .find_map(|a| match a {
                Action::Multicast {
                    message: Message::Consensus(ConsensusMessage::PrePrepare(pp)),
                    ..
                } => Some(pp.clone()),
                _ => None,
            })
            .unwrap();

        let target = NodeId::all(4).find(|&n| n != leader).unwrap();
        let voter = NodeId::all(4)
            .find(|&n| n != leader && n != target)
            .unwrap();
        cluster
            .engine_mut(target)
            .handle_message(ConsensusMessage::PrePrepare(pre_prepare.clone()));
        assert_eq!(cluster.engine(target).progress(), Progress::PrePrepared);

        let before = cluster.engine(target).stats().rejected_messages;
        cluster
            .engine_mut(target)
            .handle_message(ConsensusMessage::Prepare(Vote {
                term: pre_prepare.term,
                view: 1,
                sender: voter,
                block_hash: Hash::from_bytes(b"other"),
            }));
        assert_eq!(cluster.engine(target).stats().rejected_messages, before + 1);
        assert!(!cluster.engine(target).state().prepares.contains(voter));
    }

    #[tracing_test::traced_test]
    #[test]
    fn test_certified_rival_for_closed_term_is_a_fork() {
        let params = params();
        let mut cluster = Cluster::new(params);
        cluster.start();
        let leader = cluster.leader(1);
        cluster.fire(leader, TimerId::Proposal);
        assert_eq!(cluster.heights(), vec![1, 1, 1, 1]);

        let node = NodeId(1);
        let stored = cluster.engine(node).chain().get(1).unwrap().clone();
        let rival = byzantine::conflicting_block(&Block::genesis(4), &params);
        let certificate = fixtures::committed(&rival.encrypted, &params);

        let actions = cluster
            .engine_mut(node)
            .handle_message(ConsensusMessage::Committed(certificate.clone()));

        match actions.as_slice() {
            [Action::ForkDetected {
                term,
                local,
                incoming,
            }] => {
                assert_eq!(*term, 1);
                assert_eq!(*local, stored.decrypted.hash);
                assert_eq!(*incoming, rival.decrypted.hash);
            }
            other => panic!("expected a fork report, got {other:?}"),
        }
        assert_eq!(cluster.engine(node).stats().forks_detected, 1);
        assert!(logs_contain("Fork detected"));

        // Reported once; the chain keeps its block.
        let again = cluster
            .engine_mut(node)
            .handle_message(ConsensusMessage::Committed(certificate));
        assert!(again.is_empty());
        assert_eq!(cluster.engine(node).stats().forks_detected, 1);
        assert_eq!(
            cluster.engine(node).chain().get(1).unwrap().encrypted.hash,
            stored.encrypted.hash
        );
    }

    #[test]
    fn test_closed_term_ignores_own_block_and_uncertified_rivals() {
        let params = params();
        let mut cluster = Cluster::new(params);
        cluster.start();
        let leader = cluster.leader(1);
        cluster.fire(leader, TimerId::Proposal);

        let node = NodeId(1);
        let stored = cluster.engine(node).chain().get(1).unwrap().clone();
        let genuine = fixtures::committed(&stored.encrypted, &params);
        assert!(cluster
            .engine_mut(node)
            .handle_message(ConsensusMessage::Committed(genuine))
            .is_empty());

        let genesis = Block::genesis(4);
        let weak = fixtures::proposal_block(&genesis, &params, 1, b"weak");
        let mut certificate = fixtures::committed(&weak, &params);
        certificate.proof = byzantine::insufficient_commits(&certificate.proof, &weak, &params);
        let before = cluster.engine(node).stats().rejected_messages;

        let actions = cluster
            .engine_mut(node)
            .handle_message(ConsensusMessage::Committed(certificate));

        assert!(actions.is_empty());
        assert_eq!(cluster.engine(node).stats().forks_detected, 0);
        assert_eq!(cluster.engine(node).stats().rejected_messages, before + 1);
    }

    #[test]
    fn test_committed_relayed_once_while_decrypting() {
        let params = params();
        let mut cluster = Cluster::new(params);
        cluster.start();
        let genesis = Block::genesis(4);
        let first = fixtures::proposal_block(&genesis, &params, 1, b"first");
        let rival = fixtures::proposal_block(&genesis, &params, 1, b"second");
        let node = NodeId::all(4).find(|&n| n != first.creator).unwrap();

        let relays = |actions: &[Action]| {
            actions
                .iter()
                .filter(|a| matches!(a, Action::Fastcast { .. }))
                .count()
        };

        let actions = cluster
            .engine_mut(node)
            .handle_message(ConsensusMessage::Committed(fixtures::committed(
                &first, &params,
            )));
        assert_eq!(relays(&actions), 1);
        assert!(cluster.engine(node).decryptor.is_decrypting());

        // A second block for the same term cannot start decrypting, but is
        // still relayed exactly once.
        let certificate = fixtures::committed(&rival, &params);
        let actions = cluster
            .engine_mut(node)
            .handle_message(ConsensusMessage::Committed(certificate.clone()));
        assert_eq!(relays(&actions), 1);
        let actions = cluster
            .engine_mut(node)
            .handle_message(ConsensusMessage::Committed(certificate));
        assert_eq!(relays(&actions), 0);
        assert_eq!(cluster.engine(node).decryptor.in_flight_term(), Some(1));
    }
}
