//! View change: leader replacement within a term.
//!
//! ```text
//!  member (expiry fires)            leader(v+1)                  members
//!  ─────────────────────            ───────────                  ───────
//!  view += 1
//!  ViewChange{v+1, locked?} ──────► record by sender
//!                                   2f+1 valid? ── takeover
//!                                   block = highest locked
//!                                           or fresh
//!                                   NewView{VCs, PrePrepare} ──► validate
//!                                                                no lock → PrePrepare path
//!                                                                lock    → Prepared, Commit
//! ```
//!
//! The term never changes here; only the view advances. A locked candidate
//! (Prepared in some earlier view) travels inside the ViewChange together
//! with its prepare quorum, so a new leader cannot drop a block that may
//! already have committed somewhere.

use crate::engine::ConsensusEngine;
use crate::fault::Conduct;
use crate::state::Progress;
use crate::validation;
use oapbft_core::{Action, TimerId, TimerToken};
use oapbft_types::{
    highest_proposal, BlockProof, ConsensusMessage, EncryptedBlock, Message, NewView, PrePrepare,
    Proposal, View, ViewChange,
};
use tracing::{debug, info, trace};

impl ConsensusEngine {
    /// Proposal expiry for the current view.
    pub fn handle_proposal_expired(&mut self, token: TimerToken) -> Vec<Action> {
        if !self.timers.fire(TimerId::ProposalExpiry, token) {
            trace!(node = %self.node, ?token, "Stale proposal expiry");
            return vec![];
        }
        if self.syncing || self.state.progress == Progress::Committed || !self.is_member() {
            return vec![];
        }

        info!(
            node = %self.node,
            term = self.state.term,
            view = self.state.view,
            progress = ?self.state.progress,
            "Proposal expired"
        );
        let actions = self.enter_new_view();
        self.settle(actions)
    }

    /// Move to the next view and ask its leader to take over.
    pub fn enter_new_view(&mut self) -> Vec<Action> {
        let term = self.state.term;
        let target = self.state.view + 1;
        let proposal = self.state.locked.clone();

        self.state.advance_view(target);
        self.stats.view_changes += 1;

        let mut actions = vec![self.timers.arm(
            TimerId::ProposalExpiry,
            self.config.proposal_timeout_for(target),
        )];

        info!(
            node = %self.node,
            term,
            view = target,
            locked = proposal.is_some(),
            leader = ?self.leader(target),
            "Entering new view"
        );

        if self.fault.on_proposal_timeout(term, target) == Conduct::Withhold {
            return actions;
        }

        let view_change = ViewChange {
            term,
            view: target,
            sender: self.node,
            proposal,
        };
        match self.leader(target) {
            Some(leader) if leader == self.node => {
                actions.extend(self.handle_view_change(view_change));
            }
            Some(leader) => actions.push(Action::Unicast {
                to: leader,
                message: Message::Consensus(ConsensusMessage::ViewChange(view_change)),
            }),
            None => {}
        }
        actions
    }

    pub(crate) fn handle_view_change(&mut self, msg: ViewChange) -> Vec<Action> {
        if let Err(e) = validation::check_term(msg.term, self.state.term) {
            return self.defer_or_drop(ConsensusMessage::ViewChange(msg), e);
        }
        if msg.view < self.state.view || self.state.progress == Progress::Committed {
            trace!(node = %self.node, view = msg.view, "Ignoring outdated view change");
            return vec![];
        }
        if self.leader(msg.view) != Some(self.node) {
            trace!(node = %self.node, view = msg.view, "Not the leader for target view");
            return vec![];
        }
        if let Err(e) = validation::check_view_change(
            &msg,
            self.state.term,
            self.chain.last_block(),
            &self.committee,
            &self.params,
        ) {
            return self.reject("ViewChange", e);
        }

        if let Some(new_view) = self.state.sent_new_views.get(&msg.view) {
            if msg.sender == self.node {
                return vec![];
            }
            debug!(
                node = %self.node,
                view = msg.view,
                to = %msg.sender,
                "Retransmitting NewView to late sender"
            );
            return vec![Action::Unicast {
                to: msg.sender,
                message: Message::Consensus(ConsensusMessage::NewView(Box::new(
                    new_view.clone(),
                ))),
            }];
        }

        let view = msg.view;
        let sender = msg.sender;
        let received = self.state.view_changes.entry(view).or_default();
        if received.contains_key(&sender) {
            trace!(node = %self.node, %sender, "Duplicate view change");
            return vec![];
        }
        received.insert(sender, msg);
        let count = received.len();
        self.state.collecting_view_changes = true;

        debug!(node = %self.node, view, %sender, count, "Recorded view change");

        if !self.params.is_byz_maj(count) {
            return vec![];
        }
        self.enter_primary_change_takeover(view)
    }

    /// Lead `view` with the collected ViewChanges as evidence.
    pub(crate) fn enter_primary_change_takeover(&mut self, view: View) -> Vec<Action> {
        let term = self.state.term;
        let view_changes: Vec<ViewChange> = self
            .state
            .view_changes
            .get(&view)
            .map(|received| received.values().cloned().collect())
            .unwrap_or_default();
        self.state.collecting_view_changes = false;

        let mut actions = Vec::new();
        if self.state.view < view {
            self.state.advance_view(view);
            self.stats.view_changes += 1;
            actions.push(self.timers.arm(
                TimerId::ProposalExpiry,
                self.config.proposal_timeout_for(view),
            ));
        }

        if self.fault.on_propose(term, view) == Conduct::Withhold {
            info!(node = %self.node, term, view, fault = self.fault.name(), "Withholding takeover");
            return actions;
        }

        let block = match highest_proposal(&view_changes) {
            Some(proposal) => proposal.block.clone(),
            None => {
                let content = self.payload.next_payload(term, view);
                EncryptedBlock::new(
                    term,
                    view,
                    content,
                    self.chain.last_block(),
                    self.node,
                    self.committee.clone(),
                )
            }
        };
        self.stats.proposals += 1;

        info!(
            node = %self.node,
            term,
            view,
            hash = ?block.hash,
            reused = block.view < view,
            evidence = view_changes.len(),
            "Taking over as leader"
        );

        let new_view = NewView {
            term,
            view,
            sender: self.node,
            view_changes,
            pre_prepare: PrePrepare {
                term,
                view,
                sender: self.node,
                block,
            },
        };
        self.state.sent_new_views.insert(view, new_view.clone());

        actions.push(Action::Multicast {
            to: self.committee_peers(),
            message: Message::Consensus(ConsensusMessage::NewView(Box::new(new_view.clone()))),
        });
        actions.extend(self.handle_new_view(new_view));
        actions
    }

    pub(crate) fn handle_new_view(&mut self, msg: NewView) -> Vec<Action> {
        if let Err(e) = validation::check_term(msg.term, self.state.term) {
            return self.defer_or_drop(ConsensusMessage::NewView(Box::new(msg)), e);
        }
        if msg.view < self.state.view
            || self.state.new_views.contains_key(&msg.view)
            || self.state.progress == Progress::Committed
        {
            trace!(node = %self.node, view = msg.view, "Ignoring outdated NewView");
            return vec![];
        }
        if let Err(e) =
            validation::check_membership(&self.committee, &self.params, self.node, msg.term)
        {
            return self.reject("NewView", e);
        }
        if let Err(e) = validation::check_new_view(
            &msg,
            self.state.term,
            self.chain.last_block(),
            &self.committee,
            &self.params,
        ) {
            return self.reject("NewView", e);
        }

        let view = msg.view;
        if view > self.state.view {
            self.state.advance_view(view);
            self.stats.view_changes += 1;
        }
        let mut actions = vec![self.timers.arm(
            TimerId::ProposalExpiry,
            self.config.proposal_timeout_for(view),
        )];

        let proposal = msg.highest_proposal().cloned();
        let pre_prepare = msg.pre_prepare.clone();
        info!(
            node = %self.node,
            term = self.state.term,
            view,
            leader = %msg.sender,
            reused = proposal.is_some(),
            "Adopted new view"
        );
        self.state.new_views.insert(view, msg);

        match proposal {
            None => actions.extend(self.handle_pre_prepare(pre_prepare)),
            Some(proposal) => actions.extend(self.enter_prepared_from_proposal(proposal)),
        }
        actions
    }

    /// The NewView's evidence already proves a prepare quorum for this block.
    fn enter_prepared_from_proposal(&mut self, proposal: Proposal) -> Vec<Action> {
        let term = self.state.term;
        let hash = proposal.block.hash;

        let mut proof = BlockProof::new(term, hash, self.params.num_nodes);
        for vote in &proposal.prepares {
            self.state.prepares.insert(vote.clone());
            proof.prepares.set(vote.sender);
        }
        self.state.candidate = Some(proposal.block.clone());
        self.state.proof = Some(proof);
        self.state.locked = Some(proposal);

        debug!(
            node = %self.node,
            term,
            view = self.state.view,
            ?hash,
            "Prepared from view-change evidence"
        );
        self.send_commit(hash)
    }
}
