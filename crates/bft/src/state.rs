//! Per-term PBFT state.

use crate::vote_set::VoteSet;
use oapbft_types::{
    BlockProof, ConsensusMessage, EncryptedBlock, NewView, NodeId, Proposal, Term, View,
    ViewChange,
};
use std::collections::{BTreeMap, VecDeque};

/// Buffered out-of-sync messages kept per term. Oldest are dropped first.
const MAX_BUFFERED: usize = 4096;

/// Phase within the current view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Progress {
    Init,
    /// Candidate block accepted.
    PrePrepared,
    /// Prepare quorum reached; candidate is locked.
    Prepared,
    /// Commit quorum reached. Entered at most once per term.
    Committed,
}

/// State owned by the consensus engine for one term.
///
/// Created on term entry, discarded on the next.
#[derive(Debug)]
pub struct PbftState {
    pub term: Term,
    pub view: View,
    pub progress: Progress,

    // ═══════════════════════════════════════════════════════════════════════
    // Current view
    // ═══════════════════════════════════════════════════════════════════════
    pub candidate: Option<EncryptedBlock>,
    pub proof: Option<BlockProof>,
    pub prepares: VoteSet,
    pub commits: VoteSet,

    /// Whether the view-1 proposal was made (or withheld) by this node.
    pub proposed: bool,

    // ═══════════════════════════════════════════════════════════════════════
    // Across views
    // ═══════════════════════════════════════════════════════════════════════
    /// Candidate and prepare evidence from the last view this node prepared in.
    /// Survives view changes.
    pub locked: Option<Proposal>,

    /// ViewChanges received as the leader of a target view, by view then sender.
    pub view_changes: BTreeMap<View, BTreeMap<NodeId, ViewChange>>,

    /// Set while this node, as a target view's leader, is gathering ViewChanges.
    pub collecting_view_changes: bool,

    /// Accepted NewView per view.
    pub new_views: BTreeMap<View, NewView>,

    /// NewViews issued by this node, for retransmission to late ViewChange senders.
    pub sent_new_views: BTreeMap<View, NewView>,

    /// Messages from a future term or view.
    pub buffered: VecDeque<ConsensusMessage>,
}

impl PbftState {
    /// Fresh state for `term`, keeping buffered messages that are not yet stale.
    pub fn new(term: Term, carried: impl IntoIterator<Item = ConsensusMessage>) -> Self {
        Self {
            term,
            view: 1,
            progress: Progress::Init,
            candidate: None,
            proof: None,
            prepares: VoteSet::new(),
            commits: VoteSet::new(),
            proposed: false,
            locked: None,
            view_changes: BTreeMap::new(),
            collecting_view_changes: false,
            new_views: BTreeMap::new(),
            sent_new_views: BTreeMap::new(),
            buffered: carried.into_iter().filter(|m| m.term() >= term).collect(),
        }
    }

    /// Snapshot compared before and after handling to decide whether the
    /// buffer is worth re-scanning.
    pub fn key(&self) -> (Term, View, Progress) {
        (self.term, self.view, self.progress)
    }

    /// Move to a later view. Per-view votes and the candidate are cleared;
    /// the locked proposal is kept.
    pub fn advance_view(&mut self, view: View) {
        debug_assert!(view > self.view);
        self.view = view;
        self.progress = Progress::Init;
        self.candidate = None;
        self.proof = None;
        self.prepares = VoteSet::new();
        self.commits = VoteSet::new();
        self.view_changes.retain(|v, _| *v >= view);

        let term = self.term;
        self.buffered.retain(|m| match m {
            ConsensusMessage::Committed(_) => true,
            other => other.term() > term || other.view() >= view,
        });
    }

    /// Buffer a message. Returns `false` if the oldest entry had to be evicted.
    pub fn buffer(&mut self, message: ConsensusMessage) -> bool {
        let evicted = if self.buffered.len() >= MAX_BUFFERED {
            self.buffered.pop_front();
            true
        } else {
            false
        };
        self.buffered.push_back(message);
        !evicted
    }

    pub fn take_buffered(&mut self) -> Vec<ConsensusMessage> {
        self.buffered.drain(..).collect()
    }
}
