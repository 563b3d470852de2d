//! Vote set for collecting Prepare or Commit votes.
//!
//! Votes are keyed by sender: the first vote from a node wins and later
//! ones are dropped as duplicates. Votes may arrive before the PrePrepare
//! they refer to, so they are stored regardless of hash and only counted
//! against a specific block hash when a quorum is checked.

use oapbft_types::{Hash, NodeBitset, NodeId, Vote};
use std::collections::BTreeMap;

/// Votes of one kind for one view.
#[derive(Debug, Clone, Default)]
pub struct VoteSet {
    votes: BTreeMap<NodeId, Vote>,
}

impl VoteSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a vote. Returns `false` if the sender already voted.
    pub fn insert(&mut self, vote: Vote) -> bool {
        if self.votes.contains_key(&vote.sender) {
            return false;
        }
        self.votes.insert(vote.sender, vote);
        true
    }

    pub fn get(&self, sender: NodeId) -> Option<&Vote> {
        self.votes.get(&sender)
    }

    pub fn contains(&self, sender: NodeId) -> bool {
        self.votes.contains_key(&sender)
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    /// Votes for `hash` from committee members.
    pub fn count_for(&self, hash: &Hash, committee: &[NodeId]) -> usize {
        self.matching(hash, committee).count()
    }

    /// Votes for `hash` from committee members, ordered by sender.
    pub fn votes_for(&self, hash: &Hash, committee: &[NodeId]) -> Vec<Vote> {
        self.matching(hash, committee).cloned().collect()
    }

    /// Mark every committee member that voted for `hash`.
    pub fn fill_bitset(&self, hash: &Hash, committee: &[NodeId], bits: &mut NodeBitset) {
        for vote in self.matching(hash, committee) {
            bits.set(vote.sender);
        }
    }

    fn matching<'a>(
        &'a self,
        hash: &'a Hash,
        committee: &'a [NodeId],
    ) -> impl Iterator<Item = &'a Vote> + 'a {
        self.votes
            .values()
            .filter(move |vote| vote.block_hash == *hash && committee.contains(&vote.sender))
    }
}
