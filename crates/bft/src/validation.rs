//! Message validity predicates.
//!
//! Every check returns `Result<(), ValidationError>`. Callers decide what a
//! failure means (drop, buffer or log); nothing here mutates state.

use oapbft_storage::ChainError;
use oapbft_types::{
    highest_proposal, is_byz_maj, sortition, Block, BlockProof, CommitteeMap, ConsensusParams,
    DecryptedBlock, EncryptedBlock, Hash, NewView, NodeId, Proposal, Term, View, ViewChange,
};
use std::collections::BTreeSet;
use thiserror::Error;

/// Reasons a message or block is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    // ═══════════════════════════════════════════════════════════════════════
    // Timing (stale is dropped, future is buffered)
    // ═══════════════════════════════════════════════════════════════════════
    #[error("stale term {term} (local {local})")]
    StaleTerm { term: Term, local: Term },

    #[error("future term {term} (local {local})")]
    FutureTerm { term: Term, local: Term },

    #[error("stale view {view} (local {local})")]
    StaleView { view: View, local: View },

    #[error("future view {view} (local {local})")]
    FutureView { view: View, local: View },

    // ═══════════════════════════════════════════════════════════════════════
    // Roles
    // ═══════════════════════════════════════════════════════════════════════
    #[error("{node} is not a committee member in term {term}")]
    NotMember { node: NodeId, term: Term },

    #[error("{sender} is not the leader for view {view} (expected {expected:?})")]
    NotLeader {
        sender: NodeId,
        view: View,
        expected: Option<NodeId>,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Blocks
    // ═══════════════════════════════════════════════════════════════════════
    #[error("block term {block} does not match expected term {expected}")]
    TermMismatch { expected: Term, block: Term },

    #[error("block hash does not match its content")]
    BadHash,

    #[error("block for term {term} does not extend the local chain tip")]
    BrokenLink { term: Term },

    #[error("claimed committee map differs from sortition")]
    CommitteeMismatch,

    #[error("block view {block_view} is ahead of view {view}")]
    BlockViewAhead { block_view: View, view: View },

    #[error("creator {creator} is not the leader for block view {view}")]
    WrongCreator { creator: NodeId, view: View },

    #[error("no NewView justifies view {view}")]
    MissingNewView { view: View },

    #[error("decrypted block does not match its encrypted block")]
    BadDecryption,

    #[error(transparent)]
    Chain(#[from] ChainError),

    // ═══════════════════════════════════════════════════════════════════════
    // Votes and certificates
    // ═══════════════════════════════════════════════════════════════════════
    #[error("vote for {got} conflicts with candidate {expected}")]
    ConflictingVote { expected: Hash, got: Hash },

    #[error("proof does not belong to the block")]
    ProofMismatch,

    #[error("{phase} quorum not reached: {count} of {required}")]
    NoQuorum {
        phase: &'static str,
        count: usize,
        required: usize,
    },

    #[error("proof is not marked committed")]
    NotCommitted,

    #[error("invalid prepare evidence: {reason}")]
    InvalidEvidence { reason: &'static str },

    #[error("invalid view change from {sender}: {reason}")]
    InvalidViewChange { sender: NodeId, reason: String },

    #[error("embedded pre-prepare does not match the view-change evidence")]
    ProposalMismatch,

    #[error("only {count} valid shares, need {required}")]
    InsufficientShares { count: usize, required: usize },
}

impl ValidationError {
    /// Whether the message should be kept for later rather than dropped.
    pub fn is_future(&self) -> bool {
        matches!(
            self,
            ValidationError::FutureTerm { .. } | ValidationError::FutureView { .. }
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Timing
// ═══════════════════════════════════════════════════════════════════════════

pub fn check_term(term: Term, local: Term) -> Result<(), ValidationError> {
    if term < local {
        Err(ValidationError::StaleTerm { term, local })
    } else if term > local {
        Err(ValidationError::FutureTerm { term, local })
    } else {
        Ok(())
    }
}

/// Term and view must both equal the local ones.
pub fn check_in_sync(
    term: Term,
    view: View,
    local_term: Term,
    local_view: View,
) -> Result<(), ValidationError> {
    check_term(term, local_term)?;
    if view < local_view {
        Err(ValidationError::StaleView {
            view,
            local: local_view,
        })
    } else if view > local_view {
        Err(ValidationError::FutureView {
            view,
            local: local_view,
        })
    } else {
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Roles
// ═══════════════════════════════════════════════════════════════════════════

pub fn check_membership(
    committee: &CommitteeMap,
    params: &ConsensusParams,
    node: NodeId,
    term: Term,
) -> Result<(), ValidationError> {
    if committee.is_member(node, params.committee_size) {
        Ok(())
    } else {
        Err(ValidationError::NotMember { node, term })
    }
}

pub fn check_leader(
    committee: &CommitteeMap,
    params: &ConsensusParams,
    sender: NodeId,
    view: View,
) -> Result<(), ValidationError> {
    let expected = committee.leader(view, params.committee_size);
    if expected == Some(sender) {
        Ok(())
    } else {
        Err(ValidationError::NotLeader {
            sender,
            view,
            expected,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Blocks
// ═══════════════════════════════════════════════════════════════════════════

/// A block proposed in `view` of `term`, on top of `last_block`.
pub fn check_encrypted_block(
    block: &EncryptedBlock,
    term: Term,
    view: View,
    last_block: &Block,
    committee: &CommitteeMap,
    params: &ConsensusParams,
) -> Result<(), ValidationError> {
    if block.term != term {
        return Err(ValidationError::TermMismatch {
            expected: term,
            block: block.term,
        });
    }
    if !block.has_valid_hash() {
        return Err(ValidationError::BadHash);
    }
    if !block.extends(last_block) {
        return Err(ValidationError::BrokenLink { term });
    }
    if block.committee_map != *committee {
        return Err(ValidationError::CommitteeMismatch);
    }
    if block.view > view {
        return Err(ValidationError::BlockViewAhead {
            block_view: block.view,
            view,
        });
    }
    if committee.leader(block.view, params.committee_size) != Some(block.creator) {
        return Err(ValidationError::WrongCreator {
            creator: block.creator,
            view: block.view,
        });
    }
    Ok(())
}

/// Fast-path commit certificate check, using only the block's own
/// committee map so that a node with no state for the term can accept it.
pub fn check_certificate(
    block: &EncryptedBlock,
    proof: &BlockProof,
    params: &ConsensusParams,
) -> Result<(), ValidationError> {
    if block.hash != proof.hash || block.term != proof.term {
        return Err(ValidationError::ProofMismatch);
    }
    if !block.has_valid_hash() {
        return Err(ValidationError::BadHash);
    }
    let committee = block.committee_map.committee(params.committee_size);
    if !committee.contains(&block.creator) {
        return Err(ValidationError::NotMember {
            node: block.creator,
            term: block.term,
        });
    }
    check_bitset_quorum("prepare", proof.prepares.count_among(committee), params)?;
    check_bitset_quorum("commit", proof.commits.count_among(committee), params)?;
    if !proof.committed {
        return Err(ValidationError::NotCommitted);
    }
    Ok(())
}

fn check_bitset_quorum(
    phase: &'static str,
    count: usize,
    params: &ConsensusParams,
) -> Result<(), ValidationError> {
    if is_byz_maj(count, params.num_byz) {
        Ok(())
    } else {
        Err(ValidationError::NoQuorum {
            phase,
            count,
            required: params.quorum(),
        })
    }
}

/// A finalized block received through sync, applied on top of `last_block`.
pub fn check_new_block(
    block: &Block,
    last_block: &Block,
    params: &ConsensusParams,
) -> Result<(), ValidationError> {
    let expected = last_block.term + 1;
    if block.term != expected
        || block.encrypted.term != expected
        || block.decrypted.term != expected
    {
        return Err(ValidationError::TermMismatch {
            expected,
            block: block.term,
        });
    }
    if !block.encrypted.extends(last_block) {
        return Err(ValidationError::BrokenLink { term: block.term });
    }
    if block.encrypted.committee_map != sortition(&last_block.decrypted, params.num_nodes) {
        return Err(ValidationError::CommitteeMismatch);
    }
    check_certificate(&block.encrypted, &block.proof, params)?;
    if block.decrypted != DecryptedBlock::from_encrypted(&block.encrypted) {
        return Err(ValidationError::BadDecryption);
    }

    let holders: BTreeSet<NodeId> = block
        .shares
        .iter()
        .filter(|share| {
            share.block_hash == block.encrypted.hash
                && share.term == block.term
                && share.node.in_network(params.num_nodes)
        })
        .map(|share| share.node)
        .collect();
    if holders.len() < params.sharing_threshold {
        return Err(ValidationError::InsufficientShares {
            count: holders.len(),
            required: params.sharing_threshold,
        });
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// View change
// ═══════════════════════════════════════════════════════════════════════════

/// Locked proposal carried in a ViewChange: a quorum of prepares for its
/// block, all cast in `proposal.view`.
pub fn check_proposal(
    proposal: &Proposal,
    term: Term,
    last_block: &Block,
    committee: &CommitteeMap,
    params: &ConsensusParams,
) -> Result<(), ValidationError> {
    check_encrypted_block(
        &proposal.block,
        term,
        proposal.view,
        last_block,
        committee,
        params,
    )?;

    let members = committee.committee(params.committee_size);
    let mut voters = BTreeSet::new();
    for vote in &proposal.prepares {
        if vote.term != term || vote.view != proposal.view {
            return Err(ValidationError::InvalidEvidence {
                reason: "vote from another round",
            });
        }
        if vote.block_hash != proposal.block.hash {
            return Err(ValidationError::InvalidEvidence {
                reason: "vote for another block",
            });
        }
        if !members.contains(&vote.sender) {
            return Err(ValidationError::InvalidEvidence {
                reason: "vote from a non-member",
            });
        }
        voters.insert(vote.sender);
    }
    check_bitset_quorum("prepare", voters.len(), params)
}

pub fn check_view_change(
    view_change: &ViewChange,
    term: Term,
    last_block: &Block,
    committee: &CommitteeMap,
    params: &ConsensusParams,
) -> Result<(), ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidViewChange {
        sender: view_change.sender,
        reason,
    };

    if view_change.term != term {
        return Err(invalid(format!("term {} in term {term}", view_change.term)));
    }
    if view_change.view < 2 {
        return Err(invalid(format!("target view {}", view_change.view)));
    }
    check_membership(committee, params, view_change.sender, term)?;
    if let Some(proposal) = &view_change.proposal {
        if proposal.view >= view_change.view {
            return Err(invalid(format!(
                "proposal view {} not below target {}",
                proposal.view, view_change.view
            )));
        }
        check_proposal(proposal, term, last_block, committee, params)
            .map_err(|e| invalid(e.to_string()))?;
    }
    Ok(())
}

/// A NewView must carry a quorum of valid ViewChanges for its view, from
/// distinct members, and a PrePrepare derived from them.
pub fn check_new_view(
    new_view: &NewView,
    term: Term,
    last_block: &Block,
    committee: &CommitteeMap,
    params: &ConsensusParams,
) -> Result<(), ValidationError> {
    check_leader(committee, params, new_view.sender, new_view.view)?;

    let mut senders = BTreeSet::new();
    for view_change in &new_view.view_changes {
        if view_change.view != new_view.view {
            return Err(ValidationError::InvalidViewChange {
                sender: view_change.sender,
                reason: format!("view {} in NewView {}", view_change.view, new_view.view),
            });
        }
        check_view_change(view_change, term, last_block, committee, params)?;
        senders.insert(view_change.sender);
    }
    check_bitset_quorum("view-change", senders.len(), params)?;

    let pre_prepare = &new_view.pre_prepare;
    if pre_prepare.term != term
        || pre_prepare.view != new_view.view
        || pre_prepare.sender != new_view.sender
    {
        return Err(ValidationError::ProposalMismatch);
    }

    match highest_proposal(&new_view.view_changes) {
        Some(proposal) if proposal.block != pre_prepare.block => {
            return Err(ValidationError::ProposalMismatch)
        }
        None if pre_prepare.block.view != new_view.view
            || pre_prepare.block.creator != new_view.sender =>
        {
            return Err(ValidationError::ProposalMismatch)
        }
        _ => {}
    }

    check_encrypted_block(
        &pre_prepare.block,
        term,
        new_view.view,
        last_block,
        committee,
        params,
    )
}
