//! Byzantine/negative test helpers.
//!
//! Each function takes valid data and introduces exactly one defect, so a
//! test can assert on the specific rejection.

use crate::fixtures;
use oapbft_types::{
    Block, BlockProof, CommitteeMap, ConsensusParams, EncryptedBlock, Hash, NodeId, Term, View,
    ViewChange,
};

/// Content changed after hashing.
pub fn tampered_content(block: &EncryptedBlock) -> EncryptedBlock {
    let mut forged = block.clone();
    forged.content.push(0xff);
    forged
}

/// Chain pointers to a block nobody has.
pub fn unlinked(block: &EncryptedBlock) -> EncryptedBlock {
    let mut forged = block.clone();
    forged.last_encrypted_hash = Hash::from_bytes(b"elsewhere");
    forged
}

/// Committee map in reverse order.
pub fn wrong_committee(block: &EncryptedBlock) -> EncryptedBlock {
    let mut forged = block.clone();
    let reversed: Vec<NodeId> = block.committee_map.order().iter().rev().copied().collect();
    forged.committee_map = CommitteeMap::from_order(reversed, block.committee_map.seed());
    forged
}

/// Claimed creator replaced.
pub fn with_creator(block: &EncryptedBlock, creator: NodeId) -> EncryptedBlock {
    let mut forged = block.clone();
    forged.creator = creator;
    forged
}

/// Proof whose commits fall one short of a byzantine majority.
pub fn insufficient_commits(
    proof: &BlockProof,
    block: &EncryptedBlock,
    params: &ConsensusParams,
) -> BlockProof {
    let mut forged = proof.clone();
    forged.commits = oapbft_types::NodeBitset::new(params.num_nodes);
    for &member in block
        .committee_map
        .committee(params.committee_size)
        .iter()
        .take(params.quorum() - 1)
    {
        forged.commits.set(member);
    }
    forged
}

/// ViewChange whose locked proposal carries one prepare too few.
pub fn forged_view_change(
    committee: &CommitteeMap,
    params: &ConsensusParams,
    term: Term,
    view: View,
    sender: NodeId,
    block: &EncryptedBlock,
) -> ViewChange {
    let mut forged = fixtures::view_change(committee, params, term, view, sender, Some(block));
    if let Some(proposal) = forged.proposal.as_mut() {
        proposal.prepares.pop();
    }
    forged
}

/// A second, fully certified block for the same term as the one after `last`.
pub fn conflicting_block(last: &Block, params: &ConsensusParams) -> Block {
    fixtures::finalized_block(last, params, b"rival")
}
