//! Fixture builders for valid protocol data.

use oapbft_types::{
    sortition, Block, BlockProof, BlockShare, CommitteeMap, Committed, ConsensusParams,
    DecryptedBlock, EncryptedBlock, Hash, NodeId, Proposal, Term, View, ViewChange, Vote,
};

/// Committee for the term after `last`.
pub fn committee_after(last: &Block, params: &ConsensusParams) -> CommitteeMap {
    sortition(&last.decrypted, params.num_nodes)
}

/// View-1 block for `term` on top of `last`, created by that view's leader.
pub fn proposal_block(
    last: &Block,
    params: &ConsensusParams,
    term: Term,
    content: &[u8],
) -> EncryptedBlock {
    let committee = committee_after(last, params);
    let leader = committee
        .leader(1, params.committee_size)
        .unwrap_or_default();
    EncryptedBlock::new(term, 1, content.to_vec(), last, leader, committee)
}

/// Votes for `hash` from the first `count` committee members.
pub fn votes(
    committee: &CommitteeMap,
    params: &ConsensusParams,
    term: Term,
    view: View,
    hash: Hash,
    count: usize,
) -> Vec<Vote> {
    committee
        .committee(params.committee_size)
        .iter()
        .take(count)
        .map(|&sender| Vote {
            term,
            view,
            sender,
            block_hash: hash,
        })
        .collect()
}

/// Proof with every committee member's prepare and commit set.
pub fn full_proof(block: &EncryptedBlock, params: &ConsensusParams) -> BlockProof {
    let mut proof = BlockProof::new(block.term, block.hash, params.num_nodes);
    for &member in block.committee_map.committee(params.committee_size) {
        proof.prepares.set(member);
        proof.commits.set(member);
    }
    proof.committed = true;
    proof
}

/// Committed certificate sent by the block's creator.
pub fn committed(block: &EncryptedBlock, params: &ConsensusParams) -> Committed {
    Committed {
        term: block.term,
        view: block.view,
        sender: block.creator,
        block: block.clone(),
        proof: full_proof(block, params),
    }
}

/// Exactly `k` shares, from nodes `1..=k`.
pub fn shares(block: &EncryptedBlock, params: &ConsensusParams) -> Vec<BlockShare> {
    NodeId::all(params.sharing_threshold)
        .map(|node| BlockShare {
            block_hash: block.hash,
            term: block.term,
            node,
        })
        .collect()
}

/// Fully finalized block for the term after `last`.
pub fn finalized_block(last: &Block, params: &ConsensusParams, content: &[u8]) -> Block {
    let term = last.term + 1;
    let encrypted = proposal_block(last, params, term, content);
    Block {
        term,
        decrypted: DecryptedBlock::from_encrypted(&encrypted),
        proof: full_proof(&encrypted, params),
        shares: shares(&encrypted, params),
        encrypted,
    }
}

/// Blocks for terms `1..=terms`, chained from genesis. Genesis is not included.
pub fn build_chain(params: &ConsensusParams, terms: Term) -> Vec<Block> {
    let mut last = Block::genesis(params.num_nodes);
    let mut blocks = Vec::new();
    for term in 1..=terms {
        let block = finalized_block(&last, params, format!("block-{term}").as_bytes());
        last = block.clone();
        blocks.push(block);
    }
    blocks
}

/// ViewChange to `view`, optionally carrying `locked` with a prepare quorum
/// cast in the block's own view.
pub fn view_change(
    committee: &CommitteeMap,
    params: &ConsensusParams,
    term: Term,
    view: View,
    sender: NodeId,
    locked: Option<&EncryptedBlock>,
) -> ViewChange {
    ViewChange {
        term,
        view,
        sender,
        proposal: locked.map(|block| Proposal {
            view: block.view,
            block: block.clone(),
            prepares: votes(
                committee,
                params,
                term,
                block.view,
                block.hash,
                params.quorum(),
            ),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_links_and_committees() {
        let params = ConsensusParams::new(5, 3, 1, 2).unwrap();
        let chain = build_chain(&params, 3);
        let genesis = Block::genesis(5);

        assert!(chain[0].encrypted.extends(&genesis));
        assert!(chain[2].encrypted.extends(&chain[1]));
        assert_eq!(
            chain[1].encrypted.committee_map,
            committee_after(&chain[0], &params)
        );
        assert_eq!(chain[0].shares.len(), 2);
    }
}
