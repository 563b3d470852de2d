//! Append-only chain of finalized blocks.

use oapbft_types::{Block, Hash, Term};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::trace;

/// Rejected appends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    /// The exact block is already stored.
    #[error("block for term {term} already stored")]
    Duplicate { term: Term },

    /// A different block is already stored for this term.
    #[error("conflicting block for term {term}: stored {stored}, incoming {incoming}")]
    Conflict {
        term: Term,
        stored: Hash,
        incoming: Hash,
    },

    /// The block does not follow the current tip.
    #[error("expected block for term {expected}, got term {got}")]
    NonContiguous { expected: Term, got: Term },

    /// The block's pointers do not reference the current tip.
    #[error("block for term {term} does not extend the chain tip")]
    BrokenLink { term: Term },
}

/// Per-node chain store: term → finalized block, seeded with genesis.
///
/// Exclusively owned by one node. Blocks are immutable once appended.
#[derive(Debug, Clone)]
pub struct ChainStore {
    /// Always holds genesis at term 0.
    blocks: BTreeMap<Term, Block>,
    genesis: Block,
}

impl ChainStore {
    /// Create a store holding only the genesis block.
    pub fn new(num_nodes: usize) -> Self {
        let genesis = Block::genesis(num_nodes);
        let mut blocks = BTreeMap::new();
        blocks.insert(0, genesis.clone());
        Self { blocks, genesis }
    }

    /// Block at the highest closed term.
    pub fn last_block(&self) -> &Block {
        self.blocks.values().next_back().unwrap_or(&self.genesis)
    }

    pub fn genesis(&self) -> &Block {
        &self.genesis
    }

    /// Highest closed term (0 = only genesis).
    pub fn highest_term(&self) -> Term {
        self.blocks.keys().next_back().copied().unwrap_or(0)
    }

    pub fn get(&self, term: Term) -> Option<&Block> {
        self.blocks.get(&term)
    }

    pub fn contains(&self, term: Term) -> bool {
        self.blocks.contains_key(&term)
    }

    /// Number of stored blocks, genesis included.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Every closed block, by term.
    pub fn closed_blocks(&self) -> &BTreeMap<Term, Block> {
        &self.blocks
    }

    /// Blocks for terms `(after, highest]`, ascending.
    pub fn blocks_after(&self, after: Term) -> Vec<Block> {
        self.blocks
            .range(after.saturating_add(1)..)
            .map(|(_, block)| block.clone())
            .collect()
    }

    /// Append the block for the next term.
    pub fn add_block(&mut self, block: Block) -> Result<(), ChainError> {
        if let Some(stored) = self.blocks.get(&block.term) {
            return if stored.hash() == block.hash() && stored.decrypted.hash == block.decrypted.hash
            {
                Err(ChainError::Duplicate { term: block.term })
            } else {
                Err(ChainError::Conflict {
                    term: block.term,
                    stored: stored.decrypted.hash,
                    incoming: block.decrypted.hash,
                })
            };
        }

        let expected = self.highest_term() + 1;
        if block.term != expected {
            return Err(ChainError::NonContiguous {
                expected,
                got: block.term,
            });
        }

        if !block.encrypted.extends(self.last_block()) {
            return Err(ChainError::BrokenLink { term: block.term });
        }

        trace!(term = block.term, hash = ?block.hash(), "Block appended");
        self.blocks.insert(block.term, block);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oapbft_types::{BlockProof, CommitteeMap, DecryptedBlock, EncryptedBlock, NodeId};

    fn next_block(chain: &ChainStore, content: &[u8]) -> Block {
        let last = chain.last_block();
        let term = last.term + 1;
        let encrypted = EncryptedBlock::new(
            term,
            1,
            content.to_vec(),
            last,
            NodeId(1),
            CommitteeMap::identity(4),
        );
        let decrypted = DecryptedBlock::from_encrypted(&encrypted);
        let proof = BlockProof::new(term, encrypted.hash, 4);
        Block {
            term,
            encrypted,
            decrypted,
            proof,
            shares: vec![],
        }
    }

    #[test]
    fn test_new_store_holds_genesis() {
        let chain = ChainStore::new(4);
        assert_eq!(chain.highest_term(), 0);
        assert_eq!(chain.last_block(), &Block::genesis(4));
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_append_contiguous_blocks() {
        let mut chain = ChainStore::new(4);
        let first = next_block(&chain, b"one");
        chain.add_block(first.clone()).unwrap();
        let second = next_block(&chain, b"two");
        chain.add_block(second).unwrap();

        assert_eq!(chain.highest_term(), 2);
        assert_eq!(chain.get(1), Some(&first));
        assert_eq!(
            chain.blocks_after(0).iter().map(|b| b.term).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(chain.blocks_after(2).is_empty());
    }

    #[test]
    fn test_duplicate_and_conflict() {
        let mut chain = ChainStore::new(4);
        let genesis_chain = chain.clone();
        let block = next_block(&chain, b"one");
        chain.add_block(block.clone()).unwrap();

        assert_eq!(
            chain.add_block(block),
            Err(ChainError::Duplicate { term: 1 })
        );

        let rival = next_block(&genesis_chain, b"rival");
        assert!(matches!(
            chain.add_block(rival),
            Err(ChainError::Conflict { term: 1, .. })
        ));
    }

    #[test]
    fn test_rejects_gap_and_broken_link() {
        let mut chain = ChainStore::new(4);
        let mut ahead = next_block(&chain, b"one");
        ahead.term = 3;
        assert_eq!(
            chain.add_block(ahead),
            Err(ChainError::NonContiguous {
                expected: 1,
                got: 3
            })
        );

        let mut unlinked = next_block(&chain, b"one");
        unlinked.encrypted.last_encrypted_hash = Hash::from_bytes(b"elsewhere");
        assert_eq!(
            chain.add_block(unlinked),
            Err(ChainError::BrokenLink { term: 1 })
        );
    }
}
