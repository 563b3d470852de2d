//! Block types.
//!
//! A term closes in two stages: the committee agrees on an
//! [`EncryptedBlock`] (backed by a [`BlockProof`]), then enough
//! [`BlockShare`]s are collected to produce its [`DecryptedBlock`]. Both,
//! plus the proof and shares, form the immutable [`Block`] appended to a
//! node's chain.

use crate::{CommitteeMap, Hash, NodeBitset, NodeId, Term, View};
use serde::{Deserialize, Serialize};

const GENESIS_CONTENT: &[u8] = b"genesis";
const DECRYPTED_DOMAIN: &[u8] = b"decrypted";

/// Block proposed and agreed on by a term's committee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBlock {
    pub term: Term,
    /// View in which this block was first proposed.
    pub view: View,
    pub content: Vec<u8>,
    /// `H(content)`.
    pub hash: Hash,
    /// Encrypted hash of the previous block in the chain.
    pub last_encrypted_hash: Hash,
    /// Decrypted hash of the previous block in the chain.
    pub last_decrypted_hash: Hash,
    pub creator: NodeId,
    /// Committee map the creator claims for this term.
    pub committee_map: CommitteeMap,
}

impl EncryptedBlock {
    /// Build a block extending `previous`.
    pub fn new(
        term: Term,
        view: View,
        content: Vec<u8>,
        previous: &Block,
        creator: NodeId,
        committee_map: CommitteeMap,
    ) -> Self {
        let hash = Self::content_hash(&content);
        Self {
            term,
            view,
            content,
            hash,
            last_encrypted_hash: previous.encrypted.hash,
            last_decrypted_hash: previous.decrypted.hash,
            creator,
            committee_map,
        }
    }

    /// Content hash for an encrypted block.
    pub fn content_hash(content: &[u8]) -> Hash {
        Hash::from_bytes(content)
    }

    /// Whether the claimed hash matches the content.
    pub fn has_valid_hash(&self) -> bool {
        self.hash == Self::content_hash(&self.content)
    }

    /// Whether this block's chain pointers reference `previous`.
    pub fn extends(&self, previous: &Block) -> bool {
        self.last_encrypted_hash == previous.encrypted.hash
            && self.last_decrypted_hash == previous.decrypted.hash
    }
}

/// Block produced once the sharing threshold is met.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptedBlock {
    pub term: Term,
    /// Copied through from the encrypted block.
    pub content: Vec<u8>,
    /// `H("decrypted" || content)`; seeds the next term's sortition.
    pub hash: Hash,
    /// Hash of the encrypted block this decrypts.
    pub encrypted_hash: Hash,
    pub committee_map: CommitteeMap,
}

impl DecryptedBlock {
    /// Deterministically decrypt an encrypted block.
    pub fn from_encrypted(block: &EncryptedBlock) -> Self {
        Self {
            term: block.term,
            content: block.content.clone(),
            hash: Hash::from_parts(&[DECRYPTED_DOMAIN, &block.content]),
            encrypted_hash: block.hash,
            committee_map: block.committee_map.clone(),
        }
    }
}

/// Quorum certificate: which committee members prepared and committed a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockProof {
    pub term: Term,
    pub hash: Hash,
    pub prepares: NodeBitset,
    pub commits: NodeBitset,
    /// Set exactly once, after the commits reach a byzantine majority.
    pub committed: bool,
}

impl BlockProof {
    pub fn new(term: Term, hash: Hash, num_nodes: usize) -> Self {
        Self {
            term,
            hash,
            prepares: NodeBitset::new(num_nodes),
            commits: NodeBitset::new(num_nodes),
            committed: false,
        }
    }
}

/// One node's decryption contribution for a committed block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockShare {
    pub block_hash: Hash,
    pub term: Term,
    pub node: NodeId,
}

/// Finalized block held in a node's chain. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub term: Term,
    pub encrypted: EncryptedBlock,
    pub decrypted: DecryptedBlock,
    pub proof: BlockProof,
    pub shares: Vec<BlockShare>,
}

impl Block {
    /// Genesis block (term 0) shared by every node.
    ///
    /// Uses the identity committee map; its proof is marked committed with
    /// empty bitsets since nobody votes on genesis.
    pub fn genesis(num_nodes: usize) -> Self {
        let committee_map = CommitteeMap::identity(num_nodes);
        let content = GENESIS_CONTENT.to_vec();
        let hash = EncryptedBlock::content_hash(&content);
        let encrypted = EncryptedBlock {
            term: 0,
            view: 1,
            content,
            hash,
            last_encrypted_hash: Hash::ZERO,
            last_decrypted_hash: Hash::ZERO,
            creator: NodeId(0),
            committee_map,
        };
        let decrypted = DecryptedBlock::from_encrypted(&encrypted);
        let mut proof = BlockProof::new(0, hash, num_nodes);
        proof.committed = true;

        Self {
            term: 0,
            encrypted,
            decrypted,
            proof,
            shares: Vec::new(),
        }
    }

    /// Hash identifying the agreed block.
    pub fn hash(&self) -> Hash {
        self.encrypted.hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genesis_is_identical_across_nodes() {
        assert_eq!(Block::genesis(4), Block::genesis(4));
        assert_eq!(Block::genesis(4).term, 0);
        assert!(Block::genesis(4).proof.committed);
    }

    #[test]
    fn test_encrypted_block_chains_to_previous() {
        let genesis = Block::genesis(4);
        let map = CommitteeMap::identity(4);
        let block = EncryptedBlock::new(1, 1, b"payload".to_vec(), &genesis, NodeId(1), map);
        assert!(block.has_valid_hash());
        assert!(block.extends(&genesis));
    }

    #[test]
    fn test_tampered_content_breaks_hash() {
        let genesis = Block::genesis(4);
        let map = CommitteeMap::identity(4);
        let mut block = EncryptedBlock::new(1, 1, b"payload".to_vec(), &genesis, NodeId(1), map);
        block.content = b"tampered".to_vec();
        assert!(!block.has_valid_hash());
    }

    #[test]
    fn test_decryption_is_deterministic_and_distinct() {
        let genesis = Block::genesis(4);
        let map = CommitteeMap::identity(4);
        let block = EncryptedBlock::new(1, 1, b"payload".to_vec(), &genesis, NodeId(1), map);
        let a = DecryptedBlock::from_encrypted(&block);
        let b = DecryptedBlock::from_encrypted(&block);
        assert_eq!(a, b);
        assert_eq!(a.content, block.content);
        assert_eq!(a.encrypted_hash, block.hash);
        assert_ne!(a.hash, block.hash);
    }
}
