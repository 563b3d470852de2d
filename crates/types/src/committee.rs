//! Committee selection via sortition.
//!
//! Each term's committee is a seeded permutation of every node identity.
//! The seed is the content hash of the previous term's decrypted block, so
//! every node that holds the same chain derives the same committee without
//! any communication.
//!
//! ```text
//!   order:  [ n3  n1  n5 | n2  n4 ]
//!             └─ committee (m=3) ┘
//!   leader(view) = order[(view - 1) % m]
//! ```

use crate::{DecryptedBlock, Hash, NodeId, View};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Ordered permutation of all node identities for one term.
///
/// Equality is order-sensitive and compares only the permutation; the seed
/// fields are bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitteeMap {
    order: Vec<NodeId>,
    /// Hash of the decrypted block this map was derived from.
    seed: Hash,
    /// Seed of the map that preceded this one, if any.
    previous_seed: Option<Hash>,
}

impl PartialEq for CommitteeMap {
    fn eq(&self, other: &Self) -> bool {
        self.order == other.order
    }
}

impl Eq for CommitteeMap {}

impl CommitteeMap {
    /// Identity permutation `1..=num_nodes`, used for the genesis block.
    pub fn identity(num_nodes: usize) -> Self {
        Self {
            order: NodeId::all(num_nodes).collect(),
            seed: Hash::ZERO,
            previous_seed: None,
        }
    }

    /// Build a map from an explicit order. Test and fixture use.
    pub fn from_order(order: Vec<NodeId>, seed: Hash) -> Self {
        Self {
            order,
            seed,
            previous_seed: None,
        }
    }

    /// Full permutation.
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    /// Number of nodes in the permutation.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the permutation is empty.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn seed(&self) -> Hash {
        self.seed
    }

    pub fn previous_seed(&self) -> Option<Hash> {
        self.previous_seed
    }

    /// Active committee: the first `committee_size` entries.
    pub fn committee(&self, committee_size: usize) -> &[NodeId] {
        &self.order[..committee_size.min(self.order.len())]
    }

    /// Whether `node` is in the active committee.
    pub fn is_member(&self, node: NodeId, committee_size: usize) -> bool {
        self.committee(committee_size).contains(&node)
    }

    /// Leader for `view`: `order[(view - 1) % committee_size]`.
    ///
    /// Views start at 1; view 0 is treated as view 1. Returns `None` only
    /// for an empty map or a zero committee size.
    pub fn leader(&self, view: View, committee_size: usize) -> Option<NodeId> {
        let committee = self.committee(committee_size);
        if committee.is_empty() {
            return None;
        }
        let slot = (view.max(1) - 1) % committee.len() as u64;
        committee.get(slot as usize).copied()
    }
}

/// Derive the committee map for the term after `seed_block`.
///
/// Pure function of the seed block's content hash: the hash bytes seed a
/// ChaCha8 RNG that shuffles `1..=num_nodes`.
pub fn sortition(seed_block: &DecryptedBlock, num_nodes: usize) -> CommitteeMap {
    let seed = seed_block.hash;
    let mut rng = ChaCha8Rng::from_seed(seed.to_bytes());
    let mut order: Vec<NodeId> = NodeId::all(num_nodes).collect();
    order.shuffle(&mut rng);

    CommitteeMap {
        order,
        seed,
        previous_seed: Some(seed_block.committee_map.seed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Block;

    #[test]
    fn test_sortition_is_deterministic() {
        let genesis = Block::genesis(7);
        let a = sortition(&genesis.decrypted, 7);
        let b = sortition(&genesis.decrypted, 7);
        assert_eq!(a.order(), b.order());
        assert_eq!(a.seed(), genesis.decrypted.hash);
    }

    #[test]
    fn test_sortition_is_a_permutation() {
        let genesis = Block::genesis(9);
        let map = sortition(&genesis.decrypted, 9);
        let mut sorted = map.order().to_vec();
        sorted.sort();
        assert_eq!(sorted, NodeId::all(9).collect::<Vec<_>>());
    }

    #[test]
    fn test_different_seeds_give_different_orders() {
        let genesis = Block::genesis(16);
        let mut other = genesis.decrypted.clone();
        other.hash = Hash::from_bytes(b"another seed");
        assert_ne!(
            sortition(&genesis.decrypted, 16).order(),
            sortition(&other, 16).order()
        );
    }

    #[test]
    fn test_leader_rotates_through_committee() {
        let order = vec![NodeId(3), NodeId(1), NodeId(5), NodeId(2), NodeId(4)];
        let map = CommitteeMap::from_order(order.clone(), Hash::ZERO);
        let m = 3;
        for view in 1..=10u64 {
            let expected = order[((view - 1) % m as u64) as usize];
            assert_eq!(map.leader(view, m), Some(expected));
        }
        assert!(map.is_member(NodeId(5), m));
        assert!(!map.is_member(NodeId(2), m));
    }

    #[test]
    fn test_equality_ignores_seed_bookkeeping() {
        let a = CommitteeMap::from_order(vec![NodeId(1), NodeId(2)], Hash::ZERO);
        let b = CommitteeMap::from_order(vec![NodeId(1), NodeId(2)], Hash::from_bytes(b"s"));
        let c = CommitteeMap::from_order(vec![NodeId(2), NodeId(1)], Hash::ZERO);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
