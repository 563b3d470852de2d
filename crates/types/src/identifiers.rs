//! Identifier types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Monotonically increasing block-height round. Genesis is term 0.
pub type Term = u64;

/// Sub-round within a term. Resets to 1 on term entry, advances on view change.
pub type View = u64;

/// Identity of a node in the network.
///
/// Node numbers are 1-based (`1..=num_nodes`), matching the bit positions in
/// [`NodeBitset`]. The simulation runner routes on 0-based indices; use
/// [`NodeId::index`] / [`NodeId::from_index`] to convert.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Node identity for a 0-based runner index.
    pub fn from_index(index: usize) -> Self {
        NodeId(index as u64 + 1)
    }

    /// 0-based runner index for this node.
    pub fn index(self) -> usize {
        self.0.saturating_sub(1) as usize
    }

    /// Whether this identity exists in a network of `num_nodes`.
    pub fn in_network(self, num_nodes: usize) -> bool {
        (1..=num_nodes as u64).contains(&self.0)
    }

    /// All node identities for a network of `num_nodes`.
    pub fn all(num_nodes: usize) -> impl Iterator<Item = NodeId> {
        (1..=num_nodes as u64).map(NodeId)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Per-node boolean array indexed by node number (1..N).
///
/// Used for the prepare/commit bitsets of a [`BlockProof`](crate::BlockProof).
/// Out-of-range node numbers are never set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NodeBitset {
    bits: Vec<bool>,
}

impl NodeBitset {
    /// Empty bitset for a network of `num_nodes`.
    pub fn new(num_nodes: usize) -> Self {
        Self {
            bits: vec![false; num_nodes],
        }
    }

    /// Number of node slots.
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// Whether the bitset has no slots.
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Set the bit for `node`. Returns `true` if it was newly set.
    pub fn set(&mut self, node: NodeId) -> bool {
        match self.bits.get_mut(node.index()) {
            Some(bit) if node.0 >= 1 && !*bit => {
                *bit = true;
                true
            }
            _ => false,
        }
    }

    /// Whether the bit for `node` is set.
    pub fn contains(&self, node: NodeId) -> bool {
        node.0 >= 1 && self.bits.get(node.index()).copied().unwrap_or(false)
    }

    /// Number of set bits belonging to the given members.
    pub fn count_among(&self, members: &[NodeId]) -> usize {
        members.iter().filter(|&&m| self.contains(m)).count()
    }

    /// Iterate over the nodes whose bit is set.
    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, &set)| set)
            .map(|(i, _)| NodeId::from_index(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_index_conversion() {
        assert_eq!(NodeId::from_index(0), NodeId(1));
        assert_eq!(NodeId(4).index(), 3);
        assert_eq!(NodeId::all(3).collect::<Vec<_>>(), vec![NodeId(1), NodeId(2), NodeId(3)]);
    }

    #[test]
    fn test_in_network_is_one_based() {
        assert!(NodeId(1).in_network(4));
        assert!(NodeId(4).in_network(4));
        assert!(!NodeId(0).in_network(4));
        assert!(!NodeId(5).in_network(4));
    }

    #[test]
    fn test_bitset_set_is_idempotent() {
        let mut bits = NodeBitset::new(4);
        assert!(bits.set(NodeId(2)));
        assert!(!bits.set(NodeId(2)));
        assert!(bits.contains(NodeId(2)));
        assert!(!bits.contains(NodeId(1)));
    }

    #[test]
    fn test_bitset_rejects_out_of_range() {
        let mut bits = NodeBitset::new(4);
        assert!(!bits.set(NodeId(0)));
        assert!(!bits.set(NodeId(5)));
        assert!(!bits.contains(NodeId(0)));
        assert_eq!(bits.iter().count(), 0);
    }

    #[test]
    fn test_count_among_committee() {
        let mut bits = NodeBitset::new(5);
        for n in [1, 2, 5] {
            bits.set(NodeId(n));
        }
        // Node 5 is outside this committee and must not be counted.
        let committee = [NodeId(1), NodeId(2), NodeId(3)];
        assert_eq!(bits.count_among(&committee), 2);
    }
}
