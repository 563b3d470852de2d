//! Deployment parameters and quorum arithmetic.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Byzantine majority: `count >= 2f + 1`.
pub fn is_byz_maj(count: usize, num_byz: usize) -> bool {
    count >= 2 * num_byz + 1
}

/// Parameters injected at node start. Never re-derived at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusParams {
    /// Total node count `N`.
    pub num_nodes: usize,
    /// Active committee size `m`.
    pub committee_size: usize,
    /// Byzantine bound `f`.
    pub num_byz: usize,
    /// Decryption sharing threshold `k`.
    pub sharing_threshold: usize,
}

/// Invalid parameter combinations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("network must have at least one node")]
    NoNodes,

    #[error("committee size {committee_size} exceeds node count {num_nodes}")]
    CommitteeTooLarge {
        committee_size: usize,
        num_nodes: usize,
    },

    #[error("committee size {committee_size} cannot tolerate {num_byz} byzantine members (needs at least {required})")]
    CommitteeTooSmall {
        committee_size: usize,
        num_byz: usize,
        required: usize,
    },

    #[error("sharing threshold {threshold} must be within 1..={num_nodes}")]
    InvalidThreshold { threshold: usize, num_nodes: usize },

    #[error("{0}")]
    Invalid(String),
}

impl ConsensusParams {
    pub fn new(
        num_nodes: usize,
        committee_size: usize,
        num_byz: usize,
        sharing_threshold: usize,
    ) -> Result<Self, ConfigError> {
        let params = Self {
            num_nodes,
            committee_size,
            num_byz,
            sharing_threshold,
        };
        params.validate()?;
        Ok(params)
    }

    /// Check `N >= 1`, `2f+1 <= m <= N` and `1 <= k <= N`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_nodes == 0 {
            return Err(ConfigError::NoNodes);
        }
        if self.committee_size > self.num_nodes {
            return Err(ConfigError::CommitteeTooLarge {
                committee_size: self.committee_size,
                num_nodes: self.num_nodes,
            });
        }
        if self.committee_size < self.quorum() {
            return Err(ConfigError::CommitteeTooSmall {
                committee_size: self.committee_size,
                num_byz: self.num_byz,
                required: self.quorum(),
            });
        }
        if self.sharing_threshold == 0 || self.sharing_threshold > self.num_nodes {
            return Err(ConfigError::InvalidThreshold {
                threshold: self.sharing_threshold,
                num_nodes: self.num_nodes,
            });
        }
        Ok(())
    }

    /// Votes needed for a byzantine majority: `2f + 1`.
    pub fn quorum(&self) -> usize {
        2 * self.num_byz + 1
    }

    /// [`is_byz_maj`] with this deployment's `f`.
    pub fn is_byz_maj(&self, count: usize) -> bool {
        is_byz_maj(count, self.num_byz)
    }

    /// Number of sync peers: `f + 1` guarantees one honest peer, capped by
    /// the number of other nodes.
    pub fn sync_peer_count(&self) -> usize {
        (self.num_byz + 1).min(self.num_nodes.saturating_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byz_maj_with_one_fault() {
        assert!(!is_byz_maj(0, 1));
        assert!(!is_byz_maj(1, 1));
        assert!(!is_byz_maj(2, 1));
        assert!(is_byz_maj(3, 1));
        assert!(is_byz_maj(4, 1));
    }

    #[test]
    fn test_byz_maj_without_faults() {
        assert!(!is_byz_maj(0, 0));
        assert!(is_byz_maj(1, 0));
    }

    #[test]
    fn test_params_validation() {
        assert!(ConsensusParams::new(4, 4, 1, 2).is_ok());
        assert!(ConsensusParams::new(5, 5, 0, 3).is_ok());
        assert_eq!(ConsensusParams::new(0, 0, 0, 1), Err(ConfigError::NoNodes));
        assert!(matches!(
            ConsensusParams::new(4, 5, 1, 2),
            Err(ConfigError::CommitteeTooLarge { .. })
        ));
        assert!(matches!(
            ConsensusParams::new(10, 4, 2, 2),
            Err(ConfigError::CommitteeTooSmall { required: 5, .. })
        ));
        assert!(matches!(
            ConsensusParams::new(4, 4, 1, 0),
            Err(ConfigError::InvalidThreshold { .. })
        ));
        assert!(matches!(
            ConsensusParams::new(4, 4, 1, 5),
            Err(ConfigError::InvalidThreshold { .. })
        ));
    }

    #[test]
    fn test_sync_peer_count() {
        let params = ConsensusParams::new(4, 4, 1, 2).unwrap();
        assert_eq!(params.sync_peer_count(), 2);
        let single = ConsensusParams::new(1, 1, 0, 1).unwrap();
        assert_eq!(single.sync_peer_count(), 0);
    }
}
