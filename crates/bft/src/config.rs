//! BFT configuration.

use oapbft_types::View;
use std::time::Duration;

/// Consensus engine timing configuration.
#[derive(Debug, Clone)]
pub struct BftConfig {
    /// Delay between the view-1 leader entering a term and proposing.
    pub block_interval: Duration,

    /// Base proposal expiry for view 1.
    ///
    /// Each later view doubles it: view `v` waits `proposal_timeout * 2^(v-1)`.
    pub proposal_timeout: Duration,

    /// Upper bound on the backed-off proposal expiry.
    pub max_proposal_timeout: Duration,
}

impl Default for BftConfig {
    fn default() -> Self {
        Self {
            block_interval: Duration::from_millis(100),
            proposal_timeout: Duration::from_secs(2),
            max_proposal_timeout: Duration::from_secs(30),
        }
    }
}

impl BftConfig {
    /// Create a new BFT configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the leader's propose delay.
    pub fn with_block_interval(mut self, interval: Duration) -> Self {
        self.block_interval = interval;
        self
    }

    /// Set the base proposal expiry.
    pub fn with_proposal_timeout(mut self, timeout: Duration) -> Self {
        self.proposal_timeout = timeout;
        self
    }

    /// Set the backoff cap.
    pub fn with_max_proposal_timeout(mut self, timeout: Duration) -> Self {
        self.max_proposal_timeout = timeout;
        self
    }

    /// Proposal expiry for `view`, with exponential backoff.
    pub fn proposal_timeout_for(&self, view: View) -> Duration {
        let doublings = view.saturating_sub(1).min(31) as u32;
        self.proposal_timeout
            .saturating_mul(1u32 << doublings)
            .min(self.max_proposal_timeout)
    }
}
