//! Simulation configuration.

use oapbft_bft::BftConfig;
use oapbft_network_memory::NetworkConfig;
use oapbft_node::SyncConfig;
use oapbft_types::ConsensusParams;

/// Everything needed to build a simulated network of nodes.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub params: ConsensusParams,
    pub bft: BftConfig,
    pub sync: SyncConfig,
    /// `num_nodes` is always taken from `params`.
    pub network: NetworkConfig,
    /// Bytes of random content per proposed block.
    pub payload_size: usize,
}

impl SimulationConfig {
    pub fn new(params: ConsensusParams) -> Self {
        Self {
            params,
            bft: BftConfig::default(),
            sync: SyncConfig::default(),
            network: NetworkConfig {
                num_nodes: params.num_nodes,
                ..NetworkConfig::default()
            },
            payload_size: 64,
        }
    }

    pub fn with_bft(mut self, bft: BftConfig) -> Self {
        self.bft = bft;
        self
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_network(mut self, network: NetworkConfig) -> Self {
        self.network = NetworkConfig {
            num_nodes: self.params.num_nodes,
            ..network
        };
        self
    }

    pub fn with_payload_size(mut self, payload_size: usize) -> Self {
        self.payload_size = payload_size;
        self
    }
}
