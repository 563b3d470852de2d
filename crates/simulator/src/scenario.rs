//! Scenario files.
//!
//! A scenario is a TOML document; every field has a default so a file only
//! states what differs from a four-node, single-fault network.
//!
//! ```toml
//! seed = 7
//! duration_ms = 20000
//!
//! [params]
//! num_nodes = 4
//! committee_size = 4
//! num_byz = 1
//! sharing_threshold = 2
//!
//! [[faults]]
//! node = 2
//! fault = { kind = "silent_leader", terms = [1, 2] }
//!
//! [[late_starts]]
//! node = 4
//! at_ms = 3000
//! ```

use oapbft_bft::{BftConfig, FaultKind};
use oapbft_network_memory::NetworkConfig;
use oapbft_node::SyncConfig;
use oapbft_simulation::SimulationConfig;
use oapbft_types::{ConfigError, ConsensusParams, NodeId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("failed to read scenario {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid scenario: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("node {node} does not exist in a {num_nodes}-node network")]
    UnknownNode { node: u64, num_nodes: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scenario {
    pub seed: u64,
    pub duration_ms: u64,
    /// Bytes of random content per block.
    pub payload_size: usize,
    pub params: ParamsSection,
    pub bft: BftSection,
    pub sync: SyncSection,
    pub network: NetworkSection,
    pub faults: Vec<FaultAssignment>,
    pub late_starts: Vec<LateStart>,
    pub sleeps: Vec<SleepWindow>,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            seed: 42,
            duration_ms: 30_000,
            payload_size: 64,
            params: ParamsSection::default(),
            bft: BftSection::default(),
            sync: SyncSection::default(),
            network: NetworkSection::default(),
            faults: Vec::new(),
            late_starts: Vec::new(),
            sleeps: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParamsSection {
    pub num_nodes: usize,
    pub committee_size: usize,
    pub num_byz: usize,
    pub sharing_threshold: usize,
}

impl Default for ParamsSection {
    fn default() -> Self {
        Self {
            num_nodes: 4,
            committee_size: 4,
            num_byz: 1,
            sharing_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BftSection {
    pub block_interval_ms: u64,
    pub proposal_timeout_ms: u64,
    pub max_proposal_timeout_ms: u64,
}

impl Default for BftSection {
    fn default() -> Self {
        let config = BftConfig::default();
        Self {
            block_interval_ms: config.block_interval.as_millis() as u64,
            proposal_timeout_ms: config.proposal_timeout.as_millis() as u64,
            max_proposal_timeout_ms: config.max_proposal_timeout.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    pub retry_interval_ms: u64,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            retry_interval_ms: SyncConfig::default().retry_interval.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    pub latency_ms: u64,
    pub jitter_fraction: f64,
    pub packet_loss_rate: f64,
    pub bandwidth_bytes_per_sec: Option<u64>,
}

impl Default for NetworkSection {
    fn default() -> Self {
        let config = NetworkConfig::default();
        Self {
            latency_ms: config.latency.as_millis() as u64,
            jitter_fraction: config.jitter_fraction,
            packet_loss_rate: config.packet_loss_rate,
            bandwidth_bytes_per_sec: config.bandwidth_bytes_per_sec,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultAssignment {
    pub node: u64,
    pub fault: FaultKind,
}

/// Node held back until `at_ms`. Nodes without an entry start at time zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LateStart {
    pub node: u64,
    pub at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SleepWindow {
    pub node: u64,
    pub at_ms: u64,
    pub duration_ms: u64,
}

impl Scenario {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScenarioError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ScenarioError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ScenarioError> {
        Ok(toml::from_str(text)?)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn consensus_params(&self) -> Result<ConsensusParams, ConfigError> {
        ConsensusParams::new(
            self.params.num_nodes,
            self.params.committee_size,
            self.params.num_byz,
            self.params.sharing_threshold,
        )
    }

    /// Validated simulation config; also checks every node reference.
    pub fn simulation_config(&self) -> Result<SimulationConfig, ScenarioError> {
        let params = self.consensus_params()?;

        let referenced = self
            .faults
            .iter()
            .map(|f| f.node)
            .chain(self.late_starts.iter().map(|s| s.node))
            .chain(self.sleeps.iter().map(|s| s.node));
        for node in referenced {
            self.node_id(node)?;
        }

        let bft = BftConfig::default()
            .with_block_interval(Duration::from_millis(self.bft.block_interval_ms))
            .with_proposal_timeout(Duration::from_millis(self.bft.proposal_timeout_ms))
            .with_max_proposal_timeout(Duration::from_millis(self.bft.max_proposal_timeout_ms));
        let sync = SyncConfig::default()
            .with_retry_interval(Duration::from_millis(self.sync.retry_interval_ms));
        let network = NetworkConfig {
            num_nodes: params.num_nodes,
            latency: Duration::from_millis(self.network.latency_ms),
            jitter_fraction: self.network.jitter_fraction.clamp(0.0, 1.0),
            packet_loss_rate: self.network.packet_loss_rate.clamp(0.0, 1.0),
            bandwidth_bytes_per_sec: self.network.bandwidth_bytes_per_sec,
        };

        Ok(SimulationConfig::new(params)
            .with_bft(bft)
            .with_sync(sync)
            .with_network(network)
            .with_payload_size(self.payload_size))
    }

    /// Map a 1-based node number from the file onto a `NodeId`.
    pub fn node_id(&self, node: u64) -> Result<NodeId, ScenarioError> {
        if node == 0 || node > self.params.num_nodes as u64 {
            return Err(ScenarioError::UnknownNode {
                node,
                num_nodes: self.params.num_nodes,
            });
        }
        Ok(NodeId(node))
    }
}
