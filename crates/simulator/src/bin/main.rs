//! oa-pbft Simulator CLI
//!
//! Run a deterministic oa-pbft simulation from flags, a scenario file, or both
//! (flags override the file).
//!
//! # Example
//!
//! ```bash
//! # Seven nodes, committees of four, fixed seed
//! oapbft-sim -n 7 -m 4 -f 1 -k 3 --seed 42 -d 30
//!
//! # Scenario file with the first leader silenced in term 1
//! oapbft-sim --scenario crates/simulator/scenarios/leader_failure.toml
//! ```

use clap::Parser;
use oapbft_bft::FaultKind;
use oapbft_simulator::{run, FaultAssignment, Scenario};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// oa-pbft Simulator
///
/// Runs deterministic committee-PBFT simulations. Single-threaded,
/// reproducible when the same seed is used.
#[derive(Parser, Debug)]
#[command(name = "oapbft-sim")]
#[command(version, about, long_about = None)]
struct Args {
    /// TOML scenario file
    #[arg(long)]
    scenario: Option<PathBuf>,

    /// Total number of nodes
    #[arg(short = 'n', long)]
    nodes: Option<usize>,

    /// Committee size
    #[arg(short = 'm', long)]
    committee: Option<usize>,

    /// Byzantine bound f
    #[arg(short = 'f', long)]
    byzantine: Option<usize>,

    /// Decryption share threshold k
    #[arg(short = 'k', long)]
    threshold: Option<usize>,

    /// Simulation duration in seconds
    #[arg(short = 'd', long)]
    duration: Option<u64>,

    /// Random seed for reproducible results. When omitted, the scenario's
    /// seed is used, or a random one without a scenario.
    #[arg(long)]
    seed: Option<u64>,

    /// One-way network latency in milliseconds
    #[arg(long)]
    latency_ms: Option<u64>,

    /// Packet loss rate (0.0-1.0)
    #[arg(long)]
    loss: Option<f64>,

    /// Per-sender bandwidth in bytes per second
    #[arg(long)]
    bandwidth: Option<u64>,

    /// Make a node withhold every proposal it would lead (repeatable)
    #[arg(long = "silent-leader")]
    silent_leaders: Vec<u64>,

    /// Make a node withhold every protocol message (repeatable)
    #[arg(long = "mute")]
    mute: Vec<u64>,
}

impl Args {
    fn into_scenario(self) -> Result<Scenario, oapbft_simulator::ScenarioError> {
        let mut scenario = match &self.scenario {
            Some(path) => Scenario::load(path)?,
            None => Scenario {
                seed: rand::random(),
                ..Scenario::default()
            },
        };

        if let Some(nodes) = self.nodes {
            scenario.params.num_nodes = nodes;
        }
        if let Some(committee) = self.committee {
            scenario.params.committee_size = committee;
        }
        if let Some(byzantine) = self.byzantine {
            scenario.params.num_byz = byzantine;
        }
        if let Some(threshold) = self.threshold {
            scenario.params.sharing_threshold = threshold;
        }
        if let Some(duration) = self.duration {
            scenario.duration_ms = duration * 1_000;
        }
        if let Some(seed) = self.seed {
            scenario.seed = seed;
        }
        if let Some(latency) = self.latency_ms {
            scenario.network.latency_ms = latency;
        }
        if let Some(loss) = self.loss {
            scenario.network.packet_loss_rate = loss;
        }
        if self.bandwidth.is_some() {
            scenario.network.bandwidth_bytes_per_sec = self.bandwidth;
        }

        scenario
            .faults
            .extend(self.silent_leaders.iter().map(|&node| FaultAssignment {
                node,
                fault: FaultKind::SilentLeader { terms: None },
            }));
        scenario
            .faults
            .extend(self.mute.iter().map(|&node| FaultAssignment {
                node,
                fault: FaultKind::Mute,
            }));

        Ok(scenario)
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,oapbft_simulator=info")),
        )
        .init();

    let scenario = match Args::parse().into_scenario() {
        Ok(scenario) => scenario,
        Err(e) => {
            error!(error = %e, "Failed to build scenario");
            return ExitCode::FAILURE;
        }
    };

    info!(
        nodes = scenario.params.num_nodes,
        committee = scenario.params.committee_size,
        byzantine = scenario.params.num_byz,
        threshold = scenario.params.sharing_threshold,
        duration_ms = scenario.duration_ms,
        seed = scenario.seed,
        "Starting simulation"
    );

    let report = match run(&scenario) {
        Ok(report) => report,
        Err(e) => {
            error!(error = %e, "Simulation failed");
            return ExitCode::FAILURE;
        }
    };

    report.print_summary();

    if report.is_safe() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
