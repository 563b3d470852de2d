//! End-to-end consensus scenarios: every node keeps closing terms, with
//! and without a faulty leader.

use oapbft_bft::{BftConfig, SilentLeader};
use oapbft_network_memory::NetworkConfig;
use oapbft_simulation::{SimulationConfig, SimulationRunner};
use oapbft_types::{sortition, Block, ConsensusParams, NodeId};
use std::time::Duration;
use tracing_test::traced_test;

fn config(params: ConsensusParams) -> SimulationConfig {
    SimulationConfig::new(params)
        .with_bft(
            BftConfig::default()
                .with_block_interval(Duration::from_millis(50))
                .with_proposal_timeout(Duration::from_millis(500)),
        )
        .with_network(NetworkConfig {
            latency: Duration::from_millis(10),
            jitter_fraction: 0.1,
            ..Default::default()
        })
}

#[traced_test]
#[test]
fn test_happy_path_all_nodes_advance() {
    let params = ConsensusParams::new(4, 4, 1, 2).unwrap();
    let mut runner = SimulationRunner::new(config(params), 7).unwrap();
    runner.start_all();
    runner.run_until(Duration::from_secs(5));

    let heights = runner.heights();
    assert!(heights.iter().all(|&h| h >= 5), "heights: {heights:?}");
    assert!(runner.verify_safety().is_ok());
    assert_eq!(runner.stats().forks_detected, 0);
}

#[test]
fn test_happy_path_five_nodes_without_faults() {
    // f = 0: the leader's PrePrepare alone prepares each member.
    let params = ConsensusParams::new(5, 5, 0, 3).unwrap();
    let mut config = config(params);
    config.network.jitter_fraction = 0.0;
    let mut runner = SimulationRunner::new(config, 17).unwrap();
    runner.start_all();
    runner.run_until(Duration::from_secs(5));

    let heights = runner.heights();
    let min = heights.iter().copied().min().unwrap_or(0);
    let max = heights.iter().copied().max().unwrap_or(0);
    assert!(min >= 10, "heights: {heights:?}");
    assert!(max - min <= 1, "heights: {heights:?}");

    let reference = runner.node(NodeId(1)).unwrap().chain();
    for term in 1..=min {
        let expected = &reference.get(term).unwrap().decrypted;
        for node in runner.nodes() {
            let block = node.chain().get(term).unwrap();
            assert_eq!(&block.decrypted, expected, "term {term} on {}", node.node());
        }
    }
    assert!(runner.verify_safety().is_ok());
    assert_eq!(runner.stats().forks_detected, 0);
    let view_changes: u64 = runner
        .nodes()
        .map(|node| node.engine().stats().view_changes)
        .sum();
    assert_eq!(view_changes, 0);
}

#[test]
fn test_committee_smaller_than_network() {
    let params = ConsensusParams::new(7, 4, 1, 3).unwrap();
    let mut runner = SimulationRunner::new(config(params), 11).unwrap();
    runner.start_all();
    runner.run_until(Duration::from_secs(5));

    let heights = runner.heights();
    assert!(heights.iter().all(|&h| h >= 3), "heights: {heights:?}");
    assert!(runner.verify_safety().is_ok());

    // Committees rotate with each closed block.
    let chain = runner.node(NodeId(1)).unwrap().chain();
    let committees: Vec<_> = (1..=3)
        .filter_map(|term| chain.get(term))
        .map(|block| block.encrypted.committee_map.committee(4).to_vec())
        .collect();
    assert_eq!(committees.len(), 3);
}

#[traced_test]
#[test]
fn test_silent_leader_is_replaced() {
    let params = ConsensusParams::new(4, 4, 1, 2).unwrap();
    let first_leader = sortition(&Block::genesis(4).decrypted, 4)
        .leader(1, 4)
        .unwrap();

    let mut runner = SimulationRunner::new(config(params), 3).unwrap();
    runner.set_fault_behavior(first_leader, Box::new(SilentLeader::in_terms([1])));
    runner.start_all();
    runner.run_until(Duration::from_secs(10));

    let heights = runner.heights();
    assert!(heights.iter().all(|&h| h >= 3), "heights: {heights:?}");
    assert!(runner.verify_safety().is_ok());

    let term_one = runner.node(NodeId(1)).unwrap().chain().get(1).unwrap();
    assert!(term_one.encrypted.view > 1);
    assert_ne!(term_one.encrypted.creator, first_leader);

    let view_changes: u64 = runner
        .nodes()
        .map(|node| node.engine().stats().view_changes)
        .sum();
    assert!(view_changes > 0);
}

#[test]
fn test_packet_loss_never_breaks_safety() {
    let params = ConsensusParams::new(4, 4, 1, 2).unwrap();
    let mut config = config(params);
    config.network.packet_loss_rate = 0.05;
    let mut runner = SimulationRunner::new(config, 99).unwrap();
    runner.start_all();
    runner.run_until(Duration::from_secs(10));

    assert!(runner.stats().messages_dropped_loss > 0);
    assert!(runner.verify_safety().is_ok());
}
