//! Late starters, sleepers and partitioned nodes catch up through sync.

use oapbft_bft::BftConfig;
use oapbft_network_memory::NetworkConfig;
use oapbft_node::{SyncConfig, SyncStateKind};
use oapbft_simulation::{SimulationConfig, SimulationRunner};
use oapbft_types::{ConsensusParams, NodeId, Term};
use std::time::Duration;
use tracing_test::traced_test;

fn runner(seed: u64) -> SimulationRunner {
    let params = ConsensusParams::new(4, 4, 1, 2).unwrap();
    let config = SimulationConfig::new(params)
        .with_bft(
            BftConfig::default()
                .with_block_interval(Duration::from_millis(50))
                .with_proposal_timeout(Duration::from_millis(500)),
        )
        .with_sync(SyncConfig::default().with_retry_interval(Duration::from_millis(300)))
        .with_network(NetworkConfig {
            latency: Duration::from_millis(10),
            ..Default::default()
        });
    SimulationRunner::new(config, seed).unwrap()
}

fn max_height(runner: &SimulationRunner) -> Term {
    runner.heights().into_iter().max().unwrap_or(0)
}

fn height(runner: &SimulationRunner, node: NodeId) -> Term {
    runner.node(node).unwrap().chain().highest_term()
}

#[traced_test]
#[test]
fn test_late_node_catches_up() {
    let mut runner = runner(21);
    let late = NodeId(4);
    for node in [NodeId(1), NodeId(2), NodeId(3)] {
        runner.start_node(node, Duration::ZERO);
    }
    runner.start_node(late, Duration::from_secs(3));
    runner.run_until(Duration::from_secs(10));

    let caught_up = runner.node(late).unwrap().sync_status();
    assert!(caught_up.blocks_applied > 0);
    assert_eq!(caught_up.state, SyncStateKind::Idle);
    let height_then = height(&runner, late);
    assert!(
        max_height(&runner) - height_then <= 2,
        "heights: {:?}",
        runner.heights()
    );

    // From here on the node closes terms live, without asking again.
    runner.run_until(Duration::from_secs(20));
    let status = runner.node(late).unwrap().sync_status();
    assert_eq!(status.requests_sent, caught_up.requests_sent);
    assert_eq!(status.blocks_applied, caught_up.blocks_applied);
    assert!(height(&runner, late) > height_then);
    assert!(
        max_height(&runner) - height(&runner, late) <= 2,
        "heights: {:?}",
        runner.heights()
    );
    assert!(runner.verify_safety().is_ok());
}

#[test]
fn test_sleeping_node_catches_up_after_wake() {
    let mut runner = runner(5);
    let sleeper = NodeId(2);
    runner.start_all();
    runner.sleep_node(sleeper, Duration::from_secs(2), Duration::from_secs(3));

    runner.run_until(Duration::from_millis(4_900));
    assert!(runner.node(sleeper).unwrap().is_asleep());
    let frozen = height(&runner, sleeper);

    runner.run_until(Duration::from_secs(12));
    let node = runner.node(sleeper).unwrap();
    assert!(!node.is_asleep());
    assert!(height(&runner, sleeper) > frozen);
    assert!(
        max_height(&runner) - height(&runner, sleeper) <= 2,
        "heights: {:?}",
        runner.heights()
    );
    assert!(runner.verify_safety().is_ok());
}

#[test]
fn test_partitioned_node_recovers_after_heal() {
    let mut runner = runner(8);
    let cut = NodeId(3);
    runner.network_mut().isolate_node(cut);
    runner.start_all();
    runner.run_until(Duration::from_secs(3));

    assert_eq!(height(&runner, cut), 0);
    assert!(max_height(&runner) > 2);

    runner.network_mut().heal_all();
    runner.run_until(Duration::from_secs(10));

    let node = runner.node(cut).unwrap();
    assert!(node.sync_status().blocks_applied > 0);
    assert!(max_height(&runner) - height(&runner, cut) <= 2);
    assert!(runner.verify_safety().is_ok());
}

#[test]
fn test_sync_state_returns_to_idle() {
    let mut runner = runner(13);
    runner.start_all();
    runner.run_until(Duration::from_secs(2));

    for node in runner.nodes() {
        assert_eq!(node.sync_status().state, SyncStateKind::Idle);
    }
}
