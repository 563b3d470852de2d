//! Running a scenario and summarizing it.

use crate::scenario::{Scenario, ScenarioError};
use oapbft_node::SyncStateKind;
use oapbft_simulation::{SafetyViolation, SimulationRunner, SimulationStats};
use oapbft_types::{NodeId, Term, View};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::info;

/// Per-node outcome.
#[derive(Debug, Clone)]
pub struct NodeReport {
    pub node: NodeId,
    pub fault: &'static str,
    /// Highest closed term.
    pub height: Term,
    pub term: Term,
    pub view: View,
    pub proposals: u64,
    pub view_changes: u64,
    pub terms_closed: u64,
    pub blocks_synced: u64,
    pub rejected_messages: u64,
    pub sync_state: SyncStateKind,
}

/// Outcome of one scenario run.
#[derive(Debug, Clone)]
pub struct Report {
    pub seed: u64,
    pub duration: Duration,
    pub nodes: Vec<NodeReport>,
    pub stats: SimulationStats,
    /// Message tags by delivered bytes, heaviest first.
    pub traffic: Vec<(String, u64, u64)>,
    pub safety: Result<(), SafetyViolation>,
}

impl Report {
    pub fn min_height(&self) -> Term {
        self.nodes.iter().map(|n| n.height).min().unwrap_or(0)
    }

    pub fn max_height(&self) -> Term {
        self.nodes.iter().map(|n| n.height).max().unwrap_or(0)
    }

    pub fn is_safe(&self) -> bool {
        self.safety.is_ok()
    }

    pub fn print_summary(&self) {
        println!("\n=== oa-pbft simulation ===");
        println!(
            "seed {}  duration {:.1}s  events {}",
            self.seed,
            self.duration.as_secs_f64(),
            self.stats.events_processed
        );

        println!("\n--- Nodes ---");
        println!(
            "{:<6} {:<14} {:>6} {:>6} {:>5} {:>9} {:>8} {:>7} {:>8} {:>8}",
            "node", "fault", "height", "term", "view", "proposals", "vchanges", "synced", "rejected",
            "sync"
        );
        for node in &self.nodes {
            println!(
                "{:<6} {:<14} {:>6} {:>6} {:>5} {:>9} {:>8} {:>7} {:>8} {:>8}",
                node.node.to_string(),
                node.fault,
                node.height,
                node.term,
                node.view,
                node.proposals,
                node.view_changes,
                node.blocks_synced,
                node.rejected_messages,
                node.sync_state.as_str()
            );
        }

        println!("\n--- Network ---");
        println!(
            "sent {}  dropped {} (partition {}, loss {})  delivery {:.1}%  bytes {}",
            self.stats.messages_sent,
            self.stats.messages_dropped(),
            self.stats.messages_dropped_partition,
            self.stats.messages_dropped_loss,
            self.stats.delivery_rate() * 100.0,
            self.stats.bytes_sent
        );
        for (tag, count, bytes) in &self.traffic {
            println!("  {tag:<28} {count:>8} msgs {bytes:>12} bytes");
        }

        println!("\n--- Safety ---");
        match &self.safety {
            Ok(()) => println!("OK: all closed terms agree across nodes"),
            Err(violation) => println!("VIOLATION: {violation}"),
        }
    }
}

/// Build the runner for `scenario`, run it to completion and report.
pub fn run(scenario: &Scenario) -> Result<Report, ScenarioError> {
    let config = scenario.simulation_config()?;
    let num_nodes = config.params.num_nodes;
    let mut runner = SimulationRunner::new(config, scenario.seed)?;

    for assignment in &scenario.faults {
        let node = scenario.node_id(assignment.node)?;
        runner.set_fault_behavior(node, assignment.fault.clone().into_behavior());
    }

    let late: BTreeSet<u64> = scenario.late_starts.iter().map(|s| s.node).collect();
    for node in NodeId::all(num_nodes).filter(|n| !late.contains(&n.0)) {
        runner.start_node(node, Duration::ZERO);
    }
    for start in &scenario.late_starts {
        runner.start_node(
            scenario.node_id(start.node)?,
            Duration::from_millis(start.at_ms),
        );
    }
    for sleep in &scenario.sleeps {
        runner.sleep_node(
            scenario.node_id(sleep.node)?,
            Duration::from_millis(sleep.at_ms),
            Duration::from_millis(sleep.duration_ms),
        );
    }

    info!(
        num_nodes,
        faults = scenario.faults.len(),
        late_starts = scenario.late_starts.len(),
        sleeps = scenario.sleeps.len(),
        "Running scenario"
    );
    runner.run_until(scenario.duration());

    let nodes = runner
        .nodes()
        .map(|sm| {
            let engine = sm.engine();
            let stats = engine.stats();
            NodeReport {
                node: sm.node(),
                fault: engine.fault_name(),
                height: sm.chain().highest_term(),
                term: engine.term(),
                view: engine.view(),
                proposals: stats.proposals,
                view_changes: stats.view_changes,
                terms_closed: stats.terms_closed,
                blocks_synced: stats.blocks_synced,
                rejected_messages: stats.rejected_messages,
                sync_state: sm.sync_status().state,
            }
        })
        .collect();

    let traffic = runner
        .traffic()
        .by_bandwidth()
        .into_iter()
        .map(|(tag, stats)| (tag.to_string(), stats.count, stats.bytes))
        .collect();

    let report = Report {
        seed: scenario.seed,
        duration: scenario.duration(),
        nodes,
        stats: runner.stats().clone(),
        traffic,
        safety: runner.verify_safety(),
    };

    info!(
        min_height = report.min_height(),
        max_height = report.max_height(),
        safe = report.is_safe(),
        "Scenario finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_scenario_makes_progress() {
        let scenario = Scenario {
            duration_ms: 5_000,
            ..Scenario::default()
        };
        let report = run(&scenario).unwrap();

        assert_eq!(report.nodes.len(), 4);
        assert!(report.min_height() > 0);
        assert!(report.is_safe());
    }

    #[test]
    fn test_late_start_is_honoured() {
        let scenario = Scenario::parse(
            r#"
            duration_ms = 1000

            [[late_starts]]
            node = 4
            at_ms = 5000
            "#,
        )
        .unwrap();
        let report = run(&scenario).unwrap();

        let late = &report.nodes[3];
        assert_eq!(late.height, 0);
        assert_eq!(late.term, 0);
    }

    #[test]
    fn test_mute_node_is_reported() {
        let scenario = Scenario::parse(
            r#"
            duration_ms = 2000

            [[faults]]
            node = 1
            fault = { kind = "mute" }
            "#,
        )
        .unwrap();
        let report = run(&scenario).unwrap();

        assert_eq!(report.nodes[0].fault, "mute");
        assert!(report.is_safe());
    }
}
