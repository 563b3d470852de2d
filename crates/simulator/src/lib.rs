//! oa-pbft Simulator
//!
//! Runs a scenario on top of `oapbft-simulation` and summarizes the result.
//!
//! # Example
//!
//! ```ignore
//! use oapbft_simulator::{run, Scenario};
//!
//! let scenario = Scenario::load("scenarios/leader_failure.toml")?;
//! let report = run(&scenario)?;
//! report.print_summary();
//! ```

mod report;
mod scenario;

pub use report::{run, NodeReport, Report};
pub use scenario::{
    BftSection, FaultAssignment, LateStart, NetworkSection, ParamsSection, Scenario,
    ScenarioError, SleepWindow, SyncSection,
};
