//! Committee-based PBFT consensus.
//!
//! This crate implements the consensus engine as a synchronous state machine:
//!
//! - [`ConsensusEngine`]: PrePrepare/Prepare/Commit/Committed handling, term
//!   entry via sortition, and the decryption hand-off
//! - View change (`ViewChange`/`NewView`) for leader replacement
//! - [`validation`]: validity predicates for every message kind
//! - [`FaultBehavior`]: pluggable misbehaviour at phase-entry points
//! - [`PayloadSource`]: block content for proposals
//!
//! # Quorums
//!
//! Every quorum is a byzantine majority (`2f + 1`) counted over the current
//! term's committee, never over the whole network.

mod config;
mod engine;
mod fault;
mod payload;
mod state;
pub mod validation;
mod view_change;
mod vote_set;

pub use config::BftConfig;
pub use engine::{ConsensusEngine, EngineStats};
pub use fault::{Conduct, FaultBehavior, FaultKind, Honest, Mute, SilentLeader};
pub use payload::{PayloadSource, RandomPayload};
pub use state::{PbftState, Progress};
pub use validation::ValidationError;
pub use vote_set::VoteSet;
