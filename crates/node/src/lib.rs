//! Combined node state machine.
//!
//! This crate composes the consensus engine and the syncer into a complete
//! oa-pbft node, and owns the start/sleep/wake lifecycle.

mod state;
mod syncer;

pub use state::NodeStateMachine;
pub use syncer::{SyncConfig, SyncStateKind, SyncStatus, Syncer};
