//! Action types returned by state machines.

use crate::{TimerId, TimerToken};
use oapbft_types::{Hash, Message, NodeId, Term};
use std::time::Duration;

/// All possible outputs from a state machine.
///
/// Actions are **commands** - they describe something to do. The runner
/// executes them; the state machine never touches the network or the clock.
#[derive(Debug, Clone)]
pub enum Action {
    // ═══════════════════════════════════════════════════════════════════════
    // Network
    // ═══════════════════════════════════════════════════════════════════════
    /// Send to a single node.
    Unicast { to: NodeId, message: Message },

    /// Send to a set of nodes (normally the committee, minus self).
    Multicast { to: Vec<NodeId>, message: Message },

    /// Send to every other node.
    Broadcast { message: Message },

    /// Gossip relay to every neighbour. Each node relays a given block at
    /// most once; the at-most-once check lives in the sender, not here.
    Fastcast { message: Message },

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════
    /// Schedule a timer. There is no cancel: a later `SetTimer` for the same
    /// id supersedes the token, and stale firings are dropped on arrival.
    SetTimer {
        id: TimerId,
        token: TimerToken,
        duration: Duration,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Node-internal
    // ═══════════════════════════════════════════════════════════════════════
    /// The engine saw a message from a term past `local + 1`.
    /// Intercepted by the node, which hands it to the syncer.
    StartSync { observed_term: Term },

    /// A block conflicting with an already-closed term was produced.
    ForkDetected {
        term: Term,
        local: Hash,
        incoming: Hash,
    },
}

impl Action {
    /// Get the action type name for tracing.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::Unicast { .. } => "Unicast",
            Action::Multicast { .. } => "Multicast",
            Action::Broadcast { .. } => "Broadcast",
            Action::Fastcast { .. } => "Fastcast",
            Action::SetTimer { .. } => "SetTimer",
            Action::StartSync { .. } => "StartSync",
            Action::ForkDetected { .. } => "ForkDetected",
        }
    }
}
