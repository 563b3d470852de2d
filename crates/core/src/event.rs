//! Event types for the deterministic state machine.

use crate::TimerToken;
use oapbft_types::{Message, NodeId};
use std::time::Duration;

/// Priority levels for event ordering within the same timestamp.
///
/// Events at the same simulation time are processed in priority order.
/// Lower values = higher priority (processed first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    /// Timer events: scheduled by the node itself.
    Timer = 0,

    /// Network events: external inputs from other nodes.
    Network = 1,

    /// Client events: lifecycle commands from the harness.
    Client = 2,
}

impl EventPriority {
    /// Number of priority levels.
    pub const COUNT: usize = 3;
}

/// All possible events a node can receive.
///
/// Events are **passive data** - they describe something that happened.
/// The state machine processes events and returns actions.
#[derive(Debug, Clone)]
pub enum Event {
    // ═══════════════════════════════════════════════════════════════════════
    // Timers (priority: Timer)
    // ═══════════════════════════════════════════════════════════════════════
    /// Time for the view-1 leader to propose.
    ProposalTimer { token: TimerToken },

    /// No block was committed in time for the current view.
    ProposalExpired { token: TimerToken },

    /// A sync request went unanswered; try the next peer.
    SyncRetry { token: TimerToken },

    /// End of a sleep window.
    WakeUp { token: TimerToken },

    // ═══════════════════════════════════════════════════════════════════════
    // Network (priority: Network)
    // ═══════════════════════════════════════════════════════════════════════
    /// A message arrived from another node.
    MessageReceived { from: NodeId, message: Message },

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle (priority: Client)
    // ═══════════════════════════════════════════════════════════════════════
    /// Boot the node. Events delivered before this are dropped.
    Start,

    /// Simulated crash: drop everything for `duration`, then resync.
    Sleep { duration: Duration },
}

impl Event {
    /// Get the priority for this event type.
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::ProposalTimer { .. }
            | Event::ProposalExpired { .. }
            | Event::SyncRetry { .. }
            | Event::WakeUp { .. } => EventPriority::Timer,

            Event::MessageReceived { .. } => EventPriority::Network,

            Event::Start | Event::Sleep { .. } => EventPriority::Client,
        }
    }

    /// Get the event type name for tracing.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::ProposalTimer { .. } => "ProposalTimer",
            Event::ProposalExpired { .. } => "ProposalExpired",
            Event::SyncRetry { .. } => "SyncRetry",
            Event::WakeUp { .. } => "WakeUp",
            Event::MessageReceived { message, .. } => message.type_name(),
            Event::Start => "Start",
            Event::Sleep { .. } => "Sleep",
        }
    }
}
