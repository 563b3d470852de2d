//! Timer identities and token-based lazy cancellation.
//!
//! The scheduler cannot remove queued events, so cancellation is soft: each
//! arming of a timer gets a fresh [`TimerToken`], and a firing is acted on
//! only if its token is still the current one for that [`TimerId`].

use crate::{Action, Event};
use std::collections::BTreeMap;
use std::time::Duration;

/// Timer identification for scheduled events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    /// View-1 leader's propose tick.
    Proposal,
    /// Proposal expiry for the current view (drives view change).
    ProposalExpiry,
    /// Sync request retry.
    SyncRetry,
    /// Wake from sleep.
    Wake,
}

impl TimerId {
    /// The event delivered when a timer with this id and token fires.
    pub fn into_event(self, token: TimerToken) -> Event {
        match self {
            TimerId::Proposal => Event::ProposalTimer { token },
            TimerId::ProposalExpiry => Event::ProposalExpired { token },
            TimerId::SyncRetry => Event::SyncRetry { token },
            TimerId::Wake => Event::WakeUp { token },
        }
    }
}

/// Generation counter identifying one arming of a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerToken(pub u64);

/// Per-owner registry of live timer tokens.
#[derive(Debug, Default, Clone)]
pub struct TimerSet {
    next: u64,
    current: BTreeMap<TimerId, TimerToken>,
}

impl TimerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `id`, superseding any outstanding arming.
    pub fn arm(&mut self, id: TimerId, duration: Duration) -> Action {
        self.next += 1;
        let token = TimerToken(self.next);
        self.current.insert(id, token);
        Action::SetTimer {
            id,
            token,
            duration,
        }
    }

    /// Forget the current arming of `id`; its firing will be ignored.
    pub fn cancel(&mut self, id: TimerId) {
        self.current.remove(&id);
    }

    /// Forget every outstanding timer.
    pub fn cancel_all(&mut self) {
        self.current.clear();
    }

    /// Whether `token` is the live arming of `id`.
    pub fn is_current(&self, id: TimerId, token: TimerToken) -> bool {
        self.current.get(&id) == Some(&token)
    }

    /// Whether `id` has a live arming.
    pub fn is_armed(&self, id: TimerId) -> bool {
        self.current.contains_key(&id)
    }

    /// Consume a firing. Returns `true` only for the live token.
    pub fn fire(&mut self, id: TimerId, token: TimerToken) -> bool {
        if self.is_current(id, token) {
            self.current.remove(&id);
            true
        } else {
            false
        }
    }
}
