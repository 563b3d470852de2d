//! Pluggable fault behaviour.
//!
//! One engine type runs every node; misbehaviour is injected through a
//! [`FaultBehavior`] consulted at each outbound protocol step. Returning
//! [`Conduct::Withhold`] suppresses the message but leaves local state
//! progressing as if it had been sent.

use oapbft_types::{Term, View};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Whether to carry out an outbound protocol step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conduct {
    Proceed,
    Withhold,
}

/// Hooks at phase-entry points. Every hook defaults to [`Conduct::Proceed`].
pub trait FaultBehavior: fmt::Debug + Send {
    /// Short name for logs and reports.
    fn name(&self) -> &'static str;

    /// About to propose a block (fresh PrePrepare or NewView takeover).
    /// Withholding skips the proposal entirely.
    fn on_propose(&mut self, _term: Term, _view: View) -> Conduct {
        Conduct::Proceed
    }

    /// Accepted a PrePrepare; about to send our Prepare.
    fn on_enter_pre_prepared(&mut self, _term: Term, _view: View) -> Conduct {
        Conduct::Proceed
    }

    /// Reached a prepare quorum; about to send our Commit.
    fn on_enter_prepared(&mut self, _term: Term, _view: View) -> Conduct {
        Conduct::Proceed
    }

    /// Reached a commit quorum; about to broadcast Committed.
    fn on_enter_committed(&mut self, _term: Term, _view: View) -> Conduct {
        Conduct::Proceed
    }

    /// Proposal expired; about to send a ViewChange for `view`.
    fn on_proposal_timeout(&mut self, _term: Term, _view: View) -> Conduct {
        Conduct::Proceed
    }
}

/// Follows the protocol.
#[derive(Debug, Default, Clone)]
pub struct Honest;

impl FaultBehavior for Honest {
    fn name(&self) -> &'static str {
        "honest"
    }
}

/// Never proposes when leader, optionally only in some terms.
#[derive(Debug, Default, Clone)]
pub struct SilentLeader {
    /// `None` means every term.
    pub terms: Option<BTreeSet<Term>>,
}

impl SilentLeader {
    pub fn always() -> Self {
        Self { terms: None }
    }

    pub fn in_terms(terms: impl IntoIterator<Item = Term>) -> Self {
        Self {
            terms: Some(terms.into_iter().collect()),
        }
    }

    fn is_silent(&self, term: Term) -> bool {
        self.terms.as_ref().map_or(true, |terms| terms.contains(&term))
    }
}

impl FaultBehavior for SilentLeader {
    fn name(&self) -> &'static str {
        "silent-leader"
    }

    fn on_propose(&mut self, term: Term, _view: View) -> Conduct {
        if self.is_silent(term) {
            Conduct::Withhold
        } else {
            Conduct::Proceed
        }
    }
}

/// Withholds every outbound consensus message.
#[derive(Debug, Default, Clone)]
pub struct Mute;

impl FaultBehavior for Mute {
    fn name(&self) -> &'static str {
        "mute"
    }

    fn on_propose(&mut self, _term: Term, _view: View) -> Conduct {
        Conduct::Withhold
    }

    fn on_enter_pre_prepared(&mut self, _term: Term, _view: View) -> Conduct {
        Conduct::Withhold
    }

    fn on_enter_prepared(&mut self, _term: Term, _view: View) -> Conduct {
        Conduct::Withhold
    }

    fn on_enter_committed(&mut self, _term: Term, _view: View) -> Conduct {
        Conduct::Withhold
    }

    fn on_proposal_timeout(&mut self, _term: Term, _view: View) -> Conduct {
        Conduct::Withhold
    }
}

/// Serializable fault selection, as written in scenario files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FaultKind {
    #[default]
    Honest,
    SilentLeader {
        #[serde(default)]
        terms: Option<BTreeSet<Term>>,
    },
    Mute,
}

impl FaultKind {
    pub fn into_behavior(self) -> Box<dyn FaultBehavior> {
        match self {
            FaultKind::Honest => Box::new(Honest),
            FaultKind::SilentLeader { terms } => Box::new(SilentLeader { terms }),
            FaultKind::Mute => Box::new(Mute),
        }
    }
}
