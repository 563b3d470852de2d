//! Protocol messages.
//!
//! Messages are grouped into families, one sum type each. Every variant
//! carries exactly the fields it needs. The network boundary routes on the
//! family; logging and statistics use the `"<Type>/<Subtype>"` tag.

use crate::{Block, BlockProof, BlockShare, EncryptedBlock, Hash, NodeId, Term, View};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════════
// Consensus
// ═══════════════════════════════════════════════════════════════════════════

/// Leader's proposal for a view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrePrepare {
    pub term: Term,
    pub view: View,
    pub sender: NodeId,
    pub block: EncryptedBlock,
}

/// Prepare or Commit vote for a block in a view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub term: Term,
    pub view: View,
    pub sender: NodeId,
    pub block_hash: Hash,
}

/// Certificate that a block has been committed, with the full block.
///
/// Carries everything needed for fast-path validation by a node with no
/// state for the term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Committed {
    pub term: Term,
    pub view: View,
    pub sender: NodeId,
    pub block: EncryptedBlock,
    pub proof: BlockProof,
}

/// Locked candidate carried through a view change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    /// View in which `block` was prepared.
    pub view: View,
    pub block: EncryptedBlock,
    /// Prepare votes proving the byzantine majority.
    pub prepares: Vec<Vote>,
}

/// Request to move to `view`, sent to that view's leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChange {
    pub term: Term,
    /// Target view.
    pub view: View,
    pub sender: NodeId,
    pub proposal: Option<Proposal>,
}

/// New leader's takeover: view-change evidence plus the derived PrePrepare.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewView {
    pub term: Term,
    pub view: View,
    pub sender: NodeId,
    pub view_changes: Vec<ViewChange>,
    pub pre_prepare: PrePrepare,
}

impl NewView {
    /// Highest-view proposal among the embedded view changes.
    ///
    /// Ties keep the first occurrence, so callers must pass view changes in
    /// a deterministic order.
    pub fn highest_proposal(&self) -> Option<&Proposal> {
        highest_proposal(&self.view_changes)
    }
}

/// Highest-view proposal among a set of view changes.
pub fn highest_proposal(view_changes: &[ViewChange]) -> Option<&Proposal> {
    let mut best: Option<&Proposal> = None;
    for proposal in view_changes.iter().filter_map(|vc| vc.proposal.as_ref()) {
        if best.map_or(true, |b| proposal.view > b.view) {
            best = Some(proposal);
        }
    }
    best
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusMessage {
    PrePrepare(PrePrepare),
    Prepare(Vote),
    Commit(Vote),
    Committed(Committed),
    ViewChange(ViewChange),
    NewView(Box<NewView>),
}

impl ConsensusMessage {
    pub fn term(&self) -> Term {
        match self {
            ConsensusMessage::PrePrepare(m) => m.term,
            ConsensusMessage::Prepare(v) | ConsensusMessage::Commit(v) => v.term,
            ConsensusMessage::Committed(m) => m.term,
            ConsensusMessage::ViewChange(m) => m.term,
            ConsensusMessage::NewView(m) => m.term,
        }
    }

    pub fn view(&self) -> View {
        match self {
            ConsensusMessage::PrePrepare(m) => m.view,
            ConsensusMessage::Prepare(v) | ConsensusMessage::Commit(v) => v.view,
            ConsensusMessage::Committed(m) => m.view,
            ConsensusMessage::ViewChange(m) => m.view,
            ConsensusMessage::NewView(m) => m.view,
        }
    }

    pub fn sender(&self) -> NodeId {
        match self {
            ConsensusMessage::PrePrepare(m) => m.sender,
            ConsensusMessage::Prepare(v) | ConsensusMessage::Commit(v) => v.sender,
            ConsensusMessage::Committed(m) => m.sender,
            ConsensusMessage::ViewChange(m) => m.sender,
            ConsensusMessage::NewView(m) => m.sender,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ConsensusMessage::PrePrepare(_) => "PrePrepare",
            ConsensusMessage::Prepare(_) => "Prepare",
            ConsensusMessage::Commit(_) => "Commit",
            ConsensusMessage::Committed(_) => "Committed",
            ConsensusMessage::ViewChange(_) => "ViewChange",
            ConsensusMessage::NewView(_) => "NewView",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Crypto
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CryptoMessage {
    BlockShare(BlockShare),
}

impl CryptoMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            CryptoMessage::BlockShare(_) => "BlockShare",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Sync
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Ask for every block after `term`.
    RequestSync { sender: NodeId, term: Term },
    /// Blocks in ascending term order. Empty if the responder has nothing newer.
    SyncPeer { sender: NodeId, blocks: Vec<Block> },
}

impl SyncMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            SyncMessage::RequestSync { .. } => "RequestSync",
            SyncMessage::SyncPeer { .. } => "SyncPeer",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Envelope and tags
// ═══════════════════════════════════════════════════════════════════════════

/// Any message carried by the network boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Consensus(ConsensusMessage),
    Crypto(CryptoMessage),
    Sync(SyncMessage),
}

impl Message {
    pub fn family(&self) -> MessageFamily {
        match self {
            Message::Consensus(_) => MessageFamily::Consensus,
            Message::Crypto(_) => MessageFamily::Crypto,
            Message::Sync(_) => MessageFamily::Sync,
        }
    }

    /// Subtype name within the family.
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Consensus(m) => m.type_name(),
            Message::Crypto(m) => m.type_name(),
            Message::Sync(m) => m.type_name(),
        }
    }

    pub fn tag(&self) -> MessageTag {
        MessageTag {
            family: self.family(),
            subtype: self.type_name().to_string(),
        }
    }
}

impl From<ConsensusMessage> for Message {
    fn from(msg: ConsensusMessage) -> Self {
        Message::Consensus(msg)
    }
}

impl From<CryptoMessage> for Message {
    fn from(msg: CryptoMessage) -> Self {
        Message::Crypto(msg)
    }
}

impl From<SyncMessage> for Message {
    fn from(msg: SyncMessage) -> Self {
        Message::Sync(msg)
    }
}

/// Top-level message family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageFamily {
    Consensus,
    Crypto,
    Sync,
}

impl MessageFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageFamily::Consensus => "ConsensusMessage",
            MessageFamily::Crypto => "CryptoMessage",
            MessageFamily::Sync => "SyncMessage",
        }
    }
}

/// Parsed `"<Type>/<Subtype>"` message tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageTag {
    pub family: MessageFamily,
    pub subtype: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TagError {
    #[error("message tag {0:?} is not of the form <Type>/<Subtype>")]
    Malformed(String),

    #[error("unknown message type {0:?}")]
    UnknownFamily(String),
}

impl FromStr for MessageTag {
    type Err = TagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (family, subtype) = s
            .split_once('/')
            .filter(|(f, sub)| !f.is_empty() && !sub.is_empty())
            .ok_or_else(|| TagError::Malformed(s.to_string()))?;

        let family = match family {
            "ConsensusMessage" => MessageFamily::Consensus,
            "CryptoMessage" => MessageFamily::Crypto,
            "SyncMessage" => MessageFamily::Sync,
            other => return Err(TagError::UnknownFamily(other.to_string())),
        };

        Ok(MessageTag {
            family,
            subtype: subtype.to_string(),
        })
    }
}

impl fmt::Display for MessageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.family.as_str(), self.subtype)
    }
}
