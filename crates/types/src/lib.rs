//! Core types for oa-pbft consensus.
//!
//! This crate provides the foundational types used throughout the testbed:
//!
//! - **Primitives**: Hash, NodeId, Term/View, NodeBitset
//! - **Committees**: CommitteeMap and the [`sortition`] function
//! - **Blocks**: EncryptedBlock, DecryptedBlock, BlockProof, BlockShare, Block
//! - **Messages**: ConsensusMessage, CryptoMessage, SyncMessage and their tags
//! - **Parameters**: ConsensusParams and byzantine-majority arithmetic
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend on
//! any other workspace crates, making it the foundation layer.

mod block;
mod committee;
mod hash;
mod identifiers;
mod message;
mod params;

pub use block::{Block, BlockProof, BlockShare, DecryptedBlock, EncryptedBlock};
pub use committee::{sortition, CommitteeMap};
pub use hash::{Hash, HexError};
pub use identifiers::{NodeBitset, NodeId, Term, View};
pub use message::{
    highest_proposal, Committed, ConsensusMessage, CryptoMessage, Message, MessageFamily,
    MessageTag, NewView, PrePrepare, Proposal, SyncMessage, TagError, ViewChange, Vote,
};
pub use params::{is_byz_maj, ConfigError, ConsensusParams};
