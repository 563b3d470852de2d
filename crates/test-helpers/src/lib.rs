//! Test helpers for the oa-pbft testbed.
//!
//! Builders for data that passes every validity check ([`fixtures`]) and
//! single-defect variants of it that must be rejected ([`byzantine`]).
//! Everything here is derived from genesis through the real sortition, so
//! fixtures line up with what live engines compute.
//!
//! # Example
//!
//! ```rust
//! use oapbft_test_helpers::{fixtures, byzantine};
//! use oapbft_types::ConsensusParams;
//!
//! let params = ConsensusParams::new(4, 4, 1, 2).unwrap();
//! let chain = fixtures::build_chain(&params, 3);
//! assert_eq!(chain.len(), 3);
//! assert!(chain[1].encrypted.extends(&chain[0]));
//!
//! let forged = byzantine::tampered_content(&chain[2].encrypted);
//! assert!(!forged.has_valid_hash());
//! ```

pub mod byzantine;
pub mod fixtures;
