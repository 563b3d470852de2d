//! Chain storage.
//!
//! Each node owns exactly one [`ChainStore`]. Nodes never share or mutate
//! each other's chains; agreement happens only through messages, and the
//! store's append rules turn a disagreement into a [`ChainError::Conflict`]
//! that the engine reports as a fork.

mod chain;

pub use chain::{ChainError, ChainStore};
