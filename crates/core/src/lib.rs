//! Core types for oa-pbft nodes.
//!
//! This crate provides the foundational types for the node architecture:
//!
//! - [`Event`]: All possible inputs to a node
//! - [`Action`]: All possible outputs from a node
//! - [`EventPriority`]: Ordering priority for events at the same timestamp
//! - [`TimerSet`]: Token-based timers with lazy cancellation
//! - [`StateMachine`]: The trait that every node implements
//!
//! # Architecture
//!
//! ```text
//! Event → StateMachine::handle() → Vec<Action> → runner → scheduled Events
//! ```
//!
//! The state machine is:
//! - **Synchronous**: No async, no .await
//! - **Deterministic**: Same state + event = same actions
//! - **Pure-ish**: Mutates self, but performs no I/O
//!
//! All I/O is handled by the runner which:
//! 1. Delivers events to the node in timestamp order
//! 2. Executes the returned actions (message sends, timers)
//! 3. Converts message sends and timers back into future events

mod action;
mod event;
mod timer;
mod traits;

pub use action::Action;
pub use event::{Event, EventPriority};
pub use timer::{TimerId, TimerSet, TimerToken};
pub use traits::StateMachine;
