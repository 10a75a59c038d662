//! Core types for the Filament node.
//!
//! This crate provides the substrate of the architecture:
//!
//! - [`NodeEvent`]: All possible inputs to the state machine
//! - [`Action`]: All possible outputs from the state machine
//! - [`StateMachine`]: The trait the node state machine implements
//!
//! # Architecture
//!
//! The node is built on a simple event-driven model:
//!
//! ```text
//! NodeEvents → StateMachine::handle() → Actions
//! ```
//!
//! The state machine is:
//! - **Synchronous**: No async, no .await
//! - **Single-writer**: It owns the hashgraph and the store; nothing else
//!   mutates them
//!
//! All network and application I/O is handled by the runner, which delivers
//! events, executes the returned actions, and converts their results back
//! into events.

mod action;
mod event;
mod traits;

pub use action::Action;
pub use event::NodeEvent;
pub use traits::StateMachine;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Correlation token tying an inbound request to the reply the runner owes
/// the remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestToken(pub u64);

/// Timer identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Gossip tick; fast when there is something to gossip, slow when idle.
    Heartbeat,
    /// Join retry / expiry tick, active only while Joining.
    Join,
}

/// Life-cycle states of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Normal operation: gossiping, inserting, committing.
    Babbling,
    /// Fast-sync in progress; no self-events, no transactions accepted.
    CatchingUp,
    /// Waiting for our own membership proposal to commit.
    Joining,
    /// Waiting for our own removal to commit before shutting down.
    Leaving,
    /// No sync, no event creation; exit only via explicit resume.
    Suspended,
    /// Terminal.
    Shutdown,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Babbling => "Babbling",
            NodeState::CatchingUp => "CatchingUp",
            NodeState::Joining => "Joining",
            NodeState::Leaving => "Leaving",
            NodeState::Suspended => "Suspended",
            NodeState::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}
