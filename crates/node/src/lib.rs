//! The Filament node: creator core and life-cycle state machine.
//!
//! [`Core`] owns the validator's signing key, the head of its self-parent
//! chain, the mempool and the hashgraph. [`NodeStateMachine`] wraps it in
//! the Babbling / CatchingUp / Joining / Leaving / Suspended / Shutdown
//! life cycle, translating [`filament_core::NodeEvent`]s into
//! [`filament_core::Action`]s for the runner to execute.

mod config;
mod core;
mod selector;
mod state;

pub use self::core::{BatchOutcome, Core};
pub use config::NodeConfig;
pub use selector::PeerSelector;
pub use state::NodeStateMachine;
