//! The state machine trait.

use crate::{Action, NodeEvent};
use std::time::Duration;

/// A synchronous, single-writer state machine.
///
/// The runner calls [`StateMachine::set_time`] with the wall clock (duration
/// since the unix epoch) before delivering each event, so the machine never
/// reads the clock itself.
pub trait StateMachine {
    /// Process one event and return the actions it provokes.
    fn handle(&mut self, event: NodeEvent) -> Vec<Action>;

    /// Advance the machine's notion of now.
    fn set_time(&mut self, now: Duration);

    /// The machine's notion of now.
    fn now(&self) -> Duration;
}
