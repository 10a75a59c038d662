//! Pending work awaiting inclusion in the next self-event.
//!
//! Three FIFO pools: opaque application transactions, internal
//! (membership) transactions, and our own block signatures. Access is
//! serialized by the node state machine, so plain collections suffice.

mod state;

pub use state::MempoolState;
