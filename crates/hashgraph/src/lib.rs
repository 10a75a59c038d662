//! The hashgraph consensus engine.
//!
//! This crate implements virtual voting over the event DAG:
//!
//! - `Hashgraph::insert_event` → signature and parent checks, round
//!   assignment, witness determination
//! - `Hashgraph::run_consensus` → fame voting, decided rounds,
//!   round-received assignment, frames and blocks
//! - `Hashgraph::add_block_signature` → the gossiped block-signature pool
//!   and certificate completion
//! - `Hashgraph::reset_from_frame` → fast-sync installation
//!
//! The engine is synchronous and performs no I/O beyond the [`Store`] it
//! owns. Round assignment and fame are deterministic functions of the final
//! ancestor set, so concurrent sync exchanges may interleave insertions in
//! any parent-before-child order without affecting the outcome.
//!
//! # Terminology
//!
//! - **Witness**: first event of a creator in a round.
//! - **Famous**: a witness seen by a supermajority of next-round witnesses,
//!   as established by the virtual vote.
//! - **Round received**: the earliest round whose famous witnesses all
//!   descend from the event; assigned exactly once.
//! - **Strongly sees**: sees through events of a supermajority of peers.

mod engine;
mod meta;

pub use engine::{Hashgraph, HashgraphConfig, HashgraphStats, COIN_ROUND_INTERVAL};
pub use meta::{Coord, EventMeta};

use filament_store::StoreError;
use filament_types::{Hash, TypesError};
use thiserror::Error;

/// Errors from DAG insertion and consensus.
#[derive(Debug, Error)]
pub enum HashgraphError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Types(#[from] TypesError),

    #[error("invalid signature on event {0:?}")]
    InvalidSignature(Hash),

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("event {0:?} already inserted")]
    DuplicateEvent(Hash),

    /// The event equivocates (same creator and index as another event).
    /// It has still been stored and flagged; the creator is excluded from
    /// seeing. Never fatal.
    #[error("equivocation by {creator} at index {index}")]
    EquivocationDetected {
        creator: String,
        index: i64,
        event: Hash,
    },

    #[error("creator {0} is not in the repertoire")]
    PeerUnknown(String),

    #[error("suspended: {undecided} undecided events exceed the limit of {limit}")]
    Suspended { undecided: usize, limit: usize },

    /// The counterparty is more than `limit` events ahead and event replay
    /// cannot catch up; the node should fast-sync instead.
    #[error("more than {limit} events behind; event replay cannot catch up")]
    TooBehind { limit: usize },
}

impl HashgraphError {
    /// Whether an inbound batch should simply skip this event and continue.
    pub fn is_skippable(&self) -> bool {
        matches!(
            self,
            HashgraphError::DuplicateEvent(_)
                | HashgraphError::InvalidSignature(_)
                | HashgraphError::InvalidEvent(_)
                | HashgraphError::PeerUnknown(_)
                | HashgraphError::EquivocationDetected { .. }
        )
    }
}
