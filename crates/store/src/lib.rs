//! Storage for the hashgraph: events, rounds, frames, blocks and peer sets.
//!
//! Two implementations share one [`Store`] trait: [`InmemStore`] keeps
//! everything in bounded LRU caches; [`RocksStore`] layers the same caches
//! over a RocksDB database with writes batched until [`Store::flush`] —
//! the commit boundary.
//!
//! Reads of unknown keys return [`StoreError::NotFound`], which is distinct
//! from an I/O failure: the former is an expected outcome of graph walks,
//! the latter is not.

mod inmem;
mod rocks;

pub use inmem::InmemStore;
pub use rocks::{init_store, RocksStore, DB_DIR_NAME};

use filament_types::{
    Block, Event, Frame, Hash, KnownEvents, Peer, PeerSet, Root, RoundInfo, TypesError,
};
use std::collections::HashMap;
use thiserror::Error;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The key does not exist. Expected during graph walks; not an I/O
    /// failure.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Db(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encode(#[from] bincode::Error),

    #[error(transparent)]
    Types(#[from] TypesError),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Db(e.to_string())
    }
}

/// Durable key→value storage of consensus entities.
///
/// The engine is the single writer; methods take `&mut self` throughout
/// (reads touch LRU recency too). Graph edges are hashes, so every walk
/// goes through `get_event`.
pub trait Store: Send {
    /// Capacity of the LRU caches.
    fn cache_size(&self) -> usize;

    // ── Events ────────────────────────────────────────────────────────────

    fn get_event(&mut self, hash: &Hash) -> Result<Event, StoreError>;

    fn has_event(&mut self, hash: &Hash) -> bool;

    /// Store an event. Extends the creator's index chain only when the
    /// event's index is the next contiguous one; duplicate indexes (forks)
    /// are stored by hash but do not displace the primary chain.
    fn set_event(&mut self, event: &Event) -> Result<(), StoreError>;

    /// Hash of the creator's event at `index` on the primary chain.
    fn participant_event(&mut self, creator: &str, index: i64) -> Result<Hash, StoreError>;

    /// Primary-chain hashes of `creator` with index greater than `after`,
    /// ascending.
    fn participant_events(&mut self, creator: &str, after: i64) -> Result<Vec<Hash>, StoreError>;

    /// Head of the creator's primary chain, if any event is known.
    fn last_event_from(&mut self, creator: &str) -> Result<Option<Hash>, StoreError>;

    /// Creator id → highest contiguous index (−1 for peers with no events).
    fn known_events(&mut self) -> KnownEvents;

    // ── Rounds ────────────────────────────────────────────────────────────

    fn get_round(&mut self, index: u64) -> Result<RoundInfo, StoreError>;

    fn set_round(&mut self, index: u64, round: &RoundInfo) -> Result<(), StoreError>;

    /// Highest round stored so far.
    fn last_round(&self) -> Option<u64>;

    /// Round of the latest decided frame.
    fn last_consensus_round(&self) -> Option<u64>;

    fn set_last_consensus_round(&mut self, round: u64) -> Result<(), StoreError>;

    // ── Frames and blocks ─────────────────────────────────────────────────

    fn get_frame(&mut self, round: u64) -> Result<Frame, StoreError>;

    fn set_frame(&mut self, frame: &Frame) -> Result<(), StoreError>;

    fn get_block(&mut self, index: u64) -> Result<Block, StoreError>;

    fn set_block(&mut self, block: &Block) -> Result<(), StoreError>;

    fn last_block_index(&self) -> Option<u64>;

    // ── Membership ────────────────────────────────────────────────────────

    /// The peer set active at `round`: the stored set with the greatest
    /// activation round ≤ `round`.
    fn get_peer_set(&mut self, round: u64) -> Result<PeerSet, StoreError>;

    /// Activate `peers` from `round` onwards. Creates roots for peers seen
    /// for the first time.
    fn set_peer_set(&mut self, round: u64, peers: &PeerSet) -> Result<(), StoreError>;

    /// Activation rounds of all stored peer sets, ascending.
    fn peer_set_activation_rounds(&self) -> Vec<u64>;

    /// Every peer that has ever been a member, by public key.
    fn repertoire(&self) -> HashMap<String, Peer>;

    // ── Roots ─────────────────────────────────────────────────────────────

    fn get_root(&mut self, creator: &str) -> Result<Root, StoreError>;

    fn set_root(&mut self, creator: &str, root: &Root) -> Result<(), StoreError>;

    // ── Maintenance ───────────────────────────────────────────────────────

    /// Durably persist everything written since the last flush. Called at
    /// commit boundaries; a no-op for the in-memory store.
    fn flush(&mut self) -> Result<(), StoreError>;

    /// Whether this store survives a restart.
    fn is_persistent(&self) -> bool;

    /// All stored events in an order that never yields a child before its
    /// parents. Used for bootstrap replay.
    fn topological_events(&mut self) -> Result<Vec<Event>, StoreError>;
}

/// Kahn-style parent-before-child ordering over a set of events.
///
/// Events whose parents are absent from the set are treated as roots of the
/// replay (their parents are assumed already applied).
pub(crate) fn sort_topologically(mut pending: Vec<Event>) -> Result<Vec<Event>, StoreError> {
    let mut present = std::collections::HashSet::new();
    for e in &pending {
        present.insert(e.hash()?);
    }

    let mut placed = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(pending.len());
    while !pending.is_empty() {
        let before = pending.len();
        let mut rest = Vec::new();
        for event in pending {
            let hash = event.hash()?;
            let parent_ready = |p: &Hash| !present.contains(p) || placed.contains(p);
            let ready = parent_ready(&event.body.self_parent)
                && event.body.other_parent.as_ref().map_or(true, parent_ready);
            if ready {
                placed.insert(hash);
                out.push(event);
            } else {
                rest.push(event);
            }
        }
        pending = rest;
        if pending.len() == before {
            // Parent cycle can only come from corrupt storage.
            return Err(StoreError::Db("event graph contains a cycle".into()));
        }
    }
    Ok(out)
}
