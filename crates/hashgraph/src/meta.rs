//! Per-event ancestry metadata.
//!
//! The coordinate vectors give O(1) answers to "does x see y": `x` sees `y`
//! when x's last ancestor by y's creator is at least y's index (and y's
//! creator has not forked at or below that index).

use filament_types::Hash;
use std::collections::BTreeMap;

/// Position of an event on its creator's chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Coord {
    pub index: i64,
    pub hash: Hash,
}

/// Everything the engine derives about an inserted event. Recomputed on
/// replay; never part of the signed body.
#[derive(Clone, Debug)]
pub struct EventMeta {
    pub hash: Hash,
    pub creator: String,
    pub creator_id: u32,
    pub index: i64,
    /// `None` when the self-parent is the creator's root.
    pub self_parent: Option<Hash>,
    pub other_parent: Option<Hash>,
    pub timestamp: i64,
    /// Global insertion sequence; parents always precede children.
    pub topo_index: u64,
    pub round: u64,
    pub witness: bool,
    pub round_received: Option<u64>,
    /// Per creator id: the latest ancestor by that creator.
    pub last_ancestors: BTreeMap<u32, Coord>,
    /// Per creator id: the earliest descendant by that creator.
    pub first_descendants: BTreeMap<u32, Coord>,
}
