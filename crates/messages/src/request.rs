//! Request messages.

use filament_types::{Event, KnownEvents, Peer};
use serde::{Deserialize, Serialize};

/// Pull sync: "here is what I know, send me what I lack".
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub from_id: u32,
    pub known: KnownEvents,
}

/// Push sync: "here is what you lack", sent back after a pull completes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EagerSyncRequest {
    pub from_id: u32,
    pub events: Vec<Event>,
}

/// Snapshot catch-up for a node too far behind for event replay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FastForwardRequest {
    pub from_id: u32,
}

/// Membership proposal: the sender asks to be added as `peer`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub peer: Peer,
}

/// Union of the four request kinds, as framed on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Sync(SyncRequest),
    EagerSync(EagerSyncRequest),
    FastForward(FastForwardRequest),
    Join(JoinRequest),
}

impl Request {
    /// Message kind name for logging and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Sync(_) => "sync",
            Request::EagerSync(_) => "eager_sync",
            Request::FastForward(_) => "fast_forward",
            Request::Join(_) => "join",
        }
    }
}
