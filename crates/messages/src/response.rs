//! Response messages.

use filament_types::{Block, Event, Frame, KnownEvents, Peer};
use serde::{Deserialize, Serialize};

/// Events the requester lacks (bounded by the sync limit) plus the
/// responder's own known vector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub from_id: u32,
    pub events: Vec<Event>,
    pub known: KnownEvents,
}

/// Acknowledgement of a pushed batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EagerSyncResponse {
    pub from_id: u32,
    pub success: bool,
    pub known: KnownEvents,
}

/// The most recent committed block, its frame, and the application snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FastForwardResponse {
    pub from_id: u32,
    pub block: Block,
    pub frame: Frame,
    pub snapshot: Vec<u8>,
}

/// Verdict on a join proposal. On acceptance, `peers` is the set that
/// includes the joiner and `accepted_round` the round it activates at.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JoinResponse {
    pub from_id: u32,
    pub accepted: bool,
    pub accepted_round: u64,
    pub peers: Vec<Peer>,
}

/// Union of responses, mirroring [`crate::Request`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Sync(SyncResponse),
    EagerSync(EagerSyncResponse),
    FastForward(FastForwardResponse),
    Join(JoinResponse),
    /// The responder could not serve the request (suspended, catching up, or
    /// internal failure). The requester abandons the attempt.
    Unavailable(String),
}

impl Response {
    pub fn kind(&self) -> &'static str {
        match self {
            Response::Sync(_) => "sync",
            Response::EagerSync(_) => "eager_sync",
            Response::FastForward(_) => "fast_forward",
            Response::Join(_) => "join",
            Response::Unavailable(_) => "unavailable",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Request, SyncRequest};
    use filament_types::KnownEvents;

    #[test]
    fn request_round_trip() {
        let mut known = KnownEvents::new();
        known.insert(0, 4);
        known.insert(2, -1);

        let req = Request::Sync(SyncRequest { from_id: 1, known });
        let bytes = bincode::serialize(&req).unwrap();
        let decoded: Request = bincode::deserialize(&bytes).unwrap();
        assert_eq!(req, decoded);
        assert_eq!(decoded.kind(), "sync");
    }

    #[test]
    fn response_round_trip() {
        let resp = Response::EagerSync(EagerSyncResponse {
            from_id: 2,
            success: true,
            known: KnownEvents::new(),
        });
        let bytes = bincode::serialize(&resp).unwrap();
        let decoded: Response = bincode::deserialize(&bytes).unwrap();
        assert_eq!(resp, decoded);
    }
}
