//! Wire messages for the sync protocol.
//!
//! Four request/response exchanges: pull sync, eager (push) sync,
//! fast-forward, and join. Every message carries the sender's peer id for
//! accounting; authentication rests on the event signatures inside the
//! payloads, not on the transport.

mod request;
mod response;

pub use request::{EagerSyncRequest, FastForwardRequest, JoinRequest, Request, SyncRequest};
pub use response::{
    EagerSyncResponse, FastForwardResponse, JoinResponse, Response, SyncResponse,
};
