//! Output actions of the node state machine.

use crate::{NodeState, RequestToken, TimerId};
use filament_messages::Response;
use filament_types::{Block, Event, Frame, KnownEvents, Peer};
use std::time::Duration;

/// Actions the state machine wants performed.
///
/// Actions are **commands** — the runner executes them and feeds any results
/// back in as [`crate::NodeEvent`]s.
#[derive(Debug, Clone)]
pub enum Action {
    // ═══════════════════════════════════════════════════════════════════════
    // Outbound requests
    // ═══════════════════════════════════════════════════════════════════════
    /// Open a pull-sync exchange with `to`.
    ///
    /// Returns `NodeEvent::SyncResponseReceived` or `NodeEvent::SyncFailed`.
    SendSyncRequest { to: Peer, known: KnownEvents },

    /// Push `events` to `to` after a pull completes.
    ///
    /// Returns `NodeEvent::EagerSyncResponseReceived` or `SyncFailed`.
    SendEagerSyncRequest { to: Peer, events: Vec<Event> },

    /// Ask `to` for its latest committed block, frame and snapshot.
    ///
    /// Returns `NodeEvent::FastForwardResponseReceived` or `SyncFailed`.
    SendFastForwardRequest { to: Peer },

    /// Propose ourselves (`peer`) for membership via `to`.
    ///
    /// Returns `NodeEvent::JoinResponseReceived` or `SyncFailed`. The join
    /// deadline is enforced by the runner's join timeout, not the sync one.
    SendJoinRequest { to: Peer, peer: Peer },

    // ═══════════════════════════════════════════════════════════════════════
    // Replies to inbound requests
    // ═══════════════════════════════════════════════════════════════════════
    /// Resolve an inbound request with `response`.
    Reply {
        token: RequestToken,
        response: Response,
    },

    /// Resolve an inbound fast-forward request. The runner attaches the
    /// application snapshot for `block`'s index before replying.
    ReplyFastForward {
        token: RequestToken,
        from_id: u32,
        block: Block,
        frame: Frame,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════
    /// (Re)arm a timer. An existing timer with the same id is replaced.
    SetTimer { id: TimerId, duration: Duration },

    /// Cancel a timer; no-op if it is not armed.
    CancelTimer { id: TimerId },

    // ═══════════════════════════════════════════════════════════════════════
    // Application gateway
    // ═══════════════════════════════════════════════════════════════════════
    /// Hand a freshly decided block to the application.
    ///
    /// Returns `NodeEvent::CommitResponseReceived`.
    CommitBlock { block: Block },

    /// Restore the application from a fast-sync snapshot.
    ///
    /// Returns `NodeEvent::SnapshotRestored`.
    RestoreSnapshot { block_index: u64, snapshot: Vec<u8> },

    /// Observer hook for state transitions.
    NotifyStateChanged { state: NodeState },

    // ═══════════════════════════════════════════════════════════════════════
    // Life cycle
    // ═══════════════════════════════════════════════════════════════════════
    /// Tear down the runner; the state machine is in `Shutdown`.
    Shutdown,
}

impl Action {
    /// Action type name for logging and telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::SendSyncRequest { .. } => "SendSyncRequest",
            Action::SendEagerSyncRequest { .. } => "SendEagerSyncRequest",
            Action::SendFastForwardRequest { .. } => "SendFastForwardRequest",
            Action::SendJoinRequest { .. } => "SendJoinRequest",
            Action::Reply { .. } => "Reply",
            Action::ReplyFastForward { .. } => "ReplyFastForward",
            Action::SetTimer { .. } => "SetTimer",
            Action::CancelTimer { .. } => "CancelTimer",
            Action::CommitBlock { .. } => "CommitBlock",
            Action::RestoreSnapshot { .. } => "RestoreSnapshot",
            Action::NotifyStateChanged { .. } => "NotifyStateChanged",
            Action::Shutdown => "Shutdown",
        }
    }
}
