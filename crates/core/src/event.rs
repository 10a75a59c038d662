//! Input events for the node state machine.

use crate::RequestToken;
use filament_types::{
    Block, Event, Frame, InternalTransaction, InternalTransactionReceipt, KnownEvents, Peer,
};

/// All possible inputs to the node state machine.
///
/// Events are **passive data** — they describe something that happened.
/// The state machine processes events and returns actions.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════
    /// Gossip tick: start a sync exchange with the next peer.
    HeartbeatTimer,

    /// Join retry tick: re-send the join request or expire parked joins.
    JoinTimer,

    // ═══════════════════════════════════════════════════════════════════════
    // Inbound requests (carry a reply token the runner resolves)
    // ═══════════════════════════════════════════════════════════════════════
    /// A peer asks for the events it lacks.
    SyncRequestReceived {
        from: u32,
        known: KnownEvents,
        token: RequestToken,
    },

    /// A peer pushes events we lack.
    EagerSyncRequestReceived {
        from: u32,
        events: Vec<Event>,
        token: RequestToken,
    },

    /// A peer asks for our latest committed block, frame and snapshot.
    FastForwardRequestReceived { from: u32, token: RequestToken },

    /// A prospective validator asks to be added.
    JoinRequestReceived { peer: Peer, token: RequestToken },

    // ═══════════════════════════════════════════════════════════════════════
    // Outbound exchange completions (delivered by the runner)
    // ═══════════════════════════════════════════════════════════════════════
    /// Pull sync answered: events we lacked plus the remote's known vector.
    SyncResponseReceived {
        peer: u32,
        events: Vec<Event>,
        known: KnownEvents,
    },

    /// Push-back acknowledged; the exchange is complete.
    EagerSyncResponseReceived { peer: u32, success: bool },

    /// Fast-forward payload arrived.
    FastForwardResponseReceived {
        peer: u32,
        block: Block,
        frame: Frame,
        snapshot: Vec<u8>,
    },

    /// Join verdict arrived. `accepted_round` is the round at which the
    /// peer set containing us activates.
    JoinResponseReceived {
        accepted: bool,
        accepted_round: u64,
        peers: Vec<Peer>,
    },

    /// An outbound exchange failed (timeout, closed connection, codec).
    /// The attempt is abandoned; the node carries on.
    SyncFailed { peer: u32 },

    // ═══════════════════════════════════════════════════════════════════════
    // Application gateway
    // ═══════════════════════════════════════════════════════════════════════
    /// The application submitted a transaction.
    TransactionSubmitted { tx: Vec<u8> },

    /// A membership change was submitted locally.
    InternalTransactionSubmitted { tx: InternalTransaction },

    /// The application executed a committed block.
    ///
    /// Callback from [`crate::Action::CommitBlock`].
    CommitResponseReceived {
        block_index: u64,
        state_hash: Vec<u8>,
        receipts: Vec<InternalTransactionReceipt>,
    },

    /// The application restored a fast-sync snapshot.
    ///
    /// Callback from [`crate::Action::RestoreSnapshot`].
    SnapshotRestored { block_index: u64 },

    // ═══════════════════════════════════════════════════════════════════════
    // Operator controls
    // ═══════════════════════════════════════════════════════════════════════
    /// Leave Suspended and resume gossiping.
    ResumeRequested,

    /// Submit our own removal and shut down once it commits.
    LeaveRequested,

    /// Stop immediately.
    ShutdownRequested,
}

impl NodeEvent {
    /// Event type name for logging and telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeEvent::HeartbeatTimer => "HeartbeatTimer",
            NodeEvent::JoinTimer => "JoinTimer",
            NodeEvent::SyncRequestReceived { .. } => "SyncRequestReceived",
            NodeEvent::EagerSyncRequestReceived { .. } => "EagerSyncRequestReceived",
            NodeEvent::FastForwardRequestReceived { .. } => "FastForwardRequestReceived",
            NodeEvent::JoinRequestReceived { .. } => "JoinRequestReceived",
            NodeEvent::SyncResponseReceived { .. } => "SyncResponseReceived",
            NodeEvent::EagerSyncResponseReceived { .. } => "EagerSyncResponseReceived",
            NodeEvent::FastForwardResponseReceived { .. } => "FastForwardResponseReceived",
            NodeEvent::JoinResponseReceived { .. } => "JoinResponseReceived",
            NodeEvent::SyncFailed { .. } => "SyncFailed",
            NodeEvent::TransactionSubmitted { .. } => "TransactionSubmitted",
            NodeEvent::InternalTransactionSubmitted { .. } => "InternalTransactionSubmitted",
            NodeEvent::CommitResponseReceived { .. } => "CommitResponseReceived",
            NodeEvent::SnapshotRestored { .. } => "SnapshotRestored",
            NodeEvent::ResumeRequested => "ResumeRequested",
            NodeEvent::LeaveRequested => "LeaveRequested",
            NodeEvent::ShutdownRequested => "ShutdownRequested",
        }
    }
}
