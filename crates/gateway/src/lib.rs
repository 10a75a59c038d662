//! The application gateway: the narrow capability interface between
//! consensus and the application.
//!
//! The engine is application-agnostic: transactions are opaque bytes that
//! enter through the submit channel and come back out in committed blocks.
//! Alternative gateways (socket-bridged, in-process) supply the same five
//! operations; [`InmemGateway`] is the in-memory dummy used by tests and
//! the standalone binary.

mod inmem;

pub use inmem::InmemGateway;

use filament_core::NodeState;
use filament_types::{Block, InternalTransactionReceipt};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("application error: {0}")]
    App(String),

    #[error("no snapshot for block {0}")]
    NoSnapshot(u64),
}

/// What the application reports after executing a block.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitResponse {
    /// Post-execution state digest, recorded in the block body.
    pub state_hash: Vec<u8>,
    /// Accept/reject verdicts for the block's internal transactions.
    pub receipts: Vec<InternalTransactionReceipt>,
}

/// Capability interface provided by the application.
///
/// Methods are synchronous; the runner invokes the potentially slow ones
/// (`commit_block`, `restore`) off the controller task.
pub trait AppGateway: Send + Sync {
    /// The stream of transactions produced by the application. The runner
    /// takes it exactly once; subsequent calls return `None`.
    fn take_submit_channel(&self) -> Option<mpsc::Receiver<Vec<u8>>>;

    /// Execute a committed block and report the results.
    fn commit_block(&self, block: Block) -> Result<CommitResponse, GatewayError>;

    /// Serialize application state as of `block_index` for outgoing
    /// fast-sync.
    fn get_snapshot(&self, block_index: u64) -> Result<Vec<u8>, GatewayError>;

    /// Replace application state from an incoming fast-sync snapshot.
    fn restore(&self, snapshot: &[u8]) -> Result<(), GatewayError>;

    /// Observer hook for node state transitions.
    fn on_state_changed(&self, state: NodeState);
}
