//! In-memory dummy application.

use crate::{AppGateway, CommitResponse, GatewayError};
use filament_core::NodeState;
use filament_types::Block;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// A stand-in application: its state is the running hash of every
/// committed transaction, and it accepts every membership change. Useful
/// for tests and for running a node without a real application attached.
pub struct InmemGateway {
    submit_tx: mpsc::Sender<Vec<u8>>,
    submit_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    state: Mutex<AppState>,
}

#[derive(Default)]
struct AppState {
    state_hash: Vec<u8>,
    committed: Vec<Vec<u8>>,
    /// Snapshot per committed block index.
    snapshots: Vec<(u64, Vec<u8>)>,
    node_state: Option<NodeState>,
}

impl InmemGateway {
    pub fn new() -> Self {
        let (submit_tx, submit_rx) = mpsc::channel(128);
        InmemGateway {
            submit_tx,
            submit_rx: Mutex::new(Some(submit_rx)),
            state: Mutex::new(AppState::default()),
        }
    }

    /// Handle the application uses to submit transactions.
    pub fn submitter(&self) -> mpsc::Sender<Vec<u8>> {
        self.submit_tx.clone()
    }

    /// The current state digest, for assertions.
    pub fn state_hash(&self) -> Vec<u8> {
        self.state.lock().state_hash.clone()
    }

    /// All committed transactions in commit order, for assertions.
    pub fn committed(&self) -> Vec<Vec<u8>> {
        self.state.lock().committed.clone()
    }

    /// Last observed node state, for assertions.
    pub fn node_state(&self) -> Option<NodeState> {
        self.state.lock().node_state
    }
}

impl Default for InmemGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl AppGateway for InmemGateway {
    fn take_submit_channel(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.submit_rx.lock().take()
    }

    fn commit_block(&self, block: Block) -> Result<CommitResponse, GatewayError> {
        let mut state = self.state.lock();
        for tx in &block.body.transactions {
            let mut hasher = Sha256::new();
            hasher.update(&state.state_hash);
            hasher.update(tx);
            state.state_hash = hasher.finalize().to_vec();
            state.committed.push(tx.clone());
        }
        let receipts = block
            .body
            .internal_transactions
            .iter()
            .map(|itx| itx.as_accepted())
            .collect();

        let snapshot = encode_snapshot(&state);
        state.snapshots.push((block.index(), snapshot));
        info!(
            block = block.index(),
            txs = block.body.transactions.len(),
            "Dummy app committed block"
        );
        Ok(CommitResponse {
            state_hash: state.state_hash.clone(),
            receipts,
        })
    }

    fn get_snapshot(&self, block_index: u64) -> Result<Vec<u8>, GatewayError> {
        let state = self.state.lock();
        state
            .snapshots
            .iter()
            .rev()
            .find(|(index, _)| *index <= block_index)
            .map(|(_, snap)| snap.clone())
            .ok_or(GatewayError::NoSnapshot(block_index))
    }

    fn restore(&self, snapshot: &[u8]) -> Result<(), GatewayError> {
        let (state_hash, committed) = decode_snapshot(snapshot)
            .ok_or_else(|| GatewayError::App("malformed snapshot".into()))?;
        let mut state = self.state.lock();
        state.state_hash = state_hash;
        state.committed = committed;
        info!(txs = state.committed.len(), "Dummy app restored from snapshot");
        Ok(())
    }

    fn on_state_changed(&self, node_state: NodeState) {
        debug!(state = %node_state, "Node state changed");
        self.state.lock().node_state = Some(node_state);
    }
}

// Snapshot layout: [32-byte padded hash length][hash][count][len][tx]...
// Length-prefixed concatenation; no serde dependency needed here.

fn encode_snapshot(state: &AppState) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(state.state_hash.len() as u32).to_be_bytes());
    out.extend_from_slice(&state.state_hash);
    out.extend_from_slice(&(state.committed.len() as u32).to_be_bytes());
    for tx in &state.committed {
        out.extend_from_slice(&(tx.len() as u32).to_be_bytes());
        out.extend_from_slice(tx);
    }
    out
}

fn decode_snapshot(bytes: &[u8]) -> Option<(Vec<u8>, Vec<Vec<u8>>)> {
    let mut at = 0usize;
    let take = |at: &mut usize, n: usize| -> Option<&[u8]> {
        let end = at.checked_add(n)?;
        let slice = bytes.get(*at..end)?;
        *at = end;
        Some(slice)
    };
    let hash_len = u32::from_be_bytes(take(&mut at, 4)?.try_into().ok()?) as usize;
    let state_hash = take(&mut at, hash_len)?.to_vec();
    let count = u32::from_be_bytes(take(&mut at, 4)?.try_into().ok()?) as usize;
    let mut committed = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        let len = u32::from_be_bytes(take(&mut at, 4)?.try_into().ok()?) as usize;
        committed.push(take(&mut at, len)?.to_vec());
    }
    Some((state_hash, committed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use filament_types::test_utils::test_peer_set;
    use filament_types::{Frame, InternalTransaction, Peer};
    use std::collections::BTreeMap;

    fn block_with(txs: Vec<Vec<u8>>, itxs: Vec<InternalTransaction>) -> Block {
        let (peers, _) = test_peer_set(3);
        let frame = Frame {
            round: 1,
            peers,
            roots: BTreeMap::new(),
            events: vec![],
            timestamp: 7,
        };
        let mut block = Block::from_frame(0, &frame).unwrap();
        block.body.transactions = txs;
        block.body.internal_transactions = itxs;
        block
    }

    #[test]
    fn commit_updates_state_hash_and_receipts() {
        let gateway = InmemGateway::new();
        let itx = InternalTransaction::add(Peer::new("addr", "key", "moniker"));
        let block = block_with(vec![b"a".to_vec(), b"b".to_vec()], vec![itx]);

        let resp = gateway.commit_block(block).unwrap();
        assert_eq!(resp.receipts.len(), 1);
        assert!(resp.receipts[0].accepted);
        assert_eq!(resp.state_hash, gateway.state_hash());
        assert_eq!(gateway.committed().len(), 2);
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let source = InmemGateway::new();
        source
            .commit_block(block_with(vec![b"x".to_vec(), b"y".to_vec()], vec![]))
            .unwrap();
        let snapshot = source.get_snapshot(0).unwrap();

        let target = InmemGateway::new();
        target.restore(&snapshot).unwrap();
        assert_eq!(target.state_hash(), source.state_hash());
        assert_eq!(target.committed(), source.committed());
    }

    #[test]
    fn submit_channel_is_taken_once() {
        let gateway = InmemGateway::new();
        assert!(gateway.take_submit_channel().is_some());
        assert!(gateway.take_submit_channel().is_none());
    }
}
