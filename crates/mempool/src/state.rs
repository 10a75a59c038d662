//! Mempool state.

use filament_types::{BlockSignature, InternalTransaction};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Upper bound on queued transactions; submissions beyond it are dropped
/// with a warning rather than growing without bound.
const MAX_PENDING: usize = 65_536;

/// FIFO pools of everything the next self-event should carry.
#[derive(Debug, Default)]
pub struct MempoolState {
    transactions: VecDeque<Vec<u8>>,
    internal_transactions: VecDeque<InternalTransaction>,
    block_signatures: VecDeque<BlockSignature>,
}

impl MempoolState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_transaction(&mut self, tx: Vec<u8>) {
        if self.transactions.len() >= MAX_PENDING {
            warn!(pending = self.transactions.len(), "Mempool full, dropping transaction");
            return;
        }
        self.transactions.push_back(tx);
        debug!(pending = self.transactions.len(), "Transaction queued");
    }

    pub fn add_internal_transaction(&mut self, tx: InternalTransaction) {
        self.internal_transactions.push_back(tx);
    }

    pub fn add_block_signature(&mut self, sig: BlockSignature) {
        self.block_signatures.push_back(sig);
    }

    /// Whether there is anything worth gossiping about.
    pub fn is_busy(&self) -> bool {
        !self.transactions.is_empty()
            || !self.internal_transactions.is_empty()
            || !self.block_signatures.is_empty()
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    /// Drain all three pools for the next self-event.
    pub fn drain(
        &mut self,
    ) -> (
        Vec<Vec<u8>>,
        Vec<InternalTransaction>,
        Vec<BlockSignature>,
    ) {
        (
            self.transactions.drain(..).collect(),
            self.internal_transactions.drain(..).collect(),
            self.block_signatures.drain(..).collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_preserves_order_and_empties() {
        let mut pool = MempoolState::new();
        pool.add_transaction(b"a".to_vec());
        pool.add_transaction(b"b".to_vec());
        assert!(pool.is_busy());

        let (txs, itxs, sigs) = pool.drain();
        assert_eq!(txs, vec![b"a".to_vec(), b"b".to_vec()]);
        assert!(itxs.is_empty());
        assert!(sigs.is_empty());
        assert!(!pool.is_busy());
    }
}
