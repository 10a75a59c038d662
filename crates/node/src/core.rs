//! The creator core: signing key, head, mempool and hashgraph.

use filament_hashgraph::{Hashgraph, HashgraphError};
use filament_mempool::MempoolState;
use filament_store::Store;
use filament_types::{
    Block, BlockSignature, Event, Hash, InternalTransactionReceipt, KeyPair, KnownEvents,
    PeerSet,
};
use tracing::{debug, trace, warn};

/// Result of inserting a batch of remote events.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub inserted: usize,
    /// Already-known events skipped without aborting the batch.
    pub duplicates: usize,
    /// Malformed or badly signed events skipped without aborting the
    /// batch; feeds the per-peer scoring metric.
    pub invalid: usize,
    /// Hash of the last event inserted; becomes the other-parent of the
    /// next self-event.
    pub last: Option<Hash>,
}

/// Owns the local creator's identity and drives the hashgraph on its
/// behalf.
pub struct Core {
    key: KeyPair,
    pub_key_hex: String,
    hg: Hashgraph,
    mempool: MempoolState,
    head: Hash,
    seq: i64,
}

impl Core {
    pub fn new(key: KeyPair, mut hg: Hashgraph) -> Result<Self, HashgraphError> {
        let pub_key_hex = key.public_key().to_hex();
        let (head, seq) = Self::resume_point(&mut hg, &key, &pub_key_hex)?;
        Ok(Core {
            key,
            pub_key_hex,
            hg,
            mempool: MempoolState::new(),
            head,
            seq,
        })
    }

    /// Where our self-parent chain resumes: our last stored event, our
    /// root, or (when we are not a member yet) the synthetic root parent.
    fn resume_point(
        hg: &mut Hashgraph,
        key: &KeyPair,
        pub_key_hex: &str,
    ) -> Result<(Hash, i64), HashgraphError> {
        if let Some(head) = hg.store_mut().last_event_from(pub_key_hex)? {
            let event = hg.store_mut().get_event(&head)?;
            return Ok((head, event.body.index));
        }
        match hg.store_mut().get_root(pub_key_hex) {
            Ok(root) => Ok((root.head, root.index)),
            Err(e) if e.is_not_found() => Ok((
                Event::root_self_parent(&key.public_key()),
                filament_types::ROOT_INDEX,
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Re-read the resume point after a fast-sync reset.
    pub fn refresh_head(&mut self) -> Result<(), HashgraphError> {
        let pub_key_hex = self.pub_key_hex.clone();
        let (head, seq) = Self::resume_point(&mut self.hg, &self.key, &pub_key_hex)?;
        self.head = head;
        self.seq = seq;
        Ok(())
    }

    pub fn public_key_hex(&self) -> &str {
        &self.pub_key_hex
    }

    pub fn key(&self) -> &KeyPair {
        &self.key
    }

    pub fn head(&self) -> Hash {
        self.head
    }

    /// Our id in the repertoire, once we are a member.
    pub fn peer_id(&mut self) -> Option<u32> {
        self.hg
            .store_mut()
            .repertoire()
            .get(&self.pub_key_hex)
            .map(|p| p.id)
    }

    pub fn mempool(&mut self) -> &mut MempoolState {
        &mut self.mempool
    }

    pub fn hashgraph(&self) -> &Hashgraph {
        &self.hg
    }

    pub fn hashgraph_mut(&mut self) -> &mut Hashgraph {
        &mut self.hg
    }

    pub fn current_peers(&mut self) -> Result<PeerSet, HashgraphError> {
        self.hg.current_peers()
    }

    /// The known-events vector advertised in sync requests.
    pub fn known_events(&mut self) -> KnownEvents {
        self.hg.known_events()
    }

    /// Events the remote lacks, in parent-before-child order, truncated to
    /// `limit`.
    pub fn events_diff(
        &mut self,
        known: &KnownEvents,
        limit: usize,
    ) -> Result<Vec<Event>, HashgraphError> {
        self.hg.events_diff(known, limit)
    }

    /// Insert a batch of remote events in the order given. Invalid or
    /// duplicate events are skipped and the batch continues; gossiped
    /// block signatures are fed into the signature pool.
    pub fn insert_batch(&mut self, events: Vec<Event>) -> Result<BatchOutcome, HashgraphError> {
        let mut outcome = BatchOutcome::default();
        for event in events {
            let signatures = event.body.block_signatures.clone();
            match self.hg.insert_event(event) {
                Ok(hash) => {
                    outcome.inserted += 1;
                    outcome.last = Some(hash);
                    for sig in signatures {
                        if let Err(e) = self.hg.add_block_signature(sig) {
                            warn!(error = %e, "Failed to record gossiped block signature");
                        }
                    }
                }
                // Equivocating events are stored and flagged; the relayer
                // is not at fault.
                Err(HashgraphError::EquivocationDetected { event, .. }) => {
                    outcome.inserted += 1;
                    outcome.last = Some(event);
                }
                Err(HashgraphError::DuplicateEvent(_)) => {
                    outcome.duplicates += 1;
                }
                Err(e) if e.is_skippable() => {
                    debug!(error = %e, "Skipping invalid event in batch");
                    outcome.invalid += 1;
                }
                Err(e) => return Err(e),
            }
        }
        trace!(
            inserted = outcome.inserted,
            duplicates = outcome.duplicates,
            invalid = outcome.invalid,
            "Batch inserted"
        );
        Ok(outcome)
    }

    /// Create, sign and insert our next self-event, consuming the mempool.
    ///
    /// Returns `None` when there is nothing to say: no pending payload and
    /// no other-parent to record.
    pub fn create_self_event(
        &mut self,
        other_parent: Option<Hash>,
        now_ms: i64,
    ) -> Result<Option<Hash>, HashgraphError> {
        if other_parent.is_none() && !self.mempool.is_busy() {
            return Ok(None);
        }
        let (transactions, internal_transactions, block_signatures) = self.mempool.drain();
        let mut event = Event::new(
            transactions.clone(),
            internal_transactions.clone(),
            block_signatures.clone(),
            self.head,
            other_parent,
            self.key.public_key(),
            self.seq + 1,
            now_ms,
        );
        event.sign(&self.key)?;
        match self.hg.insert_event(event) {
            Ok(hash) => {
                self.head = hash;
                self.seq += 1;
                trace!(seq = self.seq, "Created self-event");
                Ok(Some(hash))
            }
            Err(e) => {
                // The event never entered the DAG; requeue its payload.
                for tx in transactions {
                    self.mempool.add_transaction(tx);
                }
                for itx in internal_transactions {
                    self.mempool.add_internal_transaction(itx);
                }
                for sig in block_signatures {
                    self.mempool.add_block_signature(sig);
                }
                Err(e)
            }
        }
    }

    /// Run the virtual vote; returns freshly decided blocks awaiting
    /// application commit.
    pub fn run_consensus(&mut self) -> Result<Vec<Block>, HashgraphError> {
        self.hg.run_consensus()
    }

    /// Record the application's commit results, sign the finalized block,
    /// and queue our signature for gossip.
    pub fn finalize_and_sign_block(
        &mut self,
        index: u64,
        state_hash: Vec<u8>,
        receipts: Vec<InternalTransactionReceipt>,
    ) -> Result<(Block, BlockSignature), HashgraphError> {
        let block = self.hg.finalize_block(index, state_hash, receipts)?;
        let signature = block.sign(&self.key)?;
        self.hg.add_block_signature(signature.clone())?;
        self.mempool.add_block_signature(signature.clone());
        Ok((block, signature))
    }

    /// Whether we have work pending: queued payloads or events that have
    /// not reached consensus.
    pub fn is_busy(&self) -> bool {
        self.mempool.is_busy() || self.hg.undetermined_len() > 0
    }
}
