//! The consensus engine proper.

use crate::meta::{Coord, EventMeta};
use crate::HashgraphError;
use filament_store::Store;
use filament_types::{
    Block, BlockSignature, Event, Fame, Frame, FrameEvent, Hash, InternalTransactionKind,
    InternalTransactionReceipt, KnownEvents, PeerSet, Root, RoundInfo,
};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use tracing::{debug, info, trace, warn};

/// Fame votes fall back to the signature coin every this many rounds without
/// a supermajority.
pub const COIN_ROUND_INTERVAL: u64 = 10;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct HashgraphConfig {
    /// Rounds between a membership change being decided and the new peer
    /// set becoming active.
    pub activation_lag: u64,
    /// Undecided-event count that suspends the engine. Zero disables.
    pub suspend_limit: usize,
}

impl Default for HashgraphConfig {
    fn default() -> Self {
        HashgraphConfig {
            activation_lag: 6,
            suspend_limit: 100,
        }
    }
}

/// Counters for logging and metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashgraphStats {
    pub events: u64,
    pub undetermined: usize,
    pub last_round: Option<u64>,
    pub last_consensus_round: Option<u64>,
    pub last_block: Option<u64>,
    pub forks: usize,
}

/// A block signature that arrived before its block was ready.
#[derive(Debug, Clone)]
struct PendingSignature {
    sig: BlockSignature,
    retries: u32,
}

const PENDING_SIG_MAX_RETRIES: u32 = 32;

enum SigOutcome {
    Applied { completed: bool },
    Ignored,
    NotReady,
}

/// The hashgraph: DAG state, virtual voting, and block production.
///
/// Single-writer: the node state machine owns it and serialises every
/// mutation. The store is the single source of truth for entities; the
/// in-memory maps here hold derived ancestry only and are rebuilt on
/// replay.
pub struct Hashgraph {
    store: Box<dyn Store>,
    config: HashgraphConfig,

    /// Derived metadata by event hash.
    meta: HashMap<Hash, EventMeta>,
    /// Primary chain index: (creator id, index) → hash.
    by_creator_index: HashMap<(u32, i64), Hash>,
    /// Equivocating creators: creator id → lowest forked index. Events at
    /// or above the fork point are unseeable.
    forks: HashMap<u32, i64>,
    /// Rounds with undecided witnesses, ascending.
    pending_rounds: BTreeSet<u64>,
    /// Events without a round-received, in insertion order.
    undetermined: Vec<Hash>,
    /// Block signatures waiting for their block.
    pending_signatures: VecDeque<PendingSignature>,
    /// Highest block index with a complete certificate.
    anchor: Option<u64>,
    topo_counter: u64,
    suspended: bool,
}

impl Hashgraph {
    pub fn new(store: Box<dyn Store>, config: HashgraphConfig) -> Self {
        Hashgraph {
            store,
            config,
            meta: HashMap::new(),
            by_creator_index: HashMap::new(),
            forks: HashMap::new(),
            pending_rounds: BTreeSet::new(),
            undetermined: Vec::new(),
            pending_signatures: VecDeque::new(),
            anchor: None,
            topo_counter: 0,
            suspended: false,
        }
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn store_mut(&mut self) -> &mut dyn Store {
        self.store.as_mut()
    }

    pub fn config(&self) -> &HashgraphConfig {
        &self.config
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Clear the suspension flag after an explicit resume.
    pub fn resume(&mut self) {
        self.suspended = false;
    }

    pub fn stats(&self) -> HashgraphStats {
        HashgraphStats {
            events: self.topo_counter,
            undetermined: self.undetermined.len(),
            last_round: self.store.last_round(),
            last_consensus_round: self.store.last_consensus_round(),
            last_block: self.store.last_block_index(),
            forks: self.forks.len(),
        }
    }

    /// Number of events that have not reached consensus.
    pub fn undetermined_len(&self) -> usize {
        self.undetermined.len()
    }

    pub fn meta(&self, hash: &Hash) -> Option<&EventMeta> {
        self.meta.get(hash)
    }

    pub fn known_events(&mut self) -> KnownEvents {
        self.store.known_events()
    }

    /// The peer set active at `round`.
    pub fn peers_at_round(&mut self, round: u64) -> Result<PeerSet, HashgraphError> {
        Ok(self.store.get_peer_set(round)?)
    }

    /// The peer set for new events: the one active at the next undecided
    /// round.
    pub fn current_peers(&mut self) -> Result<PeerSet, HashgraphError> {
        let round = self.store.last_round().unwrap_or(0);
        Ok(self.store.get_peer_set(round)?)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Insertion
    // ═══════════════════════════════════════════════════════════════════════

    /// Insert a signed event whose parents are already present (or are
    /// roots). Assigns its round and witness flag.
    ///
    /// Insertion is all-or-nothing: on any error the DAG is unchanged.
    pub fn insert_event(&mut self, event: Event) -> Result<Hash, HashgraphError> {
        if self.suspended {
            return Err(HashgraphError::Suspended {
                undecided: self.undetermined.len(),
                limit: self.config.suspend_limit,
            });
        }
        if self.config.suspend_limit > 0 && self.undetermined.len() > self.config.suspend_limit {
            self.suspended = true;
            warn!(
                undecided = self.undetermined.len(),
                limit = self.config.suspend_limit,
                "Suspend limit exceeded, halting insertion"
            );
            return Err(HashgraphError::Suspended {
                undecided: self.undetermined.len(),
                limit: self.config.suspend_limit,
            });
        }

        let hash = event.hash()?;
        if self.meta.contains_key(&hash) {
            return Err(HashgraphError::DuplicateEvent(hash));
        }
        event
            .verify()
            .map_err(|_| HashgraphError::InvalidSignature(hash))?;

        let creator_hex = event.creator_hex();
        let peer = self
            .store
            .repertoire()
            .get(&creator_hex)
            .cloned()
            .ok_or_else(|| HashgraphError::PeerUnknown(creator_hex.clone()))?;
        let creator_id = peer.id;
        let index = event.body.index;

        // Resolve the self-parent: either the creator's root or the previous
        // event on its chain.
        let root = self.store.get_root(&creator_hex)?;
        let (self_parent, self_parent_round) =
            if event.body.self_parent == root.head && index == root.index + 1 {
                (None, root.round)
            } else {
                match self.meta.get(&event.body.self_parent) {
                    Some(m) if m.creator_id == creator_id && m.index == index - 1 => {
                        (Some(m.hash), m.round)
                    }
                    Some(_) => {
                        return Err(HashgraphError::InvalidEvent(
                            "self-parent is not the creator's previous event".into(),
                        ))
                    }
                    None => {
                        return Err(HashgraphError::InvalidEvent(
                            "self-parent not in the DAG".into(),
                        ))
                    }
                }
            };

        // Resolve the other-parent: a known event or a root head.
        let (other_parent, other_parent_round) = match &event.body.other_parent {
            None => (None, 0),
            Some(op) => match self.meta.get(op) {
                Some(m) => (Some(m.hash), m.round),
                None => match self.root_round_by_head(op)? {
                    Some(round) => (None, round),
                    None => {
                        return Err(HashgraphError::InvalidEvent(
                            "other-parent not in the DAG".into(),
                        ))
                    }
                },
            },
        };

        // Equivocation: same creator, same index, different hash. Both are
        // stored; neither remains seeable (the creator's entry is excluded
        // from paths from the fork point on). Reported after insertion.
        let mut equivocation = false;
        if let Some(&existing) = self.by_creator_index.get(&(creator_id, index)) {
            if existing != hash {
                let fork_at = self
                    .forks
                    .get(&creator_id)
                    .copied()
                    .map_or(index, |f| f.min(index));
                self.forks.insert(creator_id, fork_at);
                equivocation = true;
                warn!(
                    creator = %creator_hex,
                    index,
                    "Equivocation detected; creator excluded from seeing"
                );
            }
        }

        // Ancestry coordinates.
        let mut last_ancestors: BTreeMap<u32, Coord> = self_parent
            .and_then(|sp| self.meta.get(&sp))
            .map(|m| m.last_ancestors.clone())
            .unwrap_or_default();
        if let Some(op) = other_parent.and_then(|op| self.meta.get(&op)) {
            for (id, coord) in &op.last_ancestors {
                let replace = last_ancestors
                    .get(id)
                    .map_or(true, |cur| cur.index < coord.index);
                if replace {
                    last_ancestors.insert(*id, *coord);
                }
            }
        }
        last_ancestors.insert(creator_id, Coord { index, hash });

        // Round assignment: parents' max round, plus one if this event
        // strongly sees a supermajority of that round's witnesses.
        let parent_round = self_parent_round.max(other_parent_round);
        let parent_round_info = self.round_info_or_default(parent_round)?;
        let parent_peers = self.store.get_peer_set(parent_round)?;
        let mut strongly_seen = 0usize;
        for w in parent_round_info.witnesses() {
            if let Some(wm) = self.meta.get(&w) {
                if self.strongly_sees(&last_ancestors, wm, &parent_peers) {
                    strongly_seen += 1;
                }
            }
        }
        let round = if strongly_seen >= parent_peers.super_majority() {
            parent_round + 1
        } else {
            parent_round
        };
        let witness = self_parent.is_none() || round > self_parent_round;

        // Propagate first-descendant coordinates to ancestors.
        let own_coord = Coord { index, hash };
        let mut queue: VecDeque<Hash> = VecDeque::new();
        if let Some(sp) = self_parent {
            queue.push_back(sp);
        }
        if let Some(op) = other_parent {
            queue.push_back(op);
        }
        let mut visited: HashSet<Hash> = HashSet::new();
        while let Some(h) = queue.pop_front() {
            if !visited.insert(h) {
                continue;
            }
            let Some(m) = self.meta.get_mut(&h) else {
                continue;
            };
            if m.first_descendants.contains_key(&creator_id) {
                continue;
            }
            m.first_descendants.insert(creator_id, own_coord);
            if let Some(sp) = m.self_parent {
                queue.push_back(sp);
            }
            if let Some(op) = m.other_parent {
                queue.push_back(op);
            }
        }

        let mut first_descendants = BTreeMap::new();
        first_descendants.insert(creator_id, own_coord);

        let meta = EventMeta {
            hash,
            creator: creator_hex,
            creator_id,
            index,
            self_parent,
            other_parent,
            timestamp: event.body.timestamp,
            topo_index: self.topo_counter,
            round,
            witness,
            round_received: None,
            last_ancestors,
            first_descendants,
        };
        self.topo_counter += 1;

        // Persist and index.
        self.store.set_event(&event)?;
        let mut round_info = self.round_info_or_default(round)?;
        round_info.add_created(hash, witness);
        self.store.set_round(round, &round_info)?;
        if !round_info.decided {
            self.pending_rounds.insert(round);
        }

        self.by_creator_index.entry((creator_id, index)).or_insert(hash);
        self.undetermined.push(hash);
        let creator_hex = meta.creator.clone();
        self.meta.insert(hash, meta);

        trace!(?hash, round, witness, "Inserted event");
        if equivocation {
            return Err(HashgraphError::EquivocationDetected {
                creator: creator_hex,
                index,
                event: hash,
            });
        }
        Ok(hash)
    }

    fn root_round_by_head(&mut self, head: &Hash) -> Result<Option<u64>, HashgraphError> {
        for creator in self.store.repertoire().keys() {
            match self.store.get_root(creator) {
                Ok(root) if root.head == *head => return Ok(Some(root.round)),
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    fn round_info_or_default(&mut self, round: u64) -> Result<RoundInfo, HashgraphError> {
        match self.store.get_round(round) {
            Ok(info) => Ok(info),
            Err(e) if e.is_not_found() => Ok(RoundInfo::new()),
            Err(e) => Err(e.into()),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Seeing
    // ═══════════════════════════════════════════════════════════════════════

    /// Whether `x` sees `y`: y is an ancestor of x and y's creator has no
    /// fork at or below y's index.
    fn sees(&self, x: &EventMeta, y: &EventMeta) -> bool {
        if let Some(&fork_at) = self.forks.get(&y.creator_id) {
            if y.index >= fork_at {
                return false;
            }
        }
        x.last_ancestors
            .get(&y.creator_id)
            .is_some_and(|c| c.index >= y.index)
    }

    /// Whether an event with ancestors `la` strongly sees `target`: events
    /// of a supermajority of `peers` lie on connecting paths.
    fn strongly_sees(
        &self,
        la: &BTreeMap<u32, Coord>,
        target: &EventMeta,
        peers: &PeerSet,
    ) -> bool {
        if let Some(&fork_at) = self.forks.get(&target.creator_id) {
            if target.index >= fork_at {
                return false;
            }
        }
        let mut count = 0usize;
        for peer in peers.iter() {
            if self.forks.contains_key(&peer.id) {
                continue;
            }
            let Some(up) = la.get(&peer.id) else { continue };
            let Some(down) = target.first_descendants.get(&peer.id) else {
                continue;
            };
            if up.index >= down.index {
                count += 1;
            }
        }
        count >= peers.super_majority()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Consensus
    // ═══════════════════════════════════════════════════════════════════════

    /// Run fame voting and round-received processing over everything
    /// inserted so far. Returns the blocks of newly decided rounds, in
    /// order, awaiting application commit.
    pub fn run_consensus(&mut self) -> Result<Vec<Block>, HashgraphError> {
        self.decide_fame()?;
        let blocks = self.process_decided_rounds()?;
        if !blocks.is_empty() {
            self.retry_pending_signatures();
        }
        Ok(blocks)
    }

    /// The virtual vote: witnesses of later rounds vote on the fame of
    /// earlier witnesses.
    fn decide_fame(&mut self) -> Result<(), HashgraphError> {
        let last_round = match self.store.last_round() {
            Some(r) => r,
            None => return Ok(()),
        };

        // (voter, candidate) → vote, rebuilt each pass.
        let mut votes: HashMap<(Hash, Hash), bool> = HashMap::new();

        for r in self.pending_rounds.clone() {
            let mut round_info = self.round_info_or_default(r)?;
            if round_info.decided {
                self.pending_rounds.remove(&r);
                continue;
            }

            for w in round_info.witnesses() {
                if round_info.fame(&w) != Fame::Undecided {
                    continue;
                }
                let Some(wm) = self.meta.get(&w).cloned() else {
                    continue;
                };

                'rounds: for j in (r + 1)..=last_round {
                    let j_info = self.round_info_or_default(j)?;
                    let diff = j - r;
                    for v in j_info.witnesses() {
                        let Some(vm) = self.meta.get(&v).cloned() else {
                            continue;
                        };
                        if diff == 1 {
                            votes.insert((v, w), self.sees(&vm, &wm));
                            continue;
                        }

                        // Majority of the previous round's strongly seen
                        // votes; supermajority decides, coin rounds flip.
                        let prev_info = self.round_info_or_default(j - 1)?;
                        let prev_peers = self.store.get_peer_set(j - 1)?;
                        let mut yays = 0usize;
                        let mut nays = 0usize;
                        for u in prev_info.witnesses() {
                            let Some(um) = self.meta.get(&u) else { continue };
                            if !self.strongly_sees(&vm.last_ancestors, um, &prev_peers) {
                                continue;
                            }
                            match votes.get(&(u, w)) {
                                Some(true) => yays += 1,
                                Some(false) => nays += 1,
                                None => {}
                            }
                        }
                        let vote = yays >= nays;
                        let tally = yays.max(nays);

                        if diff % COIN_ROUND_INTERVAL != 0 {
                            if tally >= prev_peers.super_majority() {
                                round_info
                                    .set_fame(w, if vote { Fame::Famous } else { Fame::NotFamous });
                                debug!(round = r, witness = ?w, famous = vote, "Fame decided");
                                break 'rounds;
                            }
                            votes.insert((v, w), vote);
                        } else if tally >= prev_peers.super_majority() {
                            votes.insert((v, w), vote);
                        } else {
                            // Coin round: the middle bit of the voter's own
                            // signature breaks the deadlock.
                            let coin = self.store.get_event(&v)?.coin_flip();
                            votes.insert((v, w), coin);
                        }
                    }
                }
            }

            if round_info.all_fame_decided() {
                round_info.decided = true;
                self.pending_rounds.remove(&r);
                info!(round = r, "Round decided");
            }
            self.store.set_round(r, &round_info)?;
        }
        Ok(())
    }

    /// Assign round-received and consensus timestamps for each newly
    /// decided round, in order, and produce frames and blocks.
    fn process_decided_rounds(&mut self) -> Result<Vec<Block>, HashgraphError> {
        let mut blocks = Vec::new();
        loop {
            let next = self
                .store
                .last_consensus_round()
                .map(|r| r + 1)
                .unwrap_or(0);
            let mut round_info = match self.store.get_round(next) {
                Ok(info) => info,
                Err(e) if e.is_not_found() => break,
                Err(e) => return Err(e.into()),
            };
            if !round_info.decided {
                break;
            }

            let famous = round_info.famous_witnesses();
            let seed = self.whitening_seed(&famous)?;

            // Events whose round-received is `next`: all famous witnesses
            // descend from them.
            let mut received: Vec<(i64, Hash, Hash)> = Vec::new();
            let famous_meta: Vec<EventMeta> = famous
                .iter()
                .filter_map(|w| self.meta.get(w).cloned())
                .collect();
            if famous_meta.len() == famous.len() && !famous.is_empty() {
                for x in self.undetermined.clone() {
                    let Some(xm) = self.meta.get(&x).cloned() else {
                        continue;
                    };
                    if xm.round_received.is_some() || xm.round > next {
                        continue;
                    }
                    if !famous_meta.iter().all(|wm| self.sees(wm, &xm)) {
                        continue;
                    }

                    let cts = self.consensus_timestamp(&famous_meta, &xm)?;
                    let whitened = {
                        let event = self.store.get_event(&x)?;
                        Hash::digest(event.signature.as_bytes()).xor(&seed)
                    };
                    if let Some(m) = self.meta.get_mut(&x) {
                        m.round_received = Some(next);
                    }
                    received.push((cts, whitened, x));
                }
            }

            // Total order: consensus timestamp, then whitened signature.
            received.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
            self.undetermined.retain(|h| {
                self.meta
                    .get(h)
                    .map_or(true, |m| m.round_received.is_none())
            });

            round_info.queued = received.iter().map(|(_, _, h)| *h).collect();
            self.store.set_round(next, &round_info)?;

            let frame = self.build_frame(next, &received)?;
            self.store.set_frame(&frame)?;
            self.store.set_last_consensus_round(next)?;

            if !frame.transactions().is_empty() || !frame.internal_transactions().is_empty() {
                let index = self.store.last_block_index().map(|i| i + 1).unwrap_or(0);
                let block = Block::from_frame(index, &frame)?;
                self.store.set_block(&block)?;
                info!(
                    block = index,
                    round = next,
                    txs = block.body.transactions.len(),
                    "Block created"
                );
                blocks.push(block);
            }

            // Commit boundary.
            self.store.flush()?;
            debug!(round = next, events = frame.events.len(), "Frame sealed");
        }
        Ok(blocks)
    }

    /// Median of the timestamps at which each famous witness's self-parent
    /// chain first sees `x`.
    fn consensus_timestamp(
        &self,
        famous: &[EventMeta],
        x: &EventMeta,
    ) -> Result<i64, HashgraphError> {
        let mut stamps = Vec::with_capacity(famous.len());
        for wm in famous {
            let mut cur = wm.clone();
            let mut best = cur.timestamp;
            while let Some(sp) = cur.self_parent {
                let Some(pm) = self.meta.get(&sp) else { break };
                if !self.sees(pm, x) {
                    break;
                }
                best = pm.timestamp;
                cur = pm.clone();
            }
            stamps.push(best);
        }
        stamps.sort_unstable();
        Ok(stamps[(stamps.len() - 1) / 2])
    }

    /// Per-round whitening seed: digest over the famous witnesses'
    /// signatures, in witness-hash order.
    fn whitening_seed(&mut self, famous: &[Hash]) -> Result<Hash, HashgraphError> {
        let mut hasher = Sha256::new();
        for w in famous {
            let event = self.store.get_event(w)?;
            hasher.update(event.signature.as_bytes());
        }
        Ok(Hash::new(hasher.finalize().into()))
    }

    fn build_frame(
        &mut self,
        round: u64,
        received: &[(i64, Hash, Hash)],
    ) -> Result<Frame, HashgraphError> {
        let peers = self.store.get_peer_set(round)?;

        let mut events = Vec::with_capacity(received.len());
        // Per creator, the highest-index event in the frame: the point its
        // self-parent chain resumes from.
        let mut last_per_creator: HashMap<String, (Hash, i64, u64, i64)> = HashMap::new();
        for (cts, _, hash) in received {
            let core = self.store.get_event(hash)?;
            let Some(m) = self.meta.get(hash) else {
                continue;
            };
            let advance = last_per_creator
                .get(&m.creator)
                .map_or(true, |&(_, index, _, _)| index < m.index);
            if advance {
                last_per_creator.insert(m.creator.clone(), (*hash, m.index, m.round, *cts));
            }
            events.push(FrameEvent {
                core,
                round: m.round,
                round_received: round,
                consensus_timestamp: *cts,
            });
        }

        // Advance roots for creators with events in this frame; peers
        // without one contribute their current root to the frame.
        let mut roots = BTreeMap::new();
        for peer in peers.iter() {
            match last_per_creator.get(&peer.pub_key_hex) {
                Some(&(head, index, event_round, cts)) => {
                    let root = Root {
                        head,
                        index,
                        round: event_round,
                        round_received: Some(round),
                        timestamp: cts,
                    };
                    self.store.set_root(&peer.pub_key_hex, &root)?;
                }
                None => {
                    let root = self.store.get_root(&peer.pub_key_hex)?;
                    roots.insert(peer.pub_key_hex.clone(), root);
                }
            }
        }

        let timestamp = match events.iter().map(|fe| fe.consensus_timestamp).max() {
            Some(ts) => ts,
            None if round == 0 => 0,
            None => self
                .store
                .get_frame(round - 1)
                .map(|f| f.timestamp)
                .unwrap_or(0),
        };

        Ok(Frame {
            round,
            peers,
            roots,
            events,
            timestamp,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Blocks and signatures
    // ═══════════════════════════════════════════════════════════════════════

    /// Write the application's commit results into the stored block and
    /// return the finalized block, ready to sign.
    pub fn finalize_block(
        &mut self,
        index: u64,
        state_hash: Vec<u8>,
        receipts: Vec<InternalTransactionReceipt>,
    ) -> Result<Block, HashgraphError> {
        let mut block = self.store.get_block(index)?;
        block.body.state_hash = state_hash;
        block.body.internal_transaction_receipts = receipts;
        self.store.set_block(&block)?;
        self.store.flush()?;
        Ok(block)
    }

    /// Feed one gossiped block signature into the pool.
    ///
    /// Returns `true` when this signature completed the block's
    /// certificate. Signatures for blocks that are not ready yet are parked
    /// and retried after each consensus run.
    pub fn add_block_signature(&mut self, sig: BlockSignature) -> Result<bool, HashgraphError> {
        match self.try_apply_signature(&sig)? {
            SigOutcome::Applied { completed } => Ok(completed),
            SigOutcome::Ignored => Ok(false),
            SigOutcome::NotReady => {
                self.park_signature(PendingSignature { sig, retries: 0 });
                Ok(false)
            }
        }
    }

    fn try_apply_signature(&mut self, sig: &BlockSignature) -> Result<SigOutcome, HashgraphError> {
        let block = match self.store.get_block(sig.index) {
            Ok(block) => block,
            Err(e) if e.is_not_found() => return Ok(SigOutcome::NotReady),
            Err(e) => return Err(e.into()),
        };

        let peers = self.store.get_peer_set(block.round_received())?;
        if !peers.contains(&sig.validator) {
            debug!(validator = %sig.validator, block = sig.index, "Signature from non-member ignored");
            return Ok(SigOutcome::Ignored);
        }
        if !block.verify_signature(sig)? {
            // Usually the local block has not been finalized by the
            // application yet, so the body hash differs; retried later.
            return Ok(SigOutcome::NotReady);
        }

        let mut block = block;
        let had_certificate = block.certificate_complete(&peers);
        block.set_signature(sig.clone());
        let has_certificate = block.certificate_complete(&peers);
        self.store.set_block(&block)?;

        if has_certificate {
            let index = block.index();
            self.anchor = Some(self.anchor.map_or(index, |a| a.max(index)));
        }
        Ok(SigOutcome::Applied {
            completed: has_certificate && !had_certificate,
        })
    }

    fn park_signature(&mut self, sig: PendingSignature) {
        if self.pending_signatures.len() >= 1024 {
            self.pending_signatures.pop_front();
        }
        self.pending_signatures.push_back(sig);
    }

    /// Retry parked signatures; called after new blocks are finalized.
    pub fn retry_pending_signatures(&mut self) {
        let pending: Vec<PendingSignature> = self.pending_signatures.drain(..).collect();
        for mut p in pending {
            match self.try_apply_signature(&p.sig) {
                Ok(SigOutcome::NotReady) => {
                    p.retries += 1;
                    if p.retries < PENDING_SIG_MAX_RETRIES {
                        self.park_signature(p);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Dropping undeliverable block signature");
                }
            }
        }
    }

    /// The latest block with a complete, valid certificate, plus its frame.
    /// This is what fast-forward serves.
    pub fn anchor_block(&mut self) -> Result<Option<(Block, Frame)>, HashgraphError> {
        let Some(last) = self.store.last_block_index() else {
            return Ok(None);
        };
        let mut index = last;
        loop {
            let block = self.store.get_block(index)?;
            let peers = self.store.get_peer_set(block.round_received())?;
            if block.verify_certificate(&peers)? {
                let frame = self.store.get_frame(block.round_received())?;
                return Ok(Some((block, frame)));
            }
            if index == 0 {
                return Ok(None);
            }
            index -= 1;
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Membership
    // ═══════════════════════════════════════════════════════════════════════

    /// Apply accepted membership changes from a committed block. The new
    /// peer set activates `activation_lag` rounds after the block's
    /// round-received.
    pub fn apply_internal_transactions(
        &mut self,
        round_received: u64,
        receipts: &[InternalTransactionReceipt],
    ) -> Result<Option<(u64, PeerSet)>, HashgraphError> {
        let accepted: Vec<_> = receipts.iter().filter(|r| r.accepted).collect();
        if accepted.is_empty() {
            return Ok(None);
        }

        let mut next = self.store.get_peer_set(round_received)?;
        let mut changed = false;
        for receipt in accepted {
            match receipt.tx.kind {
                InternalTransactionKind::PeerAdd => {
                    if !next.contains(&receipt.tx.peer.pub_key_hex) {
                        next = next.with_new_peer(receipt.tx.peer.clone());
                        changed = true;
                    }
                }
                InternalTransactionKind::PeerRemove => {
                    if next.contains(&receipt.tx.peer.pub_key_hex) {
                        next = next.with_removed_peer(&receipt.tx.peer.pub_key_hex);
                        changed = true;
                    }
                }
            }
        }
        if !changed {
            return Ok(None);
        }

        let activation = round_received + self.config.activation_lag;
        self.store.set_peer_set(activation, &next)?;
        info!(
            round = activation,
            peers = next.len(),
            "New peer set scheduled"
        );
        Ok(Some((activation, next)))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sync support
    // ═══════════════════════════════════════════════════════════════════════

    /// Events the remote lacks given its known vector, in an order that
    /// never yields a child before its parents, truncated to `limit`.
    pub fn events_diff(
        &mut self,
        known: &KnownEvents,
        limit: usize,
    ) -> Result<Vec<Event>, HashgraphError> {
        let repertoire = self.store.repertoire();
        let mut hashes: Vec<(u64, Hash)> = Vec::new();
        for (pubkey, peer) in &repertoire {
            let after = known.get(&peer.id).copied().unwrap_or(filament_types::ROOT_INDEX);
            for hash in self.store.participant_events(pubkey, after)? {
                if let Some(m) = self.meta.get(&hash) {
                    hashes.push((m.topo_index, hash));
                }
            }
        }
        hashes.sort_unstable_by_key(|(topo, _)| *topo);
        hashes.truncate(limit);

        let mut events = Vec::with_capacity(hashes.len());
        for (_, hash) in hashes {
            events.push(self.store.get_event(&hash)?);
        }
        Ok(events)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Fast-sync and bootstrap
    // ═══════════════════════════════════════════════════════════════════════

    /// Install a remote frame as the new base of the DAG. Wipes derived
    /// state; subsequent events resume from the frame's roots.
    pub fn reset_from_frame(&mut self, block: &Block, frame: &Frame) -> Result<(), HashgraphError> {
        self.meta.clear();
        self.by_creator_index.clear();
        self.forks.clear();
        self.pending_rounds.clear();
        self.undetermined.clear();
        self.pending_signatures.clear();
        self.topo_counter = 0;
        self.suspended = false;

        self.store.set_peer_set(frame.round, &frame.peers)?;

        // Roots of absent peers come from the frame; creators with frame
        // events resume from their last one.
        for (creator, root) in &frame.roots {
            self.store.set_root(creator, root)?;
        }
        for fe in &frame.events {
            let hash = fe.core.hash()?;
            let creator = fe.core.creator_hex();
            let replace = match self.store.get_root(&creator) {
                Ok(existing) => existing.index < fe.core.body.index,
                Err(e) if e.is_not_found() => true,
                Err(e) => return Err(e.into()),
            };
            if replace {
                let root = Root {
                    head: hash,
                    index: fe.core.body.index,
                    round: fe.round,
                    round_received: Some(fe.round_received),
                    timestamp: fe.consensus_timestamp,
                };
                self.store.set_root(&creator, &root)?;
            }
            // Keep the event itself resolvable as a future other-parent.
            self.store.set_event(&fe.core)?;
        }

        self.store.set_frame(frame)?;
        self.store.set_block(block)?;
        self.store.set_last_consensus_round(frame.round)?;
        self.anchor = Some(block.index());
        self.store.flush()?;
        info!(round = frame.round, block = block.index(), "Reset from frame");
        Ok(())
    }

    /// Replay a pre-existing database into the engine: re-insert every
    /// stored event, then mark the consensus positions recorded in stored
    /// frames so decided rounds are not re-processed.
    pub fn bootstrap(&mut self) -> Result<(), HashgraphError> {
        let events = self.store.topological_events()?;
        let total = events.len();
        for event in events {
            match self.insert_event(event) {
                Ok(_) => {}
                Err(e) if e.is_skippable() => {
                    debug!(error = %e, "Skipping event during bootstrap replay");
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(last_consensus) = self.store.last_consensus_round() {
            for round in 0..=last_consensus {
                let frame = match self.store.get_frame(round) {
                    Ok(frame) => frame,
                    Err(e) if e.is_not_found() => continue,
                    Err(e) => return Err(e.into()),
                };
                for fe in &frame.events {
                    let hash = fe.core.hash()?;
                    if let Some(m) = self.meta.get_mut(&hash) {
                        m.round_received = Some(fe.round_received);
                    }
                }
            }
            self.undetermined.retain(|h| {
                self.meta
                    .get(h)
                    .map_or(true, |m| m.round_received.is_none())
            });
        }
        info!(events = total, "Bootstrap replay complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filament_store::InmemStore;
    use filament_types::test_utils::{test_keypair, test_peer_set};
    use filament_types::KeyPair;

    fn engine(n: u8) -> (Hashgraph, Vec<KeyPair>) {
        let (peers, keys) = test_peer_set(n);
        let store = InmemStore::with_genesis_peers(1000, &peers).unwrap();
        (Hashgraph::new(Box::new(store), HashgraphConfig::default()), keys)
    }

    fn signed_event(
        key: &KeyPair,
        self_parent: Hash,
        other_parent: Option<Hash>,
        index: i64,
        ts: i64,
    ) -> Event {
        let mut event = Event::new(
            vec![],
            vec![],
            vec![],
            self_parent,
            other_parent,
            key.public_key(),
            index,
            ts,
        );
        event.sign(key).unwrap();
        event
    }

    #[test]
    fn first_event_is_a_round_zero_witness() {
        let (mut hg, keys) = engine(3);
        let key = &keys[0];
        let root = Event::root_self_parent(&key.public_key());
        let hash = hg.insert_event(signed_event(key, root, None, 0, 1)).unwrap();

        let meta = hg.meta(&hash).unwrap();
        assert_eq!(meta.round, 0);
        assert!(meta.witness);
        assert_eq!(meta.index, 0);
    }

    #[test]
    fn missing_parents_are_rejected() {
        let (mut hg, keys) = engine(3);
        let key = &keys[0];

        // Self-parent is not the root and not in the DAG.
        let bogus = Hash::digest(b"nope");
        let err = hg
            .insert_event(signed_event(key, bogus, None, 0, 1))
            .unwrap_err();
        assert!(matches!(err, HashgraphError::InvalidEvent(_)));

        // Other-parent unknown.
        let root = Event::root_self_parent(&key.public_key());
        let err = hg
            .insert_event(signed_event(key, root, Some(bogus), 0, 1))
            .unwrap_err();
        assert!(matches!(err, HashgraphError::InvalidEvent(_)));
    }

    #[test]
    fn index_gaps_are_rejected() {
        let (mut hg, keys) = engine(3);
        let key = &keys[0];
        let root = Event::root_self_parent(&key.public_key());
        let first = hg.insert_event(signed_event(key, root, None, 0, 1)).unwrap();

        // Index 2 citing index 0 as self-parent breaks the chain.
        let err = hg
            .insert_event(signed_event(key, first, None, 2, 2))
            .unwrap_err();
        assert!(matches!(err, HashgraphError::InvalidEvent(_)));
    }

    #[test]
    fn unknown_creators_are_rejected() {
        let (mut hg, _) = engine(3);
        let outsider = test_keypair(42);
        let root = Event::root_self_parent(&outsider.public_key());
        let err = hg
            .insert_event(signed_event(&outsider, root, None, 0, 1))
            .unwrap_err();
        assert!(matches!(err, HashgraphError::PeerUnknown(_)));
    }

    #[test]
    fn bad_signature_is_rejected() {
        let (mut hg, keys) = engine(3);
        let key = &keys[0];
        let root = Event::root_self_parent(&key.public_key());
        let mut event = signed_event(key, root, None, 0, 1);
        event.signature = filament_types::Signature::zero();
        let err = hg.insert_event(event).unwrap_err();
        assert!(matches!(err, HashgraphError::InvalidSignature(_)));
    }

    #[test]
    fn known_events_and_diff_track_chains() {
        let (mut hg, keys) = engine(2);
        let key = &keys[0];
        let root = Event::root_self_parent(&key.public_key());
        let mut parent = root;
        for i in 0..4 {
            parent = hg
                .insert_event(signed_event(key, parent, None, i, 10 + i))
                .unwrap();
        }

        let known = hg.known_events();
        assert_eq!(known[&0], 3);
        assert_eq!(known[&1], -1);

        // A remote that knows index 1 lacks indexes 2 and 3.
        let mut remote = KnownEvents::new();
        remote.insert(0, 1);
        remote.insert(1, -1);
        let diff = hg.events_diff(&remote, 100).unwrap();
        let indexes: Vec<i64> = diff.iter().map(|e| e.body.index).collect();
        assert_eq!(indexes, vec![2, 3]);

        // The limit truncates from the oldest side.
        let diff = hg.events_diff(&remote, 1).unwrap();
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].body.index, 2);
    }

    #[test]
    fn own_ancestry_gives_self_seeing() {
        let (mut hg, keys) = engine(2);
        let a = &keys[0];
        let b = &keys[1];
        let a_root = Event::root_self_parent(&a.public_key());
        let b_root = Event::root_self_parent(&b.public_key());

        let a0 = hg.insert_event(signed_event(a, a_root, None, 0, 1)).unwrap();
        let b0 = hg
            .insert_event(signed_event(b, b_root, Some(a0), 0, 2))
            .unwrap();

        let b0_meta = hg.meta(&b0).unwrap();
        // b0 has a0 as ancestor; its last-ancestor entry for creator 0
        // reaches index 0.
        assert_eq!(b0_meta.last_ancestors[&0].index, 0);
        // a0 learned of its first descendant by creator 1.
        let a0_meta = hg.meta(&a0).unwrap();
        assert_eq!(a0_meta.first_descendants[&1].index, 0);
    }
}
