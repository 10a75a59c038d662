//! In-memory store over bounded LRU caches.

use crate::{sort_topologically, Store, StoreError};
use filament_types::{
    Block, Event, Frame, Hash, KnownEvents, Peer, PeerSet, Root, RoundInfo, ROOT_INDEX,
};
use lru::LruCache;
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;

fn lru_cap(size: usize) -> NonZeroUsize {
    NonZeroUsize::new(size.max(1)).unwrap_or(NonZeroUsize::MIN)
}

/// Store backed entirely by memory.
///
/// Events, rounds, frames and blocks live in LRU caches of `cache_size`
/// entries; entities that consensus has fully processed may be evicted.
/// Membership, roots and the participant index chains are small and kept
/// unbounded.
pub struct InmemStore {
    cache_size: usize,
    events: LruCache<Hash, Event>,
    rounds: LruCache<u64, RoundInfo>,
    blocks: LruCache<u64, Block>,
    frames: LruCache<u64, Frame>,
    /// creator pubkey hex → (index → hash), the primary chain.
    participant: BTreeMap<String, BTreeMap<i64, Hash>>,
    roots: HashMap<String, Root>,
    /// activation round → peer set.
    peer_sets: BTreeMap<u64, PeerSet>,
    repertoire: HashMap<String, Peer>,
    last_round: Option<u64>,
    last_consensus_round: Option<u64>,
    last_block: Option<u64>,
}

impl InmemStore {
    pub fn new(cache_size: usize) -> Self {
        InmemStore {
            cache_size,
            events: LruCache::new(lru_cap(cache_size)),
            rounds: LruCache::new(lru_cap(cache_size)),
            blocks: LruCache::new(lru_cap(cache_size)),
            frames: LruCache::new(lru_cap(cache_size)),
            participant: BTreeMap::new(),
            roots: HashMap::new(),
            peer_sets: BTreeMap::new(),
            repertoire: HashMap::new(),
            last_round: None,
            last_consensus_round: None,
            last_block: None,
        }
    }

    /// Seed with the genesis peer set, active from round 0.
    pub fn with_genesis_peers(cache_size: usize, peers: &PeerSet) -> Result<Self, StoreError> {
        let mut store = Self::new(cache_size);
        store.set_peer_set(0, peers)?;
        Ok(store)
    }

    // Cache-population entry points for the persistent layer: they fill the
    // LRU without touching index chains or high-water marks.

    pub(crate) fn cache_event(&mut self, hash: Hash, event: Event) {
        self.events.put(hash, event);
    }

    pub(crate) fn cache_round(&mut self, index: u64, round: RoundInfo) {
        self.rounds.put(index, round);
    }

    pub(crate) fn cache_block(&mut self, index: u64, block: Block) {
        self.blocks.put(index, block);
    }

    pub(crate) fn cache_frame(&mut self, round: u64, frame: Frame) {
        self.frames.put(round, frame);
    }

    pub(crate) fn load_participant(&mut self, creator: &str, index: i64, hash: Hash) {
        self.participant
            .entry(creator.to_string())
            .or_default()
            .insert(index, hash);
    }

    pub(crate) fn set_marks(
        &mut self,
        last_round: Option<u64>,
        last_consensus_round: Option<u64>,
        last_block: Option<u64>,
    ) {
        self.last_round = last_round;
        self.last_consensus_round = last_consensus_round;
        self.last_block = last_block;
    }

    fn next_index_for(&self, creator: &str) -> i64 {
        if let Some(chain) = self.participant.get(creator) {
            if let Some(&last) = chain.keys().next_back() {
                return last + 1;
            }
        }
        match self.roots.get(creator) {
            Some(root) => root.index + 1,
            None => 0,
        }
    }
}

impl Store for InmemStore {
    fn cache_size(&self) -> usize {
        self.cache_size
    }

    fn get_event(&mut self, hash: &Hash) -> Result<Event, StoreError> {
        self.events
            .get(hash)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("event {hash:?}")))
    }

    fn has_event(&mut self, hash: &Hash) -> bool {
        self.events.contains(hash)
    }

    fn set_event(&mut self, event: &Event) -> Result<(), StoreError> {
        let hash = event.hash().map_err(|e| StoreError::Db(e.to_string()))?;
        let creator = event.creator_hex();
        let expected = self.next_index_for(&creator);
        if event.body.index == expected {
            self.participant
                .entry(creator)
                .or_default()
                .insert(event.body.index, hash);
        }
        self.events.put(hash, event.clone());
        Ok(())
    }

    fn participant_event(&mut self, creator: &str, index: i64) -> Result<Hash, StoreError> {
        self.participant
            .get(creator)
            .and_then(|chain| chain.get(&index))
            .copied()
            .ok_or_else(|| StoreError::NotFound(format!("event {index} of {creator}")))
    }

    fn participant_events(&mut self, creator: &str, after: i64) -> Result<Vec<Hash>, StoreError> {
        Ok(self
            .participant
            .get(creator)
            .map(|chain| {
                chain
                    .range(after + 1..)
                    .map(|(_, h)| *h)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default())
    }

    fn last_event_from(&mut self, creator: &str) -> Result<Option<Hash>, StoreError> {
        Ok(self
            .participant
            .get(creator)
            .and_then(|chain| chain.values().next_back())
            .copied())
    }

    fn known_events(&mut self) -> KnownEvents {
        let mut known = KnownEvents::new();
        for (pubkey, peer) in &self.repertoire {
            let index = self
                .participant
                .get(pubkey)
                .and_then(|chain| chain.keys().next_back().copied())
                .or_else(|| self.roots.get(pubkey).map(|r| r.index))
                .unwrap_or(ROOT_INDEX);
            known.insert(peer.id, index);
        }
        known
    }

    fn get_round(&mut self, index: u64) -> Result<RoundInfo, StoreError> {
        self.rounds
            .get(&index)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("round {index}")))
    }

    fn set_round(&mut self, index: u64, round: &RoundInfo) -> Result<(), StoreError> {
        self.rounds.put(index, round.clone());
        self.last_round = Some(self.last_round.map_or(index, |r| r.max(index)));
        Ok(())
    }

    fn last_round(&self) -> Option<u64> {
        self.last_round
    }

    fn last_consensus_round(&self) -> Option<u64> {
        self.last_consensus_round
    }

    fn set_last_consensus_round(&mut self, round: u64) -> Result<(), StoreError> {
        self.last_consensus_round = Some(round);
        Ok(())
    }

    fn get_frame(&mut self, round: u64) -> Result<Frame, StoreError> {
        self.frames
            .get(&round)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("frame {round}")))
    }

    fn set_frame(&mut self, frame: &Frame) -> Result<(), StoreError> {
        self.frames.put(frame.round, frame.clone());
        Ok(())
    }

    fn get_block(&mut self, index: u64) -> Result<Block, StoreError> {
        self.blocks
            .get(&index)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("block {index}")))
    }

    fn set_block(&mut self, block: &Block) -> Result<(), StoreError> {
        let index = block.index();
        self.blocks.put(index, block.clone());
        self.last_block = Some(self.last_block.map_or(index, |b| b.max(index)));
        Ok(())
    }

    fn last_block_index(&self) -> Option<u64> {
        self.last_block
    }

    fn get_peer_set(&mut self, round: u64) -> Result<PeerSet, StoreError> {
        self.peer_sets
            .range(..=round)
            .next_back()
            .map(|(_, ps)| ps.clone())
            .ok_or_else(|| StoreError::NotFound(format!("peer set at round {round}")))
    }

    fn set_peer_set(&mut self, round: u64, peers: &PeerSet) -> Result<(), StoreError> {
        for peer in peers.iter() {
            self.repertoire
                .entry(peer.pub_key_hex.clone())
                .or_insert_with(|| peer.clone());
            if !self.roots.contains_key(&peer.pub_key_hex) {
                let pk = peer
                    .public_key()
                    .map_err(|e| StoreError::Db(e.to_string()))?;
                self.roots
                    .insert(peer.pub_key_hex.clone(), Root::for_creator(&pk));
            }
        }
        self.peer_sets.insert(round, peers.clone());
        Ok(())
    }

    fn peer_set_activation_rounds(&self) -> Vec<u64> {
        self.peer_sets.keys().copied().collect()
    }

    fn repertoire(&self) -> HashMap<String, Peer> {
        self.repertoire.clone()
    }

    fn get_root(&mut self, creator: &str) -> Result<Root, StoreError> {
        self.roots
            .get(creator)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("root of {creator}")))
    }

    fn set_root(&mut self, creator: &str, root: &Root) -> Result<(), StoreError> {
        self.roots.insert(creator.to_string(), root.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    fn is_persistent(&self) -> bool {
        false
    }

    fn topological_events(&mut self) -> Result<Vec<Event>, StoreError> {
        let events: Vec<Event> = self.events.iter().map(|(_, e)| e.clone()).collect();
        sort_topologically(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filament_types::test_utils::{test_keypair, test_peer_set};

    fn make_event(seed: u8, index: i64, self_parent: Hash) -> Event {
        let key = test_keypair(seed);
        let mut e = Event::new(
            vec![],
            vec![],
            vec![],
            self_parent,
            None,
            key.public_key(),
            index,
            1000 + index,
        );
        e.sign(&key).unwrap();
        e
    }

    #[test]
    fn event_round_trip_and_duplicate() {
        let (peers, keys) = test_peer_set(3);
        let mut store = InmemStore::with_genesis_peers(100, &peers).unwrap();

        let creator = keys[0].public_key();
        let e0 = make_event(0, 0, Event::root_self_parent(&creator));
        let h0 = e0.hash().unwrap();

        store.set_event(&e0).unwrap();
        store.set_event(&e0).unwrap();
        assert_eq!(store.get_event(&h0).unwrap(), e0);
        assert_eq!(
            store.participant_event(&creator.to_hex(), 0).unwrap(),
            h0
        );
    }

    #[test]
    fn known_events_tracks_heads() {
        let (peers, keys) = test_peer_set(3);
        let mut store = InmemStore::with_genesis_peers(100, &peers).unwrap();

        let known = store.known_events();
        assert_eq!(known.len(), 3);
        assert!(known.values().all(|&i| i == -1));

        let creator = keys[1].public_key();
        let e0 = make_event(1, 0, Event::root_self_parent(&creator));
        let h0 = e0.hash().unwrap();
        store.set_event(&e0).unwrap();
        let e1 = make_event(1, 1, h0);
        store.set_event(&e1).unwrap();

        let peer_id = peers.get_by_pubkey(&creator.to_hex()).unwrap().id;
        assert_eq!(store.known_events()[&peer_id], 1);
    }

    #[test]
    fn missing_keys_are_not_found() {
        let mut store = InmemStore::new(10);
        assert!(store.get_event(&Hash::digest(b"nope")).unwrap_err().is_not_found());
        assert!(store.get_round(7).unwrap_err().is_not_found());
        assert!(store.get_block(0).unwrap_err().is_not_found());
        assert!(store.get_peer_set(0).unwrap_err().is_not_found());
    }

    #[test]
    fn peer_set_history_selects_by_round() {
        let (genesis, _) = test_peer_set(3);
        let mut store = InmemStore::with_genesis_peers(100, &genesis).unwrap();

        let grown = genesis.with_new_peer(filament_types::test_utils::test_peer(7));
        store.set_peer_set(10, &grown).unwrap();

        assert_eq!(store.get_peer_set(0).unwrap().len(), 3);
        assert_eq!(store.get_peer_set(9).unwrap().len(), 3);
        assert_eq!(store.get_peer_set(10).unwrap().len(), 4);
        assert_eq!(store.get_peer_set(99).unwrap().len(), 4);
        assert_eq!(store.peer_set_activation_rounds(), vec![0, 10]);
    }

    #[test]
    fn fork_does_not_displace_primary_chain() {
        let (peers, keys) = test_peer_set(3);
        let mut store = InmemStore::with_genesis_peers(100, &peers).unwrap();

        let creator = keys[2].public_key();
        let root = Event::root_self_parent(&creator);
        let e0 = make_event(2, 0, root);
        let h0 = e0.hash().unwrap();
        store.set_event(&e0).unwrap();

        // Same creator, same index, different body: a fork.
        let key = test_keypair(2);
        let mut fork = Event::new(
            vec![b"fork".to_vec()],
            vec![],
            vec![],
            root,
            None,
            creator,
            0,
            9999,
        );
        fork.sign(&key).unwrap();
        store.set_event(&fork).unwrap();

        // Both retrievable by hash, primary index unchanged.
        assert!(store.has_event(&fork.hash().unwrap()));
        assert_eq!(store.participant_event(&creator.to_hex(), 0).unwrap(), h0);
    }
}
